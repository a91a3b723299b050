use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// One fetch intention. Requests reference their owning [`Task`](crate::Task)
/// by name and are resolved through the registry at dispatch time, so the
/// struct itself stays cheap to clone and serialize.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub url: String,
    pub method: String,
    /// Owning task name.
    pub task: String,
    pub depth: u32,
    /// Only two bands matter: >0 is high priority, everything else normal.
    pub priority: i32,
    /// Keys into the task's rule trunk.
    pub rule: String,
    /// Grants exactly one retry after a failed fetch.
    #[serde(default)]
    pub reload: bool,
    /// Parser-stage handoff values, e.g. a title discovered on a list page
    /// that becomes a field of the detail-page record.
    #[serde(default)]
    pub temp: Temp,
}

impl Request {
    /// Dedup key: MD5 over URL and method, lowercase hex.
    pub fn fingerprint(&self) -> String {
        let digest = md5::compute(format!("{}{}", self.url, self.method));
        format!("{digest:x}")
    }

    /// A request deeper than its task allows fails instead of fetching.
    pub fn check_depth(&self, max_depth: u32) -> Result<()> {
        if self.depth > max_depth {
            return Err(Error::DepthLimit {
                depth: self.depth,
                max: max_depth,
            });
        }
        Ok(())
    }

    pub fn high_priority(&self) -> bool {
        self.priority > 0
    }
}

/// Small opaque map carried from one parse stage to the next.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Temp(HashMap<String, serde_json::Value>);

impl Temp {
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.0.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(|v| v.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(url: &str, method: &str) -> Request {
        Request {
            url: url.to_string(),
            method: method.to_string(),
            task: "t".to_string(),
            depth: 0,
            priority: 0,
            rule: "r".to_string(),
            reload: false,
            temp: Temp::default(),
        }
    }

    #[test]
    fn fingerprint_is_stable_lowercase_hex() {
        let a = request("https://a/", "GET");
        let b = request("https://a/", "GET");
        let fp = a.fingerprint();
        assert_eq!(fp, b.fingerprint());
        assert_eq!(fp.len(), 32);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn fingerprint_covers_method() {
        let get = request("https://a/", "GET");
        let post = request("https://a/", "POST");
        assert_ne!(get.fingerprint(), post.fingerprint());
    }

    #[test]
    fn depth_check() {
        let mut req = request("https://a/", "GET");
        req.depth = 3;
        assert!(req.check_depth(3).is_ok());
        assert!(matches!(
            req.check_depth(2),
            Err(Error::DepthLimit { depth: 3, max: 2 })
        ));
    }

    #[test]
    fn temp_round_trips_through_json() {
        let mut req = request("https://a/", "GET");
        req.temp.set("book_name", "Dune");
        let encoded = serde_json::to_string(&req).unwrap();
        let decoded: Request = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.temp.get_str("book_name"), Some("Dune"));
    }
}
