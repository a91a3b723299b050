use std::collections::HashMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crawl_storage::DataCell;

use crate::error::Result;
use crate::request::Request;

/// What a parse pass produced: links to follow and records to persist.
#[derive(Debug, Default)]
pub struct ParseResult {
    pub requests: Vec<Request>,
    pub items: Vec<DataCell>,
}

/// Response bytes plus the request that fetched them, handed to parse rules.
pub struct Context<'a> {
    pub body: &'a [u8],
    pub request: &'a Request,
}

impl<'a> Context<'a> {
    pub fn body_str(&self) -> std::borrow::Cow<'a, str> {
        String::from_utf8_lossy(self.body)
    }

    /// Wrap rule output into a record stamped with task, rule, URL and time.
    pub fn output(&self, data: HashMap<String, serde_json::Value>) -> DataCell {
        DataCell {
            task: self.request.task.clone(),
            rule: self.request.rule.clone(),
            url: self.request.url.clone(),
            time: Utc::now().to_rfc3339(),
            data,
        }
    }
}

pub type NativeParseFn = fn(&Context<'_>) -> Result<ParseResult>;
pub type NativeRootFn = fn() -> Result<Vec<Request>>;

/// A parse rule body: either a compiled function or script source that is
/// evaluated in a fresh sandbox per call.
#[derive(Clone)]
pub enum ParseFunc {
    Native(NativeParseFn),
    Scripted(String),
}

/// Seed producer: either a compiled function or a Root script.
#[derive(Clone)]
pub enum RootFunc {
    Native(NativeRootFn),
    Scripted(String),
}

/// One named node of the rule tree.
#[derive(Clone)]
pub struct Rule {
    /// Column names for records this rule outputs. Empty for link-only rules.
    pub item_fields: Vec<String>,
    pub parse: ParseFunc,
}

impl Rule {
    pub fn new(parse: ParseFunc) -> Self {
        Self {
            item_fields: Vec::new(),
            parse,
        }
    }

    pub fn with_fields(parse: ParseFunc, fields: &[&str]) -> Self {
        Self {
            item_fields: fields.iter().map(|f| f.to_string()).collect(),
            parse,
        }
    }
}

/// Root produces the initial requests; the trunk maps rule names to rules.
#[derive(Clone, Default)]
pub struct RuleTree {
    pub root: Option<RootFunc>,
    pub trunk: HashMap<String, Rule>,
}

impl RuleTree {
    pub fn rule(&self, name: &str) -> Option<&Rule> {
        self.trunk.get(name)
    }

    /// Build a tree whose root and every rule are script sources.
    pub fn from_module(module: &TaskModule) -> Self {
        let trunk = module
            .rules
            .iter()
            .map(|r| {
                (
                    r.name.clone(),
                    Rule {
                        item_fields: r.item_fields.clone(),
                        parse: ParseFunc::Scripted(r.parse.clone()),
                    },
                )
            })
            .collect();
        Self {
            root: Some(RootFunc::Scripted(module.root.clone())),
            trunk,
        }
    }
}

/// A dynamically-supplied task definition: shared properties, a Root script
/// and named rule scripts. This is the wire shape for adding crawl targets
/// without redeploying.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskModule {
    pub name: String,
    #[serde(default)]
    pub cookie: String,
    #[serde(default)]
    pub wait_time: u64,
    #[serde(default)]
    pub max_depth: u32,
    pub root: String,
    #[serde(default)]
    pub rules: Vec<RuleModule>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleModule {
    pub name: String,
    #[serde(default)]
    pub item_fields: Vec<String>,
    pub parse: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::Temp;

    #[test]
    fn context_output_stamps_mandatory_fields() {
        let request = Request {
            url: "https://a/1".to_string(),
            method: "GET".to_string(),
            task: "books".to_string(),
            depth: 1,
            priority: 0,
            rule: "detail".to_string(),
            reload: false,
            temp: Temp::default(),
        };
        let ctx = Context {
            body: b"<html/>",
            request: &request,
        };

        let mut data = HashMap::new();
        data.insert("title".to_string(), serde_json::json!("Dune"));
        let cell = ctx.output(data);

        assert_eq!(cell.task, "books");
        assert_eq!(cell.rule, "detail");
        assert_eq!(cell.url, "https://a/1");
        assert!(!cell.time.is_empty());
        assert_eq!(cell.table_name(), "books");
    }

    #[test]
    fn module_builds_scripted_tree() {
        let module = TaskModule {
            name: "js_books".to_string(),
            cookie: String::new(),
            wait_time: 1,
            max_depth: 3,
            root: "add_requests([...])".to_string(),
            rules: vec![RuleModule {
                name: "list".to_string(),
                item_fields: vec!["title".to_string()],
                parse: "output_match(\"x\")".to_string(),
            }],
        };

        let tree = RuleTree::from_module(&module);
        assert!(matches!(tree.root, Some(RootFunc::Scripted(_))));
        let rule = tree.rule("list").unwrap();
        assert_eq!(rule.item_fields, vec!["title"]);
        assert!(matches!(rule.parse, ParseFunc::Scripted(_)));
    }
}
