use std::time::Duration;

use etcd_client::{
    Client, ConnectOptions, DeleteOptions, GetOptions, PutOptions, WatchOptions, WatchStream,
};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{CoordError, Result};

/// Thin typed wrapper over the etcd client.
///
/// Values are JSON; keys are absolute (`/resources/...`, `/registry/...`).
/// `Client` wraps an inner `Arc`, so cloning per call is cheap.
#[derive(Clone)]
pub struct KvStore {
    client: Client,
}

impl KvStore {
    pub async fn connect(endpoints: &[String], client_timeout: Duration) -> Result<Self> {
        let options = ConnectOptions::new().with_timeout(client_timeout);
        let client = Client::connect(endpoints, Some(options)).await?;
        Ok(Self { client })
    }

    pub fn client(&self) -> Client {
        self.client.clone()
    }

    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let resp = self.client.clone().get(key, None).await?;
        match resp.kvs().first() {
            Some(kv) => Ok(Some(serde_json::from_slice(kv.value())?)),
            None => Ok(None),
        }
    }

    /// List every entry under a prefix as `(key, value)` pairs.
    pub async fn list_json<T: DeserializeOwned>(&self, prefix: &str) -> Result<Vec<(String, T)>> {
        let options = GetOptions::new().with_prefix();
        let resp = self.client.clone().get(prefix, Some(options)).await?;
        let mut entries = Vec::with_capacity(resp.kvs().len());
        for kv in resp.kvs() {
            let key = kv
                .key_str()
                .map_err(|_| CoordError::InvalidState(format!("non-utf8 key under {prefix}")))?
                .to_string();
            entries.push((key, serde_json::from_slice(kv.value())?));
        }
        Ok(entries)
    }

    /// Number of keys under a prefix, without transferring values.
    pub async fn count_prefix(&self, prefix: &str) -> Result<i64> {
        let options = GetOptions::new().with_prefix().with_count_only();
        let resp = self.client.clone().get(prefix, Some(options)).await?;
        Ok(resp.count())
    }

    pub async fn put_json<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        lease_id: Option<i64>,
    ) -> Result<()> {
        let value = serde_json::to_string(value)?;
        let options = lease_id.map(|id| PutOptions::new().with_lease(id));
        self.client.clone().put(key, value, options).await?;
        Ok(())
    }

    pub async fn delete(&self, key: &str) -> Result<()> {
        self.client.clone().delete(key, None).await?;
        Ok(())
    }

    pub async fn delete_prefix(&self, prefix: &str) -> Result<()> {
        let options = DeleteOptions::new().with_prefix();
        self.client.clone().delete(prefix, Some(options)).await?;
        Ok(())
    }

    /// Subscribe to every change under a prefix.
    pub async fn watch_prefix(&self, prefix: &str) -> Result<WatchStream> {
        let options = WatchOptions::new().with_prefix();
        let stream = self.client.clone().watch(prefix, Some(options)).await?;
        Ok(stream)
    }

    pub async fn grant_lease(&self, ttl_secs: i64) -> Result<i64> {
        let resp = self.client.clone().lease_grant(ttl_secs, None).await?;
        Ok(resp.id())
    }

    pub async fn revoke_lease(&self, lease_id: i64) -> Result<()> {
        self.client.clone().lease_revoke(lease_id).await?;
        Ok(())
    }
}
