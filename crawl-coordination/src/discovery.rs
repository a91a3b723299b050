//! Service discovery over etcd leases.
//!
//! Workers register under `/registry/{service}/{id}` with a TTL lease kept
//! alive on an interval; the master watches the prefix and folds PUT/DELETE
//! events into join/leave notifications.

use std::time::Duration;

use etcd_client::EventType;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::store::KvStore;

pub const REGISTRY_PREFIX: &str = "/registry";

/// One registered node: service-assigned identity plus its listen address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub id: String,
    pub address: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeEvent {
    Join(NodeRecord),
    Leave(String),
}

pub fn service_prefix(service: &str) -> String {
    format!("{REGISTRY_PREFIX}/{service}/")
}

pub fn node_key(service: &str, id: &str) -> String {
    format!("{REGISTRY_PREFIX}/{service}/{id}")
}

/// Current membership of a service.
pub async fn list_nodes(store: &KvStore, service: &str) -> Result<Vec<NodeRecord>> {
    let entries: Vec<(String, NodeRecord)> = store.list_json(&service_prefix(service)).await?;
    Ok(entries.into_iter().map(|(_, node)| node).collect())
}

/// Keep this node registered until cancelled.
///
/// Grants a lease, writes the node record under it, and refreshes the lease
/// on `interval`. If the keepalive stream dies (etcd restart, lease expiry)
/// the whole registration is re-established from scratch.
pub async fn register_node(
    store: KvStore,
    service: String,
    record: NodeRecord,
    ttl: Duration,
    interval: Duration,
    cancel: CancellationToken,
) -> Result<JoinHandle<()>> {
    let key = node_key(&service, &record.id);
    let lease_id = establish(&store, &key, &record, ttl).await?;
    info!(key = %key, address = %record.address, "registered in discovery");

    let handle = tokio::spawn(async move {
        let mut lease_id = lease_id;
        loop {
            match keep_alive(&store, lease_id, interval, &cancel).await {
                KeepAliveEnd::Cancelled => {
                    drop(store.revoke_lease(lease_id).await);
                    drop(store.delete(&key).await);
                    info!(key = %key, "deregistered from discovery");
                    return;
                }
                KeepAliveEnd::Lost(error) => {
                    warn!(key = %key, %error, "registration lease lost, re-registering");
                }
            }
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(interval) => {}
                }
                match establish(&store, &key, &record, ttl).await {
                    Ok(id) => {
                        lease_id = id;
                        info!(key = %key, "re-registered in discovery");
                        break;
                    }
                    Err(error) => warn!(key = %key, %error, "re-registration failed"),
                }
            }
        }
    });
    Ok(handle)
}

async fn establish(store: &KvStore, key: &str, record: &NodeRecord, ttl: Duration) -> Result<i64> {
    let lease_id = store.grant_lease(ttl.as_secs() as i64).await?;
    store.put_json(key, record, Some(lease_id)).await?;
    Ok(lease_id)
}

enum KeepAliveEnd {
    Cancelled,
    Lost(crate::CoordError),
}

async fn keep_alive(
    store: &KvStore,
    lease_id: i64,
    interval: Duration,
    cancel: &CancellationToken,
) -> KeepAliveEnd {
    let (mut keeper, mut stream) = match store.client().lease_keep_alive(lease_id).await {
        Ok(pair) => pair,
        Err(error) => return KeepAliveEnd::Lost(error.into()),
    };

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return KeepAliveEnd::Cancelled,
            _ = tokio::time::sleep(interval) => {
                if let Err(error) = keeper.keep_alive().await {
                    return KeepAliveEnd::Lost(error.into());
                }
                match stream.message().await {
                    Ok(Some(_)) => {}
                    Ok(None) => {
                        return KeepAliveEnd::Lost(crate::CoordError::InvalidState(
                            "keepalive stream closed".to_string(),
                        ))
                    }
                    Err(error) => return KeepAliveEnd::Lost(error.into()),
                }
            }
        }
    }
}

/// Long-lived membership subscriber.
///
/// Forwards every join/leave under the service prefix to `events`. Watch
/// errors are logged and the subscription is re-established; permanent
/// registry failure is not modeled.
pub fn watch_nodes(
    store: KvStore,
    service: String,
    events: mpsc::Sender<NodeEvent>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let prefix = service_prefix(&service);
        loop {
            if cancel.is_cancelled() {
                return;
            }
            let mut stream = match store.watch_prefix(&prefix).await {
                Ok(stream) => stream,
                Err(error) => {
                    warn!(%error, "node watch failed, retrying");
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(Duration::from_secs(1)) => continue,
                    }
                }
            };
            debug!(prefix = %prefix, "watching service membership");

            loop {
                let message = tokio::select! {
                    _ = cancel.cancelled() => return,
                    message = stream.message() => message,
                };
                let resp = match message {
                    Ok(Some(resp)) => resp,
                    Ok(None) => break,
                    Err(error) => {
                        warn!(%error, "node watch stream error, resubscribing");
                        break;
                    }
                };
                for event in resp.events() {
                    let Some(kv) = event.kv() else { continue };
                    let forwarded = match event.event_type() {
                        EventType::Put => match serde_json::from_slice(kv.value()) {
                            Ok(node) => NodeEvent::Join(node),
                            Err(error) => {
                                warn!(%error, "malformed node record, skipping");
                                continue;
                            }
                        },
                        EventType::Delete => {
                            let key = String::from_utf8_lossy(kv.key());
                            let id = key.rsplit('/').next().unwrap_or_default().to_string();
                            NodeEvent::Leave(id)
                        }
                    };
                    if events.send(forwarded).await.is_err() {
                        return;
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_namespaced_by_service() {
        assert_eq!(service_prefix("crawler-worker"), "/registry/crawler-worker/");
        assert_eq!(
            node_key("crawler-worker", "worker-1"),
            "/registry/crawler-worker/worker-1"
        );
    }

    #[test]
    fn node_record_round_trips() {
        let node = NodeRecord {
            id: "worker-1".to_string(),
            address: "10.0.0.5:8080".to_string(),
        };
        let encoded = serde_json::to_string(&node).unwrap();
        let decoded: NodeRecord = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, node);
    }
}
