//! Leader election over etcd's election API.
//!
//! A [`Session`] is a lease kept alive in the background; a campaign runs
//! on top of it and blocks until this candidate holds the leader key. The
//! master's watch loop consumes the campaign result, the observe stream and
//! periodic leader queries to drive its state machine.

use std::time::Duration;

use etcd_client::ObserveStream;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::{map_election_error, CoordError, Result};
use crate::store::KvStore;

/// Election key owned by the election API; the value is the leader's ID.
pub const ELECTION_KEY: &str = "/crawler/election";

/// A lease with a background keepalive. Leadership lives and dies with it:
/// if the keepalive cannot refresh the lease, etcd drops the leader key and
/// the observe stream reports the change.
pub struct Session {
    lease_id: i64,
    keepalive: JoinHandle<()>,
}

impl Session {
    pub async fn start(store: &KvStore, ttl_secs: i64, cancel: CancellationToken) -> Result<Self> {
        let lease_id = store.grant_lease(ttl_secs).await?;
        let interval = Duration::from_secs((ttl_secs as u64 / 3).max(1));
        let client = store.client();

        let keepalive = tokio::spawn(async move {
            let (mut keeper, mut stream) = match client.clone().lease_keep_alive(lease_id).await {
                Ok(pair) => pair,
                Err(error) => {
                    warn!(%error, "election session keepalive failed to start");
                    return;
                }
            };
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        drop(client.clone().lease_revoke(lease_id).await);
                        return;
                    }
                    _ = tokio::time::sleep(interval) => {
                        if let Err(error) = keeper.keep_alive().await {
                            warn!(%error, "election session keepalive failed");
                            return;
                        }
                        match stream.message().await {
                            Ok(Some(_)) => {}
                            Ok(None) | Err(_) => {
                                warn!("election session lease lost");
                                return;
                            }
                        }
                    }
                }
            }
        });

        Ok(Self {
            lease_id,
            keepalive,
        })
    }

    pub fn lease_id(&self) -> i64 {
        self.lease_id
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.keepalive.abort();
    }
}

/// Block until this candidate acquires leadership, announcing `id` as the
/// leader value.
pub async fn campaign(store: &KvStore, key: &str, id: &str, session: &Session) -> Result<()> {
    store
        .client()
        .campaign(key, id, session.lease_id())
        .await
        .map_err(CoordError::from)?;
    Ok(())
}

/// Stream of leader changes for the election key.
pub async fn observe(store: &KvStore, key: &str) -> Result<ObserveStream> {
    Ok(store.client().observe(key).await?)
}

/// The currently proclaimed leader ID. Returns [`CoordError::NoLeader`]
/// when the election has no holder.
pub async fn current_leader(store: &KvStore, key: &str) -> Result<String> {
    let resp = store
        .client()
        .leader(key)
        .await
        .map_err(map_election_error)?;
    let kv = resp
        .kv()
        .ok_or_else(|| CoordError::NoLeader)?;
    Ok(String::from_utf8_lossy(kv.value()).to_string())
}
