//! Master state and control loop.
//!
//! One master is elected leader over etcd; every master keeps watching the
//! worker fleet so promotion is cheap. Resources live under `/resources/`
//! in etcd and in an in-memory map guarded by a single master-wide lock;
//! the `ready` flag is a separate atomic for the hot read path.

use std::collections::HashMap;
use std::net::UdpSocket;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crawl_common::health::HealthHandle;
use crawl_coordination::discovery::{self, NodeEvent, NodeRecord};
use crawl_coordination::election::{self, Session, ELECTION_KEY};
use crawl_coordination::{CoordError, KvStore};

use crate::error::{MasterError, Result};
use crate::id::IdGenerator;

pub const RESOURCE_PREFIX: &str = "/resources/";

/// Cadence of the periodic leader sanity check.
const LEADER_CHECK_PERIOD: Duration = Duration::from_secs(20);
/// Election session lease TTL.
const SESSION_TTL_SECS: i64 = 5;

pub fn resource_key(name: &str) -> String {
    format!("{RESOURCE_PREFIX}{name}")
}

/// One named crawl task as tracked by the master. Stored as JSON under
/// `/resources/{name}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSpec {
    #[serde(rename = "ID")]
    pub id: i64,
    #[serde(rename = "Name")]
    pub name: String,
    /// `"{workerID}|{workerAddress}"`, or empty while unassigned.
    #[serde(rename = "AssignedNode")]
    pub assigned_node: String,
    /// Nanoseconds since the unix epoch.
    #[serde(rename = "CreationTime")]
    pub creation_time: i64,
}

impl ResourceSpec {
    pub fn assigned_worker_id(&self) -> Option<&str> {
        self.assigned_node
            .split('|')
            .next()
            .filter(|id| !id.is_empty())
    }
}

fn assigned_node(node: &NodeRecord) -> String {
    format!("{}|{}", node.id, node.address)
}

fn now_ns() -> i64 {
    chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
}

/// A live worker plus the number of resources currently assigned to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerNode {
    pub node: NodeRecord,
    pub payload: i64,
}

/// Everything guarded by the master-wide lock.
#[derive(Default)]
pub struct MasterState {
    pub resources: HashMap<String, ResourceSpec>,
    pub workers: HashMap<String, WorkerNode>,
}

impl MasterState {
    /// Minimum-load placement: sort workers by payload ascending (id as a
    /// deterministic tie-break, since map order is not) and pick the head.
    pub fn pick_min_load(&self) -> Result<NodeRecord> {
        let mut workers: Vec<&WorkerNode> = self.workers.values().collect();
        workers.sort_by(|a, b| {
            a.payload
                .cmp(&b.payload)
                .then_with(|| a.node.id.cmp(&b.node.id))
        });
        workers
            .first()
            .map(|w| w.node.clone())
            .ok_or(MasterError::NoWorker)
    }

    /// Resources that need a new home: unassigned, or assigned to a worker
    /// that is no longer registered.
    pub fn orphaned(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .resources
            .values()
            .filter(|spec| match spec.assigned_worker_id() {
                None => true,
                Some(id) => !self.workers.contains_key(id),
            })
            .map(|spec| spec.name.clone())
            .collect();
        names.sort();
        names
    }

    /// Replace the worker map, keeping payloads at zero until retallied.
    pub fn set_workers(&mut self, nodes: Vec<NodeRecord>) {
        self.workers = nodes
            .into_iter()
            .map(|node| {
                (
                    node.id.clone(),
                    WorkerNode { node, payload: 0 },
                )
            })
            .collect();
    }

    /// Recount every live worker's payload from the resource map.
    pub fn retally(&mut self) {
        for worker in self.workers.values_mut() {
            worker.payload = 0;
        }
        let assigned: Vec<String> = self
            .resources
            .values()
            .filter_map(|spec| spec.assigned_worker_id().map(str::to_string))
            .collect();
        for id in assigned {
            if let Some(worker) = self.workers.get_mut(&id) {
                worker.payload += 1;
            }
        }
    }
}

pub struct MasterBuilder {
    seq: String,
    listen_address: String,
    worker_service: String,
    seeds: Vec<String>,
    node_number: u16,
    store: Option<KvStore>,
    liveness: Option<HealthHandle>,
}

impl Default for MasterBuilder {
    fn default() -> Self {
        Self {
            seq: "1".to_string(),
            listen_address: String::new(),
            worker_service: "crawler-worker".to_string(),
            seeds: Vec::new(),
            node_number: 1,
            store: None,
            liveness: None,
        }
    }
}

impl MasterBuilder {
    /// Master sequence number, combined with the local IPv4 and listen
    /// address into the campaign identity.
    pub fn seq(mut self, seq: impl Into<String>) -> Self {
        self.seq = seq.into();
        self
    }

    pub fn listen_address(mut self, address: impl Into<String>) -> Self {
        self.listen_address = address.into();
        self
    }

    /// Discovery service name the worker fleet registers under.
    pub fn worker_service(mut self, service: impl Into<String>) -> Self {
        self.worker_service = service.into();
        self
    }

    /// Seed task names admitted as resources at startup.
    pub fn seeds(mut self, seeds: Vec<String>) -> Self {
        self.seeds = seeds;
        self
    }

    pub fn node_number(mut self, node_number: u16) -> Self {
        self.node_number = node_number;
        self
    }

    pub fn store(mut self, store: KvStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn liveness(mut self, liveness: HealthHandle) -> Self {
        self.liveness = Some(liveness);
        self
    }

    pub fn build(self) -> Master {
        let id = format!(
            "master{}-{}{}",
            self.seq,
            local_ipv4(),
            self.listen_address
        );
        Master {
            id,
            seeds: self.seeds,
            worker_service: self.worker_service,
            store: self.store.expect("master requires a kv store"),
            ids: IdGenerator::new(self.node_number),
            ready: AtomicBool::new(false),
            leader_id: std::sync::Mutex::new(String::new()),
            state: Mutex::new(MasterState::default()),
            liveness: self.liveness,
        }
    }
}

pub struct Master {
    id: String,
    seeds: Vec<String>,
    worker_service: String,
    store: KvStore,
    ids: IdGenerator,
    /// 0/1 = follower/leader.
    ready: AtomicBool,
    leader_id: std::sync::Mutex<String>,
    state: Mutex<MasterState>,
    liveness: Option<HealthHandle>,
}

impl Master {
    pub fn builder() -> MasterBuilder {
        MasterBuilder::default()
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_leader(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub fn leader_id(&self) -> String {
        self.leader_id.lock().expect("leader id poisoned").clone()
    }

    pub async fn resources(&self) -> Vec<ResourceSpec> {
        let state = self.state.lock().await;
        state.resources.values().cloned().collect()
    }

    pub async fn workers(&self) -> Vec<WorkerNode> {
        let state = self.state.lock().await;
        state.workers.values().cloned().collect()
    }

    /// Admit a resource: pick the least-loaded live worker, persist the
    /// spec, update the in-memory maps. Callable from the command API and
    /// internally for seeds and re-assignment.
    pub async fn add_resource(&self, name: &str) -> Result<(ResourceSpec, NodeRecord)> {
        let mut state = self.state.lock().await;
        self.admit(&mut state, name.to_string()).await
    }

    pub async fn delete_resource(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        let spec = state
            .resources
            .get(name)
            .cloned()
            .ok_or_else(|| MasterError::NotFound(name.to_string()))?;
        // Drop the in-memory entry only once the kv delete went through,
        // so a failed call leaves both views consistent.
        self.store.delete(&resource_key(name)).await?;
        state.resources.remove(name);
        if let Some(worker_id) = spec.assigned_worker_id() {
            if let Some(worker) = state.workers.get_mut(worker_id) {
                worker.payload = (worker.payload - 1).max(0);
            }
        }
        info!(resource = %name, "resource deleted");
        Ok(())
    }

    async fn admit(
        &self,
        state: &mut MasterState,
        name: String,
    ) -> Result<(ResourceSpec, NodeRecord)> {
        let node = state.pick_min_load()?;
        let spec = ResourceSpec {
            id: self.ids.next(),
            name: name.clone(),
            assigned_node: assigned_node(&node),
            creation_time: now_ns(),
        };
        self.store
            .put_json(&resource_key(&name), &spec, None)
            .await?;
        state.resources.insert(name.clone(), spec.clone());
        if let Some(worker) = state.workers.get_mut(&node.id) {
            worker.payload += 1;
        }
        info!(resource = %name, node = %spec.assigned_node, "resource assigned");
        Ok((spec, node))
    }

    /// Admit each configured seed whose resource key is absent. Workers
    /// may not be up yet; in that case the resource is created unassigned
    /// and repaired by the next re-assignment.
    async fn add_seeds(&self) {
        for name in &self.seeds {
            match self.store.count_prefix(&resource_key(name)).await {
                Ok(0) => {}
                Ok(_) => {
                    debug!(seed = %name, "seed resource already present");
                    continue;
                }
                Err(error) => {
                    error!(seed = %name, %error, "seed existence check failed");
                    continue;
                }
            }

            let mut state = self.state.lock().await;
            match self.admit(&mut state, name.clone()).await {
                Ok(_) => {}
                Err(MasterError::NoWorker) => {
                    let spec = ResourceSpec {
                        id: self.ids.next(),
                        name: name.clone(),
                        assigned_node: String::new(),
                        creation_time: now_ns(),
                    };
                    match self.store.put_json(&resource_key(name), &spec, None).await {
                        Ok(()) => {
                            warn!(seed = %name, "no workers up, seed created unassigned");
                            state.resources.insert(name.clone(), spec);
                        }
                        Err(error) => error!(seed = %name, %error, "seed creation failed"),
                    }
                }
                Err(error) => error!(seed = %name, %error, "seed admission failed"),
            }
        }
    }

    /// Refresh the worker map from discovery, rebuild the resource map
    /// from the full `/resources/` scan, retally payloads, and re-admit
    /// every orphan. Runs on worker-membership change and on promotion.
    async fn refresh_and_reassign(&self) -> Result<()> {
        let nodes = discovery::list_nodes(&self.store, &self.worker_service).await?;
        let resources: Vec<(String, ResourceSpec)> =
            self.store.list_json(RESOURCE_PREFIX).await?;

        let mut state = self.state.lock().await;
        state.set_workers(nodes);
        state.resources = resources
            .into_iter()
            .map(|(_, spec)| (spec.name.clone(), spec))
            .collect();
        state.retally();
        metrics::gauge!("crawler_master_workers").set(state.workers.len() as f64);
        metrics::gauge!("crawler_master_resources").set(state.resources.len() as f64);

        for name in state.orphaned() {
            match self.admit(&mut state, name.clone()).await {
                Ok(_) => {
                    metrics::counter!("crawler_master_reassignments_total").increment(1);
                }
                Err(MasterError::NoWorker) => {
                    warn!(resource = %name, "no workers to re-assign to");
                    break;
                }
                Err(error) => error!(resource = %name, %error, "re-assignment failed"),
            }
        }
        Ok(())
    }

    /// Idempotent promotion: only the first transition out of follower
    /// rebuilds state and flips `ready`.
    async fn become_leader(&self) -> Result<()> {
        if self.is_leader() {
            return Ok(());
        }
        info!(id = %self.id, "promoting to leader");
        self.refresh_and_reassign().await?;
        self.ready.store(true, Ordering::Release);
        Ok(())
    }

    fn demote(&self, observed_leader: &str) {
        if self.ready.swap(false, Ordering::AcqRel) {
            warn!(leader = %observed_leader, "observed another leader, demoting");
        }
    }

    /// The master's lifetime loop: campaign results, leader observations,
    /// worker membership and the periodic leader check, all in one select.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<()> {
        self.add_seeds().await;

        let (campaign_tx, mut campaign_rx) = mpsc::channel(1);
        let mut campaign_cancel = cancel.child_token();
        self.spawn_campaign(campaign_tx.clone(), campaign_cancel.clone());

        let (leader_tx, mut leader_rx) = mpsc::channel(16);
        let _observer = spawn_leader_observer(self.store.clone(), leader_tx, cancel.clone());

        let (node_tx, mut node_rx) = mpsc::channel(16);
        let _watcher = discovery::watch_nodes(
            self.store.clone(),
            self.worker_service.clone(),
            node_tx,
            cancel.clone(),
        );

        let mut tick = tokio::time::interval(LEADER_CHECK_PERIOD);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),

                result = campaign_rx.recv() => match result {
                    Some(Ok(())) => {
                        info!(id = %self.id, "campaign won");
                        *self.leader_id.lock().expect("leader id poisoned") = self.id.clone();
                        if let Err(error) = self.become_leader().await {
                            error!(%error, "promotion failed");
                        }
                    }
                    Some(Err(error)) => {
                        error!(%error, "campaign failed, restarting");
                        campaign_cancel.cancel();
                        campaign_cancel = cancel.child_token();
                        self.spawn_campaign(campaign_tx.clone(), campaign_cancel.clone());
                    }
                    None => return Ok(()),
                },

                observed = leader_rx.recv() => {
                    // Only the periodic check below demotes; the stream
                    // just keeps the observed leader current.
                    if let Some(leader) = observed {
                        debug!(leader = %leader, "leader change observed");
                        *self.leader_id.lock().expect("leader id poisoned") = leader;
                    }
                }

                event = node_rx.recv() => {
                    if let Some(event) = event {
                        match &event {
                            NodeEvent::Join(node) => info!(id = %node.id, address = %node.address, "worker joined"),
                            NodeEvent::Leave(id) => info!(id = %id, "worker left"),
                        }
                        if let Err(error) = self.refresh_and_reassign().await {
                            error!(%error, "fleet refresh failed");
                        }
                    }
                }

                _ = tick.tick() => {
                    if let Some(liveness) = &self.liveness {
                        liveness.report_healthy().await;
                    }
                    match election::current_leader(&self.store, ELECTION_KEY).await {
                        Ok(leader) => {
                            if leader != self.id {
                                self.demote(&leader);
                            }
                            *self.leader_id.lock().expect("leader id poisoned") = leader;
                        }
                        Err(CoordError::NoLeader) => {
                            info!("election has no leader, campaigning");
                            campaign_cancel.cancel();
                            campaign_cancel = cancel.child_token();
                            self.spawn_campaign(campaign_tx.clone(), campaign_cancel.clone());
                        }
                        Err(error) => warn!(%error, "leader query failed"),
                    }
                }
            }
        }
    }

    /// Campaigns block until this master wins; the session (and therefore
    /// the leader key) is kept alive until the campaign token is cancelled.
    fn spawn_campaign(
        self: &Arc<Self>,
        results: mpsc::Sender<crawl_coordination::Result<()>>,
        cancel: CancellationToken,
    ) {
        let master = self.clone();
        tokio::spawn(async move {
            let session = match Session::start(&master.store, SESSION_TTL_SECS, cancel.clone()).await
            {
                Ok(session) => session,
                Err(error) => {
                    drop(results.send(Err(error)).await);
                    return;
                }
            };

            let result = tokio::select! {
                _ = cancel.cancelled() => return,
                result = election::campaign(&master.store, ELECTION_KEY, &master.id, &session) => result,
            };
            let won = result.is_ok();
            drop(results.send(result).await);
            if won {
                // Leadership lives as long as this session's lease.
                cancel.cancelled().await;
            }
        });
    }
}

/// Forward every observed leader value to the watch loop, resubscribing on
/// stream errors.
fn spawn_leader_observer(
    store: KvStore,
    leaders: mpsc::Sender<String>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            if cancel.is_cancelled() {
                return;
            }
            let mut stream = match election::observe(&store, ELECTION_KEY).await {
                Ok(stream) => stream,
                Err(error) => {
                    warn!(%error, "leader observation failed, retrying");
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(Duration::from_secs(1)) => continue,
                    }
                }
            };

            loop {
                let message = tokio::select! {
                    _ = cancel.cancelled() => return,
                    message = stream.message() => message,
                };
                match message {
                    Ok(Some(resp)) => {
                        if let Some(kv) = resp.kv() {
                            let leader = String::from_utf8_lossy(kv.value()).to_string();
                            if leaders.send(leader).await.is_err() {
                                return;
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(error) => {
                        warn!(%error, "leader observation stream error, resubscribing");
                        break;
                    }
                }
            }
        }
    })
}

/// First non-loopback IPv4, via the kernel's routing decision. No packet
/// is sent.
fn local_ipv4() -> String {
    UdpSocket::bind("0.0.0.0:0")
        .and_then(|socket| {
            socket.connect("8.8.8.8:80")?;
            socket.local_addr()
        })
        .map(|addr| addr.ip().to_string())
        .unwrap_or_else(|_| "127.0.0.1".to_string())
}
