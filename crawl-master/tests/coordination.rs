//! Integration tests against a real etcd. Run them with
//! `cargo test -p crawl-master -- --ignored` after starting etcd on
//! `localhost:2379`; they share the fixed key layout and clean it first.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crawl_coordination::discovery::{self, NodeRecord};
use crawl_coordination::election::ELECTION_KEY;
use crawl_coordination::KvStore;
use crawl_master::master::{resource_key, RESOURCE_PREFIX};
use crawl_master::{Master, ResourceSpec};

const ETCD_ENDPOINT: &str = "http://localhost:2379";
const WAIT_TIMEOUT: Duration = Duration::from_secs(15);

async fn connect() -> KvStore {
    KvStore::connect(&[ETCD_ENDPOINT.to_string()], Duration::from_secs(5))
        .await
        .expect("failed to connect to etcd")
}

async fn clean(store: &KvStore, service: &str) {
    store
        .delete_prefix(RESOURCE_PREFIX)
        .await
        .expect("failed to clean resources");
    store
        .delete_prefix(&discovery::service_prefix(service))
        .await
        .expect("failed to clean registry");
    store
        .delete_prefix(ELECTION_KEY)
        .await
        .expect("failed to clean election key");
}

async fn put_worker(store: &KvStore, service: &str, id: &str) {
    let record = NodeRecord {
        id: id.to_string(),
        address: format!("10.0.0.1:90{id}"),
    };
    store
        .put_json(&discovery::node_key(service, id), &record, None)
        .await
        .expect("failed to register worker");
}

async fn put_resource(store: &KvStore, name: &str, assigned: &str) {
    let spec = ResourceSpec {
        id: 1,
        name: name.to_string(),
        assigned_node: assigned.to_string(),
        creation_time: 0,
    };
    store
        .put_json(&resource_key(name), &spec, None)
        .await
        .expect("failed to persist resource");
}

async fn wait_for_leadership(master: &Arc<Master>) {
    let start = Instant::now();
    while !master.is_leader() {
        assert!(
            start.elapsed() < WAIT_TIMEOUT,
            "master did not become leader in time"
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

#[tokio::test]
#[ignore = "requires etcd on localhost:2379"]
async fn promotion_rebuilds_state_from_the_kv_store() {
    let service = "it-promotion-worker";
    let store = connect().await;
    clean(&store, service).await;

    put_worker(&store, service, "1").await;
    put_resource(&store, "alpha", "1|10.0.0.1:901").await;
    put_resource(&store, "beta", "1|10.0.0.1:901").await;

    let master = Arc::new(
        Master::builder()
            .seq("10")
            .listen_address(":9100")
            .worker_service(service)
            .store(store.clone())
            .build(),
    );
    let cancel = CancellationToken::new();
    let handle = tokio::spawn(master.clone().run(cancel.clone()));

    wait_for_leadership(&master).await;

    let resources: HashSet<(String, String)> = master
        .resources()
        .await
        .into_iter()
        .map(|spec| (spec.name, spec.assigned_node))
        .collect();
    let expected: HashSet<(String, String)> = [
        ("alpha".to_string(), "1|10.0.0.1:901".to_string()),
        ("beta".to_string(), "1|10.0.0.1:901".to_string()),
    ]
    .into_iter()
    .collect();
    assert_eq!(resources, expected);

    cancel.cancel();
    drop(handle.await);
    clean(&store, service).await;
}

#[tokio::test]
#[ignore = "requires etcd on localhost:2379"]
async fn admission_lands_on_the_least_loaded_worker() {
    let service = "it-minload-worker";
    let store = connect().await;
    clean(&store, service).await;

    for id in ["1", "2", "3"] {
        put_worker(&store, service, id).await;
    }
    // Payloads after the promotion retally: worker 1 -> 2, worker 2 -> 0,
    // worker 3 -> 1.
    put_resource(&store, "a", "1|10.0.0.1:901").await;
    put_resource(&store, "b", "1|10.0.0.1:901").await;
    put_resource(&store, "c", "3|10.0.0.1:903").await;

    let master = Arc::new(
        Master::builder()
            .seq("11")
            .listen_address(":9101")
            .worker_service(service)
            .store(store.clone())
            .build(),
    );
    let cancel = CancellationToken::new();
    let handle = tokio::spawn(master.clone().run(cancel.clone()));

    wait_for_leadership(&master).await;

    let (spec, node) = master.add_resource("x").await.expect("admission failed");
    assert_eq!(node.id, "2");
    assert_eq!(spec.assigned_node, format!("2|{}", node.address));

    let workers = master.workers().await;
    let assigned = workers.iter().find(|w| w.node.id == "2").unwrap();
    assert_eq!(assigned.payload, 1);

    // The spec landed in the kv store too.
    let persisted: Option<ResourceSpec> = store
        .get_json(&resource_key("x"))
        .await
        .expect("kv read failed");
    assert_eq!(persisted.unwrap().assigned_node, spec.assigned_node);

    cancel.cancel();
    drop(handle.await);
    clean(&store, service).await;
}
