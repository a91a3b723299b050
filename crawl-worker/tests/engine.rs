//! End-to-end engine scenarios against stub fetchers and in-memory storage.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use crawl_common::{
    Context, Error, Fetcher, MultiLimiter, ParseFunc, ParseResult, Request, Result, RootFunc,
    Rule, RuleTree, Task, TaskRegistry, Temp,
};
use crawl_storage::{DataCell, Storage, StorageError};
use crawl_worker::Crawler;

#[derive(Default)]
struct StubFetcher {
    calls: Mutex<Vec<String>>,
    fail_all: bool,
}

impl StubFetcher {
    fn failing() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            fail_all: true,
        }
    }

    fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl Fetcher for StubFetcher {
    async fn get(&self, request: &Request, _cookie: &str) -> Result<Bytes> {
        self.calls.lock().unwrap().push(request.url.clone());
        if self.fail_all {
            return Err(Error::Fetch(Box::new(std::io::Error::other("boom"))));
        }
        Ok(Bytes::from_static(b"<html>stub page</html>"))
    }
}

#[derive(Default)]
struct MemStorage {
    cells: Mutex<Vec<DataCell>>,
}

#[async_trait]
impl Storage for MemStorage {
    async fn save(&self, cells: Vec<DataCell>) -> std::result::Result<(), StorageError> {
        self.cells.lock().unwrap().extend(cells);
        Ok(())
    }
}

fn request(url: &str, rule: &str, depth: u32) -> Request {
    Request {
        url: url.to_string(),
        method: "GET".to_string(),
        task: String::new(),
        depth,
        priority: 0,
        rule: rule.to_string(),
        reload: false,
        temp: Temp::default(),
    }
}

fn parse_nothing(_ctx: &Context<'_>) -> Result<ParseResult> {
    Ok(ParseResult::default())
}

fn parse_one_item(ctx: &Context<'_>) -> Result<ParseResult> {
    let mut data = HashMap::new();
    data.insert("title".to_string(), serde_json::json!("stub title"));
    Ok(ParseResult {
        requests: Vec::new(),
        items: vec![ctx.output(data)],
    })
}

fn root_duplicate_pair() -> Result<Vec<Request>> {
    Ok(vec![
        request("https://a/", "noop", 0),
        request("https://a/", "noop", 0),
    ])
}

fn root_too_deep() -> Result<Vec<Request>> {
    Ok(vec![request("https://deep/", "noop", 3)])
}

fn root_single() -> Result<Vec<Request>> {
    Ok(vec![request("https://single/", "noop", 0)])
}

fn root_detail() -> Result<Vec<Request>> {
    Ok(vec![request("https://detail/1", "detail", 0)])
}

fn root_unknown_rule() -> Result<Vec<Request>> {
    Ok(vec![request("https://nowhere/", "missing", 0)])
}

struct Setup {
    registry: Arc<TaskRegistry>,
    fetcher: Arc<StubFetcher>,
    storage: Arc<MemStorage>,
}

fn setup(name: &str, fetcher: StubFetcher, reload: bool, max_depth: u32, root: RootFunc) -> Setup {
    let fetcher = Arc::new(fetcher);
    let storage = Arc::new(MemStorage::default());

    let mut tree = RuleTree {
        root: Some(root),
        trunk: HashMap::new(),
    };
    tree.trunk
        .insert("noop".to_string(), Rule::new(ParseFunc::Native(parse_nothing)));
    tree.trunk.insert(
        "detail".to_string(),
        Rule::with_fields(ParseFunc::Native(parse_one_item), &["title"]),
    );

    let registry = Arc::new(TaskRegistry::new());
    registry.add(
        Task::builder(name)
            .reload(reload)
            .max_depth(max_depth)
            .fetcher(fetcher.clone())
            .storage(storage.clone())
            .limiter(Arc::new(MultiLimiter::unlimited()))
            .rule_tree(tree)
            .build(),
    );

    Setup {
        registry,
        fetcher,
        storage,
    }
}

async fn run_for(crawler: Crawler, millis: u64) {
    let cancel = CancellationToken::new();
    let stop = cancel.clone();
    let handle = tokio::spawn(crawler.run(cancel));
    tokio::time::sleep(Duration::from_millis(millis)).await;
    stop.cancel();
    drop(handle.await);
}

#[tokio::test]
async fn duplicate_requests_fetch_once() {
    let setup = setup(
        "dupes",
        StubFetcher::default(),
        false,
        5,
        RootFunc::Native(root_duplicate_pair),
    );

    let crawler = Crawler::builder()
        .registry(setup.registry.clone())
        .seeds(vec!["dupes".to_string()])
        .work_count(2)
        .build();
    let monitor = crawler.monitor();
    run_for(crawler, 300).await;

    assert_eq!(setup.fetcher.call_count(), 1);
    // The fetched request was marked before its fetch.
    let fingerprint = request("https://a/", "noop", 0).fingerprint();
    assert!(monitor.visited_contains(&fingerprint));
}

#[tokio::test]
async fn requests_beyond_max_depth_never_fetch() {
    let setup = setup(
        "shallow",
        StubFetcher::default(),
        false,
        2,
        RootFunc::Native(root_too_deep),
    );

    let crawler = Crawler::builder()
        .registry(setup.registry.clone())
        .seeds(vec!["shallow".to_string()])
        .build();
    run_for(crawler, 200).await;

    assert_eq!(setup.fetcher.call_count(), 0);
    assert!(setup.storage.cells.lock().unwrap().is_empty());
}

#[tokio::test]
async fn reload_grants_exactly_one_retry() {
    let setup = setup(
        "retry",
        StubFetcher::failing(),
        true,
        5,
        RootFunc::Native(root_single),
    );

    let crawler = Crawler::builder()
        .registry(setup.registry.clone())
        .seeds(vec!["retry".to_string()])
        .build();
    let monitor = crawler.monitor();
    run_for(crawler, 400).await;

    // First failure re-enqueues once; the second files it for good.
    assert_eq!(setup.fetcher.call_count(), 2);
    assert_eq!(monitor.failure_count(), 1);
    assert_eq!(monitor.failed_urls(), vec!["https://single/".to_string()]);
}

#[tokio::test]
async fn failures_without_reload_are_filed_immediately() {
    let setup = setup(
        "no-retry",
        StubFetcher::failing(),
        false,
        5,
        RootFunc::Native(root_single),
    );

    let crawler = Crawler::builder()
        .registry(setup.registry.clone())
        .seeds(vec!["no-retry".to_string()])
        .build();
    let monitor = crawler.monitor();
    run_for(crawler, 300).await;

    assert_eq!(setup.fetcher.call_count(), 1);
    assert_eq!(monitor.failure_count(), 1);
}

#[tokio::test]
async fn parsed_records_reach_the_task_storage() {
    let setup = setup(
        "books",
        StubFetcher::default(),
        false,
        5,
        RootFunc::Native(root_detail),
    );

    let crawler = Crawler::builder()
        .registry(setup.registry.clone())
        .seeds(vec!["books".to_string()])
        .build();
    run_for(crawler, 300).await;

    let cells = setup.storage.cells.lock().unwrap();
    assert_eq!(cells.len(), 1);
    assert_eq!(cells[0].table_name(), "books");
    assert_eq!(cells[0].rule, "detail");
    assert_eq!(cells[0].url, "https://detail/1");
}

#[tokio::test]
async fn unknown_rule_drops_the_request() {
    let setup = setup(
        "misconfigured",
        StubFetcher::default(),
        false,
        5,
        RootFunc::Native(root_unknown_rule),
    );

    let crawler = Crawler::builder()
        .registry(setup.registry.clone())
        .seeds(vec!["misconfigured".to_string()])
        .build();
    let monitor = crawler.monitor();
    run_for(crawler, 300).await;

    // Fetched, but the parse stage could not resolve a rule.
    assert_eq!(setup.fetcher.call_count(), 1);
    assert_eq!(monitor.failure_count(), 0);
    assert!(setup.storage.cells.lock().unwrap().is_empty());
}
