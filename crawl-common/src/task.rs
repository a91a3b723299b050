use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crawl_storage::{PrintStorage, Storage};

use crate::error::Result;
use crate::limiter::MultiLimiter;
use crate::request::Request;
use crate::rule::RuleTree;

/// Fetches one request and returns the response body decoded to UTF-8.
///
/// The cookie comes from the owning task; passing it in keeps the request
/// model free of task back-pointers.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn get(&self, request: &Request, cookie: &str) -> Result<Bytes>;
}

/// Shared configuration for a family of requests: politeness policy, the
/// fetch and storage handles, the rate limiter and the rule tree.
pub struct Task {
    pub name: String,
    pub cookie: String,
    /// Jitter cap in seconds; each fetch sleeps uniformly in
    /// `[0, wait_time * 1000)` milliseconds.
    pub wait_time: u64,
    /// Requests of this task get one retry after a failed fetch.
    pub reload: bool,
    pub max_depth: u32,
    pub fetcher: Arc<dyn Fetcher>,
    pub storage: Arc<dyn Storage>,
    pub limiter: Arc<MultiLimiter>,
    pub rule: RuleTree,
}

impl Task {
    pub fn builder(name: impl Into<String>) -> TaskBuilder {
        TaskBuilder::new(name)
    }
}

pub struct TaskBuilder {
    name: String,
    cookie: String,
    wait_time: u64,
    reload: bool,
    max_depth: u32,
    fetcher: Option<Arc<dyn Fetcher>>,
    storage: Option<Arc<dyn Storage>>,
    limiter: Arc<MultiLimiter>,
    rule: RuleTree,
}

impl TaskBuilder {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            cookie: String::new(),
            wait_time: 0,
            reload: false,
            max_depth: 5,
            fetcher: None,
            storage: None,
            limiter: Arc::new(MultiLimiter::unlimited()),
            rule: RuleTree::default(),
        }
    }

    pub fn cookie(mut self, cookie: impl Into<String>) -> Self {
        self.cookie = cookie.into();
        self
    }

    pub fn wait_time(mut self, seconds: u64) -> Self {
        self.wait_time = seconds;
        self
    }

    pub fn reload(mut self, reload: bool) -> Self {
        self.reload = reload;
        self
    }

    pub fn max_depth(mut self, max_depth: u32) -> Self {
        self.max_depth = max_depth;
        self
    }

    pub fn fetcher(mut self, fetcher: Arc<dyn Fetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    pub fn storage(mut self, storage: Arc<dyn Storage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn limiter(mut self, limiter: Arc<MultiLimiter>) -> Self {
        self.limiter = limiter;
        self
    }

    pub fn rule_tree(mut self, rule: RuleTree) -> Self {
        self.rule = rule;
        self
    }

    pub fn build(self) -> Task {
        Task {
            name: self.name,
            cookie: self.cookie,
            wait_time: self.wait_time,
            reload: self.reload,
            max_depth: self.max_depth,
            fetcher: self.fetcher.expect("task requires a fetcher"),
            storage: self.storage.unwrap_or_else(|| Arc::new(PrintStorage)),
            limiter: self.limiter,
            rule: self.rule,
        }
    }
}
