//! The crawl engine: resolves seed tasks, runs the fetch worker pool over
//! the scheduler, deduplicates requests, applies the failure policy, and
//! drains parse results into each task's storage sink.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crawl_common::health::HealthHandle;
use crawl_common::{Context, ParseFunc, ParseResult, Request, Result, RootFunc, Task, TaskRegistry};

use crate::scheduler::Scheduler;
use crate::script;

const RESULT_BUFFER: usize = 64;

pub struct CrawlerBuilder {
    registry: Option<Arc<TaskRegistry>>,
    seeds: Vec<String>,
    work_count: usize,
    scheduler: Option<(Scheduler, crate::scheduler::SchedulerLoop)>,
    liveness: Option<HealthHandle>,
}

impl Default for CrawlerBuilder {
    fn default() -> Self {
        Self {
            registry: None,
            seeds: Vec::new(),
            work_count: 1,
            scheduler: None,
            liveness: None,
        }
    }
}

impl CrawlerBuilder {
    pub fn registry(mut self, registry: Arc<TaskRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Seed task names, resolved against the registry at startup.
    pub fn seeds(mut self, seeds: Vec<String>) -> Self {
        self.seeds = seeds;
        self
    }

    pub fn work_count(mut self, work_count: usize) -> Self {
        self.work_count = work_count.max(1);
        self
    }

    pub fn scheduler(
        mut self,
        scheduler: (Scheduler, crate::scheduler::SchedulerLoop),
    ) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    pub fn liveness(mut self, liveness: HealthHandle) -> Self {
        self.liveness = Some(liveness);
        self
    }

    pub fn build(self) -> Crawler {
        let (scheduler, scheduler_loop) =
            self.scheduler.unwrap_or_else(|| Scheduler::new(1));
        Crawler {
            registry: self.registry.expect("crawler requires a task registry"),
            seeds: self.seeds,
            work_count: self.work_count,
            scheduler,
            scheduler_loop: Some(scheduler_loop),
            liveness: self.liveness,
            visited: Arc::new(Mutex::new(HashMap::new())),
            failures: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

pub struct Crawler {
    registry: Arc<TaskRegistry>,
    seeds: Vec<String>,
    work_count: usize,
    scheduler: Scheduler,
    scheduler_loop: Option<crate::scheduler::SchedulerLoop>,
    liveness: Option<HealthHandle>,
    /// Fingerprints of requests already dispatched. Opportunistic: a
    /// duplicate racing in before the mark may still fetch twice.
    visited: Arc<Mutex<HashMap<String, bool>>>,
    /// Requests that failed and are out of retries, by fingerprint.
    failures: Arc<Mutex<HashMap<String, Request>>>,
}

impl Crawler {
    pub fn builder() -> CrawlerBuilder {
        CrawlerBuilder::default()
    }

    /// Shared views over the dedup set and failure ledger, mainly for
    /// inspection and tests.
    pub fn monitor(&self) -> CrawlerMonitor {
        CrawlerMonitor {
            visited: self.visited.clone(),
            failures: self.failures.clone(),
        }
    }

    /// Run until cancelled: materialize seeds, start the scheduler loop,
    /// `work_count` fetch workers and the result drainer.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<()> {
        let scheduler_loop = self
            .scheduler_loop
            .take()
            .expect("crawler can only run once");
        let (result_tx, result_rx) = mpsc::channel::<ParseResult>(RESULT_BUFFER);

        let seeds = self.materialize_seeds()?;
        info!(count = seeds.len(), "seeding crawl frontier");

        tokio::spawn(scheduler_loop.run(cancel.clone()));
        self.scheduler.push(seeds).await;

        let engine = Arc::new(self);
        let mut workers = Vec::with_capacity(engine.work_count);
        for n in 0..engine.work_count {
            let engine = engine.clone();
            let cancel = cancel.clone();
            let results = result_tx.clone();
            workers.push(tokio::spawn(async move {
                engine.work(n, results, cancel).await;
            }));
        }
        drop(result_tx);

        engine.clone().drain(result_rx, cancel).await;
        for worker in workers {
            drop(worker.await);
        }
        Ok(())
    }

    /// Resolve each seed task by name and call its Root to produce the
    /// initial requests.
    fn materialize_seeds(&self) -> Result<Vec<Request>> {
        let mut seeds = Vec::new();
        for name in &self.seeds {
            let Some(task) = self.registry.get(name) else {
                warn!(task = %name, "seed task not registered, skipping");
                continue;
            };
            let Some(root) = &task.rule.root else {
                warn!(task = %name, "seed task has no root rule, skipping");
                continue;
            };
            let requests = match root {
                RootFunc::Native(f) => f()?,
                RootFunc::Scripted(source) => script::eval_root(source, name)?,
            };
            for mut request in requests {
                normalize(&mut request, &task);
                seeds.push(request);
            }
        }
        Ok(seeds)
    }

    async fn work(&self, n: usize, results: mpsc::Sender<ParseResult>, cancel: CancellationToken) {
        info!(worker = n, "fetch worker started");
        loop {
            let request = tokio::select! {
                _ = cancel.cancelled() => break,
                request = self.scheduler.pull() => match request {
                    Some(request) => request,
                    None => break,
                },
            };

            let Some(task) = self.registry.get(&request.task) else {
                error!(task = %request.task, url = %request.url, "task not registered, dropping");
                metrics::counter!("crawler_requests_dropped_total", &[("reason", "unknown_task")])
                    .increment(1);
                continue;
            };

            if let Err(error) = request.check_depth(task.max_depth) {
                warn!(url = %request.url, %error, "dropping request");
                metrics::counter!("crawler_requests_dropped_total", &[("reason", "depth")])
                    .increment(1);
                continue;
            }

            // Dedup, then mark before fetching.
            let fingerprint = request.fingerprint();
            {
                let mut visited = self.visited.lock().expect("visited set poisoned");
                if visited.contains_key(&fingerprint) {
                    metrics::counter!("crawler_requests_dropped_total", &[("reason", "visited")])
                        .increment(1);
                    continue;
                }
                visited.insert(fingerprint.clone(), true);
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = task.limiter.wait() => {}
            }
            if task.wait_time > 0 {
                let jitter = rand::thread_rng().gen_range(0..task.wait_time * 1000);
                tokio::time::sleep(Duration::from_millis(jitter)).await;
            }

            let body = match task.fetcher.get(&request, &task.cookie).await {
                Ok(body) => body,
                Err(error) => {
                    warn!(url = %request.url, %error, "fetch failed");
                    metrics::counter!("crawler_fetch_failures_total").increment(1);
                    self.set_failure(request).await;
                    continue;
                }
            };
            metrics::counter!("crawler_requests_fetched_total").increment(1);

            let Some(rule) = task.rule.rule(&request.rule) else {
                error!(task = %task.name, rule = %request.rule, "rule not found, dropping");
                metrics::counter!("crawler_requests_dropped_total", &[("reason", "rule_miss")])
                    .increment(1);
                continue;
            };

            let ctx = Context {
                body: &body,
                request: &request,
            };
            let parsed = match &rule.parse {
                ParseFunc::Native(f) => f(&ctx),
                ParseFunc::Scripted(source) => script::eval_rule(source, &ctx),
            };
            let result = match parsed {
                Ok(result) => result,
                Err(error) => {
                    error!(url = %request.url, %error, "parse failed, dropping");
                    metrics::counter!("crawler_requests_dropped_total", &[("reason", "parse")])
                        .increment(1);
                    continue;
                }
            };

            if !result.requests.is_empty() {
                let mut followups = result.requests;
                for followup in &mut followups {
                    normalize(followup, &task);
                }
                // Push from a separate task: a full inbound channel must
                // not wedge this worker against the scheduler.
                let scheduler = self.scheduler.clone();
                tokio::spawn(async move {
                    scheduler.push(followups).await;
                });
            }

            let items = ParseResult {
                requests: Vec::new(),
                items: result.items,
            };
            if results.send(items).await.is_err() {
                break;
            }
        }
        info!(worker = n, "fetch worker stopped");
    }

    /// Failure policy: one retry for reload-eligible requests, otherwise
    /// file in the ledger. Retried requests leave the visited set so the
    /// dedup check admits them again.
    async fn set_failure(&self, mut request: Request) {
        let fingerprint = request.fingerprint();
        if request.reload {
            let was_marked = {
                let mut visited = self.visited.lock().expect("visited set poisoned");
                visited.remove(&fingerprint).is_some()
            };
            if was_marked {
                request.reload = false;
                self.scheduler.push([request]).await;
                return;
            }
        }
        self.failures
            .lock()
            .expect("failure ledger poisoned")
            .insert(fingerprint, request);
    }

    /// Single-threaded fan-in: every produced record goes to its task's
    /// storage sink.
    async fn drain(
        self: Arc<Self>,
        mut results: mpsc::Receiver<ParseResult>,
        cancel: CancellationToken,
    ) {
        loop {
            let result = tokio::select! {
                _ = cancel.cancelled() => break,
                result = results.recv() => match result {
                    Some(result) => result,
                    None => break,
                },
            };
            if let Some(liveness) = &self.liveness {
                liveness.report_healthy().await;
            }
            for cell in result.items {
                let Some(task) = self.registry.get(&cell.task) else {
                    warn!(task = %cell.task, "record for unknown task, dropping");
                    continue;
                };
                let url = cell.url.clone();
                if let Err(error) = task.storage.save(vec![cell]).await {
                    error!(%url, %error, "storage write failed");
                } else {
                    metrics::counter!("crawler_items_saved_total").increment(1);
                }
            }
        }
    }
}

/// Stamp task-derived attributes onto a request before scheduling.
fn normalize(request: &mut Request, task: &Task) {
    if request.task.is_empty() {
        request.task = task.name.clone();
    }
    if task.reload {
        request.reload = true;
    }
}

/// Cloned handles over the engine's mutable state.
#[derive(Clone)]
pub struct CrawlerMonitor {
    visited: Arc<Mutex<HashMap<String, bool>>>,
    failures: Arc<Mutex<HashMap<String, Request>>>,
}

impl CrawlerMonitor {
    pub fn visited_contains(&self, fingerprint: &str) -> bool {
        self.visited
            .lock()
            .expect("visited set poisoned")
            .contains_key(fingerprint)
    }

    pub fn visited_count(&self) -> usize {
        self.visited.lock().expect("visited set poisoned").len()
    }

    pub fn failure_count(&self) -> usize {
        self.failures.lock().expect("failure ledger poisoned").len()
    }

    pub fn failed_urls(&self) -> Vec<String> {
        self.failures
            .lock()
            .expect("failure ledger poisoned")
            .values()
            .map(|request| request.url.clone())
            .collect()
    }
}
