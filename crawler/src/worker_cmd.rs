use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crawl_common::config::{self, AppConfig, LimitConfig, TaskConfig};
use crawl_common::health::HealthRegistry;
use crawl_common::limiter::LimitSpec;
use crawl_common::metrics::serve;
use crawl_common::{Fetcher, MultiLimiter, Task, TaskRegistry};
use crawl_coordination::discovery::{self, NodeRecord};
use crawl_coordination::KvStore;
use crawl_storage::{SqlStore, Storage};
use crawl_worker::{rules, server, BrowserFetcher, Crawler};

const WORK_COUNT: usize = 5;
const DEFAULT_SERVICE: &str = "crawler-worker";

pub async fn run(config: AppConfig) -> anyhow::Result<()> {
    let server_config = &config.worker_server;
    config::require(&server_config.id, "worker_server.id")?;
    config::require(&config.storage.sql_url, "storage.sql_url")?;
    let service = if server_config.name.is_empty() {
        DEFAULT_SERVICE.to_string()
    } else {
        server_config.name.clone()
    };

    let fetcher: Arc<dyn Fetcher> = Arc::new(
        BrowserFetcher::builder()
            .timeout(Duration::from_millis(config.fetcher.timeout_ms))
            .proxies(config.fetcher.proxies.clone())
            .build()
            .context("failed to build fetcher")?,
    );

    let registry = Arc::new(TaskRegistry::new());
    let storage: Arc<dyn Storage> = Arc::new(
        SqlStore::builder()
            .sql_url(config.storage.sql_url.clone())
            .batch_size(config.storage.batch_size)
            .engine(config.storage.engine.clone())
            .charset(config.storage.charset.clone())
            .resolver(registry.clone())
            .build()
            .await
            .context("failed to connect to the sql backend")?,
    );

    let seeds = register_tasks(&config.tasks, &registry, &fetcher, &storage);
    info!(tasks = seeds.len(), "task registry initialized");

    let liveness = HealthRegistry::new("liveness");
    let engine_liveness = liveness
        .register("engine", chrono::Duration::seconds(60))
        .await;

    let crawler = Crawler::builder()
        .registry(registry.clone())
        .seeds(seeds)
        .work_count(WORK_COUNT)
        .liveness(engine_liveness)
        .build();

    let cancel = CancellationToken::new();

    let store = KvStore::connect(
        &[server_config.registry_address.clone()],
        Duration::from_secs(server_config.client_timeout_secs),
    )
    .await
    .context("failed to dial the registry")?;
    let record = NodeRecord {
        id: server_config.id.clone(),
        address: server_config.http_listen_address.clone(),
    };
    let _registration = discovery::register_node(
        store,
        service,
        record,
        Duration::from_secs(server_config.register_ttl_secs.max(1) as u64),
        Duration::from_secs(server_config.register_interval_secs),
        cancel.child_token(),
    )
    .await
    .context("failed to register in discovery")?;

    let router = server::router(liveness);
    let bind = server_config.http_listen_address.clone();
    let server_cancel = cancel.child_token();
    tokio::spawn(async move {
        tokio::select! {
            _ = server_cancel.cancelled() => {}
            result = serve(router, &bind) => {
                if let Err(error) = result {
                    error!(%error, "http server stopped");
                }
            }
        }
    });

    let engine = tokio::spawn(crawler.run(cancel.child_token()));

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutting down");
    cancel.cancel();
    drop(engine.await);
    Ok(())
}

/// Build one task per configuration entry whose rule tree this build
/// knows, and register it. Returns the seed task names.
fn register_tasks(
    tasks: &[TaskConfig],
    registry: &Arc<TaskRegistry>,
    fetcher: &Arc<dyn Fetcher>,
    storage: &Arc<dyn Storage>,
) -> Vec<String> {
    let mut seeds = Vec::new();
    for task_config in tasks {
        let Some(tree) = rules::builtin_tree(&task_config.name) else {
            error!(task = %task_config.name, "no rule tree for configured task, skipping");
            continue;
        };
        if task_config.fetcher != "browser" {
            error!(task = %task_config.name, fetcher = %task_config.fetcher, "unknown fetcher, skipping");
            continue;
        }

        let task = Task::builder(&task_config.name)
            .cookie(&task_config.cookie)
            .wait_time(task_config.wait_time)
            .reload(task_config.reload)
            .max_depth(task_config.max_depth)
            .fetcher(fetcher.clone())
            .storage(storage.clone())
            .limiter(Arc::new(build_limiter(&task_config.limits)))
            .rule_tree(tree)
            .build();
        registry.add(task);
        seeds.push(task_config.name.clone());
    }
    seeds
}

fn build_limiter(limits: &[LimitConfig]) -> MultiLimiter {
    if limits.is_empty() {
        return MultiLimiter::unlimited();
    }
    MultiLimiter::new(
        limits
            .iter()
            .map(|l| {
                LimitSpec::new(
                    l.event_count,
                    Duration::from_secs(l.event_dur_secs),
                    l.bucket,
                )
            })
            .collect(),
    )
}
