use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crawl_common::config::AppConfig;
use crawl_common::health::HealthRegistry;
use crawl_common::metrics::serve;
use crawl_coordination::KvStore;
use crawl_master::{api, Master};

use crate::MasterArgs;

const DEFAULT_WORKER_SERVICE: &str = "crawler-worker";

pub async fn run(config: AppConfig, args: MasterArgs) -> anyhow::Result<()> {
    let server_config = &config.master_server;
    let listen = args
        .http
        .unwrap_or_else(|| server_config.http_listen_address.clone());

    let store = KvStore::connect(
        &[server_config.registry_address.clone()],
        Duration::from_secs(server_config.client_timeout_secs),
    )
    .await
    .context("failed to dial the registry")?;

    let worker_service = if config.worker_server.name.is_empty() {
        DEFAULT_WORKER_SERVICE.to_string()
    } else {
        config.worker_server.name.clone()
    };
    let seeds: Vec<String> = config.tasks.iter().map(|t| t.name.clone()).collect();

    let liveness = HealthRegistry::new("liveness");
    let loop_liveness = liveness
        .register("watch_loop", chrono::Duration::seconds(60))
        .await;

    let master = Arc::new(
        Master::builder()
            .seq(&args.id)
            .listen_address(&listen)
            .worker_service(worker_service)
            .seeds(seeds)
            .node_number(args.id.parse().unwrap_or(1))
            .store(store)
            .liveness(loop_liveness)
            .build(),
    );
    info!(id = %master.id(), "master starting");

    let cancel = CancellationToken::new();

    let router = api::router(master.clone(), liveness);
    let server_cancel = cancel.child_token();
    let bind = listen.clone();
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

    let control = tokio::spawn(master.run(cancel.child_token()));

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutting down");
    cancel.cancel();
    drop(control.await);
    Ok(())
}
