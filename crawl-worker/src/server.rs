use axum::routing::get;
use axum::Router;

use crawl_common::health::HealthRegistry;
use crawl_common::metrics::with_metrics;

/// Probe router for a worker process: index, readiness, liveness and
/// Prometheus metrics.
pub fn router(liveness: HealthRegistry) -> Router {
    let probes = Router::new()
        .route("/", get(index))
        .route("/_readiness", get(index))
        .route("/_liveness", get(move || std::future::ready(liveness.get_status())));
    with_metrics(probes)
}

async fn index() -> &'static str {
    "crawler worker"
}
