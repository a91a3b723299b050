//! HTTP plumbing shared by the worker and master servers: bind-and-serve,
//! and a `/metrics` endpoint fed by per-route request accounting.

use std::time::Instant;

use axum::body::Body;
use axum::extract::MatchedPath;
use axum::http::Request;
use axum::middleware::{self, Next};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use metrics_exporter_prometheus::PrometheusBuilder;

/// Request-latency histogram buckets, in seconds.
const LATENCY_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

pub async fn serve(router: Router, bind: &str) -> Result<(), std::io::Error> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    axum::serve(listener, router).await
}

/// Install the process-wide Prometheus recorder, expose it on `/metrics`,
/// and count/time every request passing through the router. Call once per
/// process, on the final router.
pub fn with_metrics(router: Router) -> Router {
    let recorder = PrometheusBuilder::new()
        .set_buckets(LATENCY_BUCKETS)
        .expect("latency buckets are non-empty")
        .install_recorder()
        .expect("failed to install the metrics recorder");

    router
        .route("/metrics", get(move || std::future::ready(recorder.render())))
        .layer(middleware::from_fn(record_request))
}

async fn record_request(request: Request<Body>, next: Next) -> impl IntoResponse {
    let started = Instant::now();
    // Label by the matched route, not the raw path, to keep cardinality
    // bounded.
    let route = request
        .extensions()
        .get::<MatchedPath>()
        .map(|path| path.as_str().to_owned())
        .unwrap_or_else(|| request.uri().path().to_owned());
    let method = request.method().to_string();

    let response = next.run(request).await;

    let labels = [
        ("method", method),
        ("route", route),
        ("status", response.status().as_u16().to_string()),
    ];
    metrics::counter!("http_requests_total", &labels).increment(1);
    metrics::histogram!("http_requests_duration_seconds", &labels)
        .record(started.elapsed().as_secs_f64());

    response
}
