//! Operator-facing command API, served over HTTP/JSON.
//!
//! `POST /api/resources` admits a crawl task and reports where it landed;
//! `DELETE /api/resources/{name}` removes one. Probes and metrics share
//! the router.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tracing::error;

use crawl_common::health::HealthRegistry;
use crawl_common::metrics::with_metrics;

use crate::error::MasterError;
use crate::master::Master;

#[derive(Clone)]
struct ApiState {
    master: Arc<Master>,
}

pub fn router(master: Arc<Master>, liveness: HealthRegistry) -> Router {
    let api = Router::new()
        .route("/api/resources", post(add_resource))
        .route("/api/resources/:name", delete(delete_resource))
        .with_state(ApiState { master });

    let probes = Router::new()
        .route("/", get(index))
        .route("/_readiness", get(index))
        .route("/_liveness", get(move || std::future::ready(liveness.get_status())));

    with_metrics(api.merge(probes))
}

async fn index() -> &'static str {
    "crawler master"
}

#[derive(Debug, Deserialize)]
struct AddResourceRequest {
    name: String,
}

#[derive(Debug, Serialize)]
struct AddResourceResponse {
    id: i64,
    node_id: String,
    address: String,
}

async fn add_resource(
    State(state): State<ApiState>,
    Json(body): Json<AddResourceRequest>,
) -> Result<Json<AddResourceResponse>, ApiError> {
    let (spec, node) = state.master.add_resource(&body.name).await?;
    Ok(Json(AddResourceResponse {
        id: spec.id,
        node_id: node.id,
        address: node.address,
    }))
}

async fn delete_resource(
    State(state): State<ApiState>,
    Path(name): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.master.delete_resource(&name).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Maps domain errors onto the wire: no live workers is the operator's
/// problem (503), unknown names are 404, the rest is internal.
struct ApiError(MasterError);

impl From<MasterError> for ApiError {
    fn from(error: MasterError) -> Self {
        Self(error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self.0 {
            MasterError::NoWorker => (StatusCode::SERVICE_UNAVAILABLE, self.0.to_string()),
            MasterError::NotFound(_) => (StatusCode::NOT_FOUND, self.0.to_string()),
            MasterError::Coord(error) => {
                error!(%error, "command failed on the kv store");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal".to_string())
            }
        };
        (status, message).into_response()
    }
}
