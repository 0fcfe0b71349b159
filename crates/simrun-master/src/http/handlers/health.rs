//! Health and metrics handlers.

use std::sync::Arc;

use axum::{extract::State, http::header, http::StatusCode, response::IntoResponse, Json};
use serde_json::json;

use crate::coordinator::Coordinator;

/// Liveness plus a summary of what the coordinator manages.
///
/// Answers 503 once the coordinator has been shut down.
pub async fn health_check(State(coordinator): State<Arc<Coordinator>>) -> impl IntoResponse {
    let services = coordinator.registry().list_all().await.len();
    let runs = coordinator.runs().await.len();
    let (status, label) = if coordinator.is_shut_down() {
        (StatusCode::SERVICE_UNAVAILABLE, "shut_down")
    } else {
        (StatusCode::OK, "ok")
    };

    (
        status,
        Json(json!({
            "status": label,
            "version": coordinator.config().framework_version,
            "services": services,
            "runs": runs,
        })),
    )
}

/// Prometheus metrics endpoint.
pub async fn metrics_handler(State(coordinator): State<Arc<Coordinator>>) -> impl IntoResponse {
    let body = crate::metrics::collect_metrics(&coordinator).await;
    ([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body)
}
