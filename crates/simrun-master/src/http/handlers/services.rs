//! Service registry handlers.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    Json,
};
use tracing::info;

use simrun_core::{ServiceId, ServiceInfo};
use simrun_proto::{Ack, HeartbeatResponse, RegisterServiceRequest, RegisterServiceResponse};

use crate::api::CoordinatorApi;
use crate::coordinator::Coordinator;
use crate::http::ApiError;

/// Register (or re-register) a service.
pub async fn register_service(
    State(coordinator): State<Arc<Coordinator>>,
    Json(request): Json<RegisterServiceRequest>,
) -> Result<Json<RegisterServiceResponse>, ApiError> {
    let descriptor = request.descriptor;
    info!(
        service_id = %descriptor.id,
        capability = %descriptor.capability,
        endpoint = %descriptor.endpoint,
        "Service registering"
    );
    let warning = coordinator.register(descriptor).await?;
    Ok(Json(RegisterServiceResponse {
        warning,
        heartbeat_interval_secs: coordinator.config().heartbeat_interval_secs,
    }))
}

/// List registered services in registration order.
pub async fn list_services(State(coordinator): State<Arc<Coordinator>>) -> Json<Vec<ServiceInfo>> {
    Json(coordinator.registry().list_all().await)
}

pub async fn unregister_service(
    State(coordinator): State<Arc<Coordinator>>,
    Path(service_id): Path<String>,
) -> Result<Json<Ack>, ApiError> {
    let service_id = ServiceId::new(service_id);
    coordinator.unregister(&service_id).await?;
    info!(service_id = %service_id, "Service unregistered");
    Ok(Json(Ack::ok()))
}

pub async fn heartbeat(
    State(coordinator): State<Arc<Coordinator>>,
    Path(service_id): Path<String>,
) -> Json<HeartbeatResponse> {
    let known = coordinator.heartbeat(&ServiceId::new(service_id)).await;
    Json(HeartbeatResponse { known })
}
