//! Run handlers.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    Json,
};
use tracing::{info, warn};

use simrun_core::{CheckpointData, ComputationTaskId, Partition, RunInformation, ServiceId};
use simrun_proto::{
    Ack, ErrorCode, ExecuteConfigurationRequest, ExecuteRunRequest, RemoteInitialization,
    RunPropertyResponse, RunSummaryResponse, ShutdownResponse,
};

use crate::api::CoordinatorApi;
use crate::coordinator::Coordinator;
use crate::http::ApiError;
use crate::remote::RunnerRef;

/// Book hosts for a configuration and initialize it remotely.
pub async fn execute_configuration(
    State(coordinator): State<Arc<Coordinator>>,
    Json(request): Json<ExecuteConfigurationRequest>,
) -> Result<Json<RemoteInitialization>, ApiError> {
    let task_id = request.task_id.unwrap_or_else(ComputationTaskId::generate);
    let runner = request.callback_url.map(RunnerRef::Http);
    let init = coordinator
        .execute_simulation_configuration(request.config, task_id, runner, request.resume)
        .await?;
    Ok(Json(init))
}

/// Start an initialized run; answers when the run finished.
pub async fn execute_run(
    State(coordinator): State<Arc<Coordinator>>,
    Path(task_id): Path<String>,
    body: Option<Json<ExecuteRunRequest>>,
) -> Result<Json<RunInformation>, ApiError> {
    let runner = body
        .and_then(|Json(request)| request.callback_url)
        .map(RunnerRef::Http);
    let info = coordinator
        .execute(&ComputationTaskId::new(task_id), runner)
        .await?;
    Ok(Json(info))
}

pub async fn stop_run(
    State(coordinator): State<Arc<Coordinator>>,
    Path(task_id): Path<String>,
) -> Result<Json<Ack>, ApiError> {
    coordinator.stop(&ComputationTaskId::new(task_id)).await?;
    Ok(Json(Ack::ok()))
}

pub async fn get_partition(
    State(coordinator): State<Arc<Coordinator>>,
    Path(task_id): Path<String>,
) -> Result<Json<Partition>, ApiError> {
    let partition = coordinator
        .get_partition(&ComputationTaskId::new(task_id))
        .await?;
    Ok(Json(partition))
}

pub async fn get_run_property(
    State(coordinator): State<Arc<Coordinator>>,
    Path((task_id, name)): Path<(String, String)>,
) -> Result<Json<RunPropertyResponse>, ApiError> {
    let value = coordinator
        .get_run_property(&ComputationTaskId::new(task_id), &name)
        .await?;
    Ok(Json(RunPropertyResponse { name, value }))
}

/// Managed runs.
pub async fn list_runs(State(coordinator): State<Arc<Coordinator>>) -> Json<Vec<RunSummaryResponse>> {
    let runs = coordinator
        .runs()
        .await
        .into_iter()
        .map(|run| RunSummaryResponse {
            task_id: run.task_id,
            configuration_id: run.configuration_id.to_string(),
            state: run.state.to_string(),
            hosts: run.hosts.iter().map(|h| h.to_string()).collect(),
            resilient: run.resilient,
        })
        .collect();
    Json(runs)
}

/// Checkpoint pushed by the host of a resilient run.
pub async fn record_checkpoint(
    State(coordinator): State<Arc<Coordinator>>,
    Path(task_id): Path<String>,
    Json(checkpoint): Json<CheckpointData>,
) -> Result<Json<Ack>, ApiError> {
    if checkpoint.task_id.as_str() != task_id {
        return Err(ApiError::new(
            ErrorCode::InvalidRequest,
            format!("checkpoint belongs to {}, not {}", checkpoint.task_id, task_id),
        ));
    }
    coordinator.record_checkpoint(checkpoint).await?;
    Ok(Json(Ack::ok()))
}

/// A host (or an operator) reports that `service_id` broke down under a run.
pub async fn report_breakdown(
    State(coordinator): State<Arc<Coordinator>>,
    Path((task_id, service_id)): Path<(String, String)>,
) -> Json<Ack> {
    warn!(task_id = %task_id, service_id = %service_id, "Breakdown reported");
    coordinator
        .handle_breakdown(&ComputationTaskId::new(task_id), &ServiceId::new(service_id))
        .await;
    Json(Ack::ok())
}

pub async fn shut_down(
    State(coordinator): State<Arc<Coordinator>>,
) -> Result<Json<ShutdownResponse>, ApiError> {
    let aborted_services = coordinator.shut_down().await?;
    info!(aborted_services, "Shutdown requested over HTTP");
    Ok(Json(ShutdownResponse { aborted_services }))
}
