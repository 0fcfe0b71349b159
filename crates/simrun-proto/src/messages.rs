//! Request and response bodies.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use simrun_core::{
    CheckpointData, ComputationTaskId, Partition, RunInformation, ServiceDescriptor,
    TaskConfiguration,
};

use crate::ErrorCode;

// ============================================================================
// Master API: services
// ============================================================================

/// Body of `POST /v1/services`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterServiceRequest {
    pub descriptor: ServiceDescriptor,
}

/// Response to a service registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterServiceResponse {
    /// Version mismatch warning, if any. Registration succeeds regardless.
    pub warning: Option<String>,

    /// Interval the service should send heartbeats at.
    pub heartbeat_interval_secs: u64,
}

/// Response to a heartbeat.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    /// False if the master no longer knows the service; it should re-register.
    pub known: bool,
}

// ============================================================================
// Master API: runs
// ============================================================================

/// Body of `POST /v1/runs`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteConfigurationRequest {
    pub config: TaskConfiguration,

    /// Run id the caller already assigned to this configuration.
    pub task_id: Option<ComputationTaskId>,

    /// Base URL of the task runner's callback server.
    pub callback_url: Option<String>,

    /// Checkpoint to initialize from.
    pub resume: Option<CheckpointData>,
}

/// Outcome of a remote initialization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteInitialization {
    pub task_id: ComputationTaskId,

    /// Failed when booking or initialization failed.
    pub run_info: RunInformation,
}

impl RemoteInitialization {
    /// Whether the run is ready to be executed.
    pub fn is_initialized(&self) -> bool {
        !self.run_info.is_failed()
    }
}

/// Body of `POST /v1/runs/:task_id/execute`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecuteRunRequest {
    pub callback_url: Option<String>,
}

/// Response carrying one run property.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunPropertyResponse {
    pub name: String,
    pub value: Option<Value>,
}

/// Response to `POST /v1/shutdown`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShutdownResponse {
    /// Number of services that were sent an abort.
    pub aborted_services: usize,
}

/// Snapshot of a managed run, served by `GET /v1/runs`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummaryResponse {
    pub task_id: ComputationTaskId,
    pub configuration_id: String,
    pub state: String,
    pub hosts: Vec<String>,
    pub resilient: bool,
}

// ============================================================================
// Worker API
// ============================================================================

/// Body of `POST /v1/runs/:task_id/init` on a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitializeRunRequest {
    pub task_id: ComputationTaskId,
    pub config: TaskConfiguration,

    /// Additional booked hosts for sub-partitioned execution.
    pub auxiliary: Vec<ServiceDescriptor>,

    /// Partition the worker is responsible for.
    pub partition: Partition,

    /// Checkpoint to resume from.
    pub resume: Option<CheckpointData>,
}

/// Generic acknowledgement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ack {
    pub ok: bool,
}

impl Ack {
    pub fn ok() -> Self {
        Self { ok: true }
    }
}

// ============================================================================
// Task runner callback API
// ============================================================================

/// Body of `POST /v1/tasks/:task_id/recover`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoverTaskRequest {
    pub checkpoint: CheckpointData,
}

// ============================================================================
// Errors
// ============================================================================

/// Error body returned by every API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: ErrorCode,
    pub error: String,
}

impl ErrorResponse {
    pub fn new(code: ErrorCode, error: impl Into<String>) -> Self {
        Self {
            code,
            error: error.into(),
        }
    }
}
