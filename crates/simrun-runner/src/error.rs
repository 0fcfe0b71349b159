//! Task runner error types.

use thiserror::Error;

use simrun_core::{
    ComputationError, ComputationTaskId, ConfigurationId, CoreError, FailureKind, RunInformation,
};
use simrun_master::CoordinatorError;
use simrun_proto::ErrorCode;

/// Errors raised by data storage handles.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Data storage {0} is closed")]
    Closed(String),

    #[error("Data storage failure: {0}")]
    Backend(String),
}

/// Errors raised by the task runner and the run handler.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("Coordinator call failed: {0}")]
    Coordinator(#[from] CoordinatorError),

    #[error("No coordinator configured for remote configuration {0}")]
    NoCoordinator(ConfigurationId),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Computation(#[from] ComputationError),

    #[error("Unknown run: {0}")]
    UnknownTask(ComputationTaskId),

    /// A run failed while `cancel_on_error` is set.
    #[error("Run of configuration {config_id} failed: {message}")]
    RunFailed {
        config_id: ConfigurationId,
        message: String,
        run_info: Box<RunInformation>,
    },
}

impl RunnerError {
    /// Wire code reported to a master calling back into the runner.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            RunnerError::UnknownTask(_) => ErrorCode::UnknownTask,
            _ => ErrorCode::Internal,
        }
    }

    /// Failure class recorded when this error ends a run.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            RunnerError::RunFailed { run_info, .. } => {
                run_info.failure_kind().unwrap_or(FailureKind::ExecutionFailure)
            }
            RunnerError::Coordinator(CoordinatorError::NoResourceAvailable { .. }) => {
                FailureKind::NoResourceAvailable
            }
            RunnerError::Coordinator(_) | RunnerError::NoCoordinator(_) => {
                FailureKind::RemoteDispatchFailure
            }
            RunnerError::Core(_) | RunnerError::Storage(_) | RunnerError::UnknownTask(_) => {
                FailureKind::SetupFailure
            }
            RunnerError::Computation(ComputationError::Execution(_))
            | RunnerError::Computation(ComputationError::Stopped) => FailureKind::ExecutionFailure,
            RunnerError::Computation(_) => FailureKind::SetupFailure,
        }
    }
}
