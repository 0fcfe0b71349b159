//! Master error types.

use thiserror::Error;

use simrun_core::{ComputationTaskId, CoreError};
use simrun_proto::ErrorCode;

/// Failure of a remote call, on any side of the wire.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request to {target} failed: {message}")]
    Request { target: String, message: String },

    #[error("request to {target} timed out")]
    Timeout { target: String },

    #[error("{target} answered {status}: {message}")]
    Status {
        target: String,
        status: u16,
        code: Option<ErrorCode>,
        message: String,
    },

    #[error("invalid response from {target}: {message}")]
    Decode { target: String, message: String },
}

impl TransportError {
    /// Error code the remote side reported, if it answered at all.
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            TransportError::Status { code, .. } => *code,
            _ => None,
        }
    }

    /// True when the remote side was never reached or never answered.
    pub fn is_unreachable(&self) -> bool {
        matches!(
            self,
            TransportError::Request { .. } | TransportError::Timeout { .. }
        )
    }
}

/// Errors returned by coordinator operations.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("No free host with capability '{capability}' after {attempts} attempts")]
    NoResourceAvailable { capability: String, attempts: u32 },

    #[error("Run {0} is already managed")]
    AlreadyManaged(ComputationTaskId),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("Remote dispatch failed: {0}")]
    Transport(#[from] TransportError),

    #[error("Coordinator is shut down")]
    ShutDown,
}

impl CoordinatorError {
    /// Error code used when this error crosses the wire.
    pub fn code(&self) -> ErrorCode {
        match self {
            CoordinatorError::Core(e) => ErrorCode::from(e),
            CoordinatorError::AlreadyManaged(_) => ErrorCode::InvalidRequest,
            CoordinatorError::ShutDown | CoordinatorError::NoResourceAvailable { .. } => {
                ErrorCode::Unavailable
            }
            CoordinatorError::Transport(e) => e.code().unwrap_or(ErrorCode::Internal),
        }
    }

    /// Shorthand for an unknown-task error.
    pub fn unknown_task(task_id: &ComputationTaskId) -> Self {
        CoordinatorError::Core(CoreError::UnknownTask(task_id.to_string()))
    }
}
