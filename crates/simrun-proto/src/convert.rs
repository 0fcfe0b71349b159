//! Error codes carried in [`crate::ErrorResponse`] bodies.

use serde::{Deserialize, Serialize};

use simrun_core::CoreError;

/// Machine-readable error class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// The referenced run is not managed by the receiver.
    UnknownTask,
    /// The referenced service is not registered.
    UnknownService,
    /// The request body was rejected.
    InvalidRequest,
    /// The receiver is shutting down or has shut down.
    Unavailable,
    /// Anything else.
    Internal,
}

impl ErrorCode {
    /// HTTP status code used for this error class.
    pub fn http_status(&self) -> u16 {
        match self {
            ErrorCode::UnknownTask | ErrorCode::UnknownService => 404,
            ErrorCode::InvalidRequest => 400,
            ErrorCode::Unavailable => 503,
            ErrorCode::Internal => 500,
        }
    }
}

impl From<&CoreError> for ErrorCode {
    fn from(err: &CoreError) -> Self {
        match err {
            CoreError::UnknownTask(_) => ErrorCode::UnknownTask,
            CoreError::ServiceNotFound(_) => ErrorCode::UnknownService,
            CoreError::InvalidConfiguration(_)
            | CoreError::Serialization(_)
            | CoreError::InvalidStateTransition { .. } => ErrorCode::InvalidRequest,
        }
    }
}
