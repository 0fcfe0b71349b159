//! Core domain errors.

use thiserror::Error;

/// Core domain errors for simrun.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Configuration rejected at submission time.
    #[error("Invalid computation task configuration: {0}")]
    InvalidConfiguration(String),

    /// No run registered under the given task id.
    #[error("Unknown computation task: {0}")]
    UnknownTask(String),

    /// Service not registered.
    #[error("Service not found: {0}")]
    ServiceNotFound(String),

    /// Invalid state transition.
    #[error("Invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for CoreError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}
