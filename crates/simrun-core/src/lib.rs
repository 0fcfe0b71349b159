//! simrun Core Domain Types
//!
//! This crate contains pure domain types with no dependencies on:
//! - Network/HTTP
//! - Async runtimes
//! - Storage backends
//!
//! It also defines the contracts a computation must satisfy to be run by
//! the orchestration crates (see [`computation`]).

pub mod builtin;
pub mod computation;
pub mod configuration;
pub mod error;
pub mod ids;
pub mod partition;
pub mod run_info;
pub mod service;
pub mod status;

// Re-export commonly used types
pub use computation::{
    CheckpointData, ComputationError, ComputationHandle, DefaultModelReader, Model, ModelError,
    ModelReader, RunContext, SetupRequest, SetupStrategies, SetupStrategy,
};
pub use configuration::{
    ModelReference, TaskConfiguration, DEFAULT_SETUP_STRATEGY, SIMULATION_CAPABILITY,
};
pub use error::CoreError;
pub use ids::{ComputationTaskId, ConfigurationId, ControllerId, DataStorageId, ServiceId};
pub use partition::{Partition, ProcessorState};
pub use run_info::{ComputationTaskIdent, RunFailure, RunInformation};
pub use service::{BookingState, ServiceDescriptor, ServiceInfo};
pub use status::{FailureKind, RunState};
