//! Transport-agnostic coordinator API.
//!
//! Implemented in-process by [`crate::Coordinator`] and over HTTP by the task
//! runner's client, so a task runner drives either one through the same calls.

use async_trait::async_trait;
use serde_json::Value;

use simrun_core::{
    CheckpointData, ComputationTaskId, Partition, RunInformation, ServiceDescriptor, ServiceId,
    TaskConfiguration,
};
use simrun_proto::RemoteInitialization;

use crate::error::CoordinatorError;
use crate::remote::RunnerRef;

/// Operations the coordinator exposes to task runners and services.
#[async_trait]
pub trait CoordinatorApi: Send + Sync {
    /// Add a service. Returns a warning when its declared version differs.
    async fn register(&self, service: ServiceDescriptor) -> Result<Option<String>, CoordinatorError>;

    /// Remove a service.
    async fn unregister(&self, service_id: &ServiceId) -> Result<(), CoordinatorError>;

    /// Book hosts for `config` and have the primary host initialize it.
    ///
    /// Booking exhaustion and remote setup failures come back as a failed
    /// [`RemoteInitialization`], not as an error.
    async fn execute_simulation_configuration(
        &self,
        config: TaskConfiguration,
        task_id: ComputationTaskId,
        runner: Option<RunnerRef>,
        resume: Option<CheckpointData>,
    ) -> Result<RemoteInitialization, CoordinatorError>;

    /// Start an initialized run and wait for its outcome.
    async fn execute(
        &self,
        task_id: &ComputationTaskId,
        runner: Option<RunnerRef>,
    ) -> Result<RunInformation, CoordinatorError>;

    /// Forward a stop request to the host running `task_id`.
    async fn stop(&self, task_id: &ComputationTaskId) -> Result<(), CoordinatorError>;

    /// Partition tree of a managed run.
    async fn get_partition(&self, task_id: &ComputationTaskId) -> Result<Partition, CoordinatorError>;

    /// Property published by a managed run.
    async fn get_run_property(
        &self,
        task_id: &ComputationTaskId,
        name: &str,
    ) -> Result<Option<Value>, CoordinatorError>;

    /// Abort every service and stop the resilience subsystem.
    /// Returns the number of services that were told to abort.
    async fn shut_down(&self) -> Result<usize, CoordinatorError>;
}
