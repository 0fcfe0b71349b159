//! Remote-facing seams of the coordinator.
//!
//! - [`RemoteHost`]: what the coordinator asks of a booked worker host.
//! - [`HostConnector`]: how a registered service becomes a [`RemoteHost`].
//! - [`RemoteRunner`]: what a task runner offers the coordinator for recovery.
//!
//! All of them are transport-agnostic; [`crate::transport`] implements them
//! over HTTP and tests implement them in memory.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use simrun_core::{CheckpointData, ComputationTaskId, RunInformation, ServiceDescriptor};
use simrun_proto::InitializeRunRequest;

use crate::error::TransportError;

/// A worker host as seen by the coordinator.
#[async_trait]
pub trait RemoteHost: Send + Sync {
    /// Set the run up on the host. A failed [`RunInformation`] means the host
    /// was reached but the computation could not be created.
    async fn initialize(&self, request: InitializeRunRequest) -> Result<RunInformation, TransportError>;

    /// Start an initialized run and wait for it to finish.
    async fn start(&self, task_id: &ComputationTaskId) -> Result<RunInformation, TransportError>;

    /// Ask the host to stop a run.
    async fn stop(&self, task_id: &ComputationTaskId) -> Result<(), TransportError>;

    /// Read a property the running computation published.
    async fn run_property(
        &self,
        task_id: &ComputationTaskId,
        name: &str,
    ) -> Result<Option<Value>, TransportError>;

    /// Abort everything on the host.
    async fn abort(&self) -> Result<(), TransportError>;
}

/// Resolves registered services to callable hosts.
pub trait HostConnector: Send + Sync {
    fn connect(&self, service: &ServiceDescriptor) -> Arc<dyn RemoteHost>;
}

/// Resilience callbacks implemented by whoever submitted a run.
#[async_trait]
pub trait RemoteRunner: Send + Sync {
    /// Run the task again from scratch.
    async fn restart_task(&self, task_id: &ComputationTaskId) -> Result<(), TransportError>;

    /// Run the task again from `checkpoint`.
    async fn recover_task(
        &self,
        task_id: &ComputationTaskId,
        checkpoint: CheckpointData,
    ) -> Result<(), TransportError>;
}

/// Reference to a task runner, as passed into the coordinator.
#[derive(Clone)]
pub enum RunnerRef {
    /// Runner living in the same process.
    InProcess(Arc<dyn RemoteRunner>),
    /// Runner reachable at a callback base URL.
    Http(String),
}

impl RunnerRef {
    /// Callback URL, when the runner is remote.
    pub fn callback_url(&self) -> Option<&str> {
        match self {
            RunnerRef::InProcess(_) => None,
            RunnerRef::Http(url) => Some(url),
        }
    }
}

impl fmt::Debug for RunnerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunnerRef::InProcess(_) => f.write_str("RunnerRef::InProcess"),
            RunnerRef::Http(url) => write!(f, "RunnerRef::Http({})", url),
        }
    }
}
