//! Coordinator API over HTTP.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use simrun_core::{
    CheckpointData, ComputationTaskId, CoreError, Partition, RunInformation, ServiceDescriptor,
    ServiceId, ServiceInfo, TaskConfiguration,
};
use simrun_master::transport::{
    client_with_timeout, decode_response, get_json, post_json, request_error,
};
use simrun_master::{CoordinatorApi, CoordinatorError, RunnerRef, TransportError};
use simrun_proto::{
    paths, Ack, ErrorCode, ExecuteConfigurationRequest, ExecuteRunRequest, RegisterServiceRequest,
    RegisterServiceResponse, RemoteInitialization, RunPropertyResponse, RunSummaryResponse,
    ShutdownResponse,
};

/// Talks to a master server's HTTP API.
///
/// Booking and execution calls wait without timeout: the master bounds
/// booking by its attempt budget and execution by the run itself.
#[derive(Clone)]
pub struct HttpCoordinatorClient {
    base_url: String,
    client: reqwest::Client,
    long_client: reqwest::Client,
}

impl HttpCoordinatorClient {
    pub fn new(base_url: impl Into<String>, call_timeout: Duration) -> Self {
        Self {
            base_url: base_url.into(),
            client: client_with_timeout(Some(call_timeout)),
            long_client: client_with_timeout(None),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        paths::url(&self.base_url, path)
    }

    /// Registered services.
    pub async fn list_services(&self) -> Result<Vec<ServiceInfo>, CoordinatorError> {
        get_json(&self.client, &self.url(paths::SERVICES))
            .await
            .map_err(|e| map_error(e, None))
    }

    /// Runs the master currently manages.
    pub async fn list_runs(&self) -> Result<Vec<RunSummaryResponse>, CoordinatorError> {
        get_json(&self.client, &self.url(paths::RUNS))
            .await
            .map_err(|e| map_error(e, None))
    }

    /// Report a broken host for a run.
    pub async fn report_breakdown(
        &self,
        task_id: &ComputationTaskId,
        service_id: &ServiceId,
    ) -> Result<(), CoordinatorError> {
        let url = self.url(&paths::run_breakdown(task_id, service_id));
        let _: Ack = post_json(&self.client, &url, &())
            .await
            .map_err(|e| map_error(e, Some(task_id)))?;
        Ok(())
    }
}

/// Turn a wire error back into the coordinator error it came from.
fn map_error(err: TransportError, task_id: Option<&ComputationTaskId>) -> CoordinatorError {
    let message = match &err {
        TransportError::Status { message, .. } => message.clone(),
        other => other.to_string(),
    };
    match (err.code(), task_id) {
        (Some(ErrorCode::UnknownTask), Some(task_id)) => CoordinatorError::unknown_task(task_id),
        (Some(ErrorCode::UnknownService), _) => CoreError::ServiceNotFound(message).into(),
        (Some(ErrorCode::InvalidRequest), _) => CoreError::InvalidConfiguration(message).into(),
        (Some(ErrorCode::Unavailable), _) => CoordinatorError::ShutDown,
        _ => CoordinatorError::Transport(err),
    }
}

fn callback_url(runner: Option<RunnerRef>) -> Option<String> {
    match runner {
        Some(RunnerRef::Http(url)) => Some(url),
        Some(RunnerRef::InProcess(_)) => {
            debug!("In-process runner reference cannot cross the wire, no callbacks");
            None
        }
        None => None,
    }
}

#[async_trait]
impl CoordinatorApi for HttpCoordinatorClient {
    async fn register(&self, service: ServiceDescriptor) -> Result<Option<String>, CoordinatorError> {
        let response: RegisterServiceResponse = post_json(
            &self.client,
            &self.url(paths::SERVICES),
            &RegisterServiceRequest {
                descriptor: service,
            },
        )
        .await
        .map_err(|e| map_error(e, None))?;
        Ok(response.warning)
    }

    async fn unregister(&self, service_id: &ServiceId) -> Result<(), CoordinatorError> {
        let url = self.url(&paths::service(service_id));
        let response = self
            .client
            .delete(&url)
            .send()
            .await
            .map_err(|e| CoordinatorError::Transport(request_error(&url, e)))?;
        let _: Ack = decode_response(&url, response)
            .await
            .map_err(|e| map_error(e, None))?;
        Ok(())
    }

    async fn execute_simulation_configuration(
        &self,
        config: TaskConfiguration,
        task_id: ComputationTaskId,
        runner: Option<RunnerRef>,
        resume: Option<CheckpointData>,
    ) -> Result<RemoteInitialization, CoordinatorError> {
        let request = ExecuteConfigurationRequest {
            config,
            task_id: Some(task_id.clone()),
            callback_url: callback_url(runner),
            resume,
        };
        post_json(&self.long_client, &self.url(paths::RUNS), &request)
            .await
            .map_err(|e| map_error(e, Some(&task_id)))
    }

    async fn execute(
        &self,
        task_id: &ComputationTaskId,
        runner: Option<RunnerRef>,
    ) -> Result<RunInformation, CoordinatorError> {
        let url = self.url(&paths::run_action(task_id, "execute"));
        let request = ExecuteRunRequest {
            callback_url: callback_url(runner),
        };
        post_json(&self.long_client, &url, &request)
            .await
            .map_err(|e| map_error(e, Some(task_id)))
    }

    async fn stop(&self, task_id: &ComputationTaskId) -> Result<(), CoordinatorError> {
        let url = self.url(&paths::run_action(task_id, "stop"));
        let _: Ack = post_json(&self.client, &url, &())
            .await
            .map_err(|e| map_error(e, Some(task_id)))?;
        Ok(())
    }

    async fn get_partition(&self, task_id: &ComputationTaskId) -> Result<Partition, CoordinatorError> {
        let url = self.url(&paths::run_action(task_id, "partition"));
        get_json(&self.client, &url)
            .await
            .map_err(|e| map_error(e, Some(task_id)))
    }

    async fn get_run_property(
        &self,
        task_id: &ComputationTaskId,
        name: &str,
    ) -> Result<Option<Value>, CoordinatorError> {
        let url = self.url(&paths::run_property(task_id, name));
        let response: RunPropertyResponse = get_json(&self.client, &url)
            .await
            .map_err(|e| map_error(e, Some(task_id)))?;
        Ok(response.value)
    }

    async fn shut_down(&self) -> Result<usize, CoordinatorError> {
        let response: ShutdownResponse = post_json(&self.client, &self.url(paths::SHUTDOWN), &())
            .await
            .map_err(|e| map_error(e, None))?;
        Ok(response.aborted_services)
    }
}
