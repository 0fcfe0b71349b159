//! HTTP/JSON implementations of the remote seams.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use simrun_core::{CheckpointData, ComputationTaskId, RunInformation, ServiceDescriptor};
use simrun_proto::{paths, Ack, ErrorResponse, InitializeRunRequest, RecoverTaskRequest, RunPropertyResponse};

use crate::error::TransportError;
use crate::remote::{HostConnector, RemoteHost, RemoteRunner, RunnerRef};

/// Build a client with a per-request timeout.
pub fn client_with_timeout(timeout: Option<Duration>) -> reqwest::Client {
    let builder = reqwest::Client::builder();
    let builder = match timeout {
        Some(timeout) => builder.timeout(timeout),
        None => builder,
    };
    builder.build().unwrap_or_else(|_| reqwest::Client::new())
}

/// Map a reqwest failure to a [`TransportError`].
pub fn request_error(target: &str, err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout {
            target: target.to_string(),
        }
    } else {
        TransportError::Request {
            target: target.to_string(),
            message: err.to_string(),
        }
    }
}

/// Decode a JSON response, turning error bodies into [`TransportError::Status`].
pub async fn decode_response<T: DeserializeOwned>(
    target: &str,
    response: reqwest::Response,
) -> Result<T, TransportError> {
    let status = response.status();
    if status.is_success() {
        return response.json::<T>().await.map_err(|e| TransportError::Decode {
            target: target.to_string(),
            message: e.to_string(),
        });
    }

    let body = response.text().await.unwrap_or_default();
    let (code, message) = match serde_json::from_str::<ErrorResponse>(&body) {
        Ok(err) => (Some(err.code), err.error),
        Err(_) => (None, body),
    };
    Err(TransportError::Status {
        target: target.to_string(),
        status: status.as_u16(),
        code,
        message,
    })
}

/// POST `body` as JSON and decode the answer.
pub async fn post_json<B: Serialize + ?Sized, T: DeserializeOwned>(
    client: &reqwest::Client,
    url: &str,
    body: &B,
) -> Result<T, TransportError> {
    debug!(url = %url, "POST request");
    let response = client
        .post(url)
        .json(body)
        .send()
        .await
        .map_err(|e| request_error(url, e))?;
    decode_response(url, response).await
}

/// GET and decode the answer.
pub async fn get_json<T: DeserializeOwned>(
    client: &reqwest::Client,
    url: &str,
) -> Result<T, TransportError> {
    debug!(url = %url, "GET request");
    let response = client
        .get(url)
        .send()
        .await
        .map_err(|e| request_error(url, e))?;
    decode_response(url, response).await
}

/// Connects to worker hosts over HTTP.
#[derive(Clone)]
pub struct HttpHostConnector {
    client: reqwest::Client,
    start_client: reqwest::Client,
}

impl HttpHostConnector {
    /// `call_timeout` bounds short calls; `run_timeout` bounds `start`.
    pub fn new(call_timeout: Duration, run_timeout: Option<Duration>) -> Self {
        Self {
            client: client_with_timeout(Some(call_timeout)),
            start_client: client_with_timeout(run_timeout),
        }
    }
}

impl HostConnector for HttpHostConnector {
    fn connect(&self, service: &ServiceDescriptor) -> Arc<dyn RemoteHost> {
        Arc::new(HttpRemoteHost {
            endpoint: service.endpoint.clone(),
            client: self.client.clone(),
            start_client: self.start_client.clone(),
        })
    }
}

/// A worker host reached over HTTP.
pub struct HttpRemoteHost {
    endpoint: String,
    client: reqwest::Client,
    start_client: reqwest::Client,
}

#[async_trait]
impl RemoteHost for HttpRemoteHost {
    async fn initialize(&self, request: InitializeRunRequest) -> Result<RunInformation, TransportError> {
        let url = paths::url(&self.endpoint, &paths::run_action(&request.task_id, "init"));
        post_json(&self.client, &url, &request).await
    }

    async fn start(&self, task_id: &ComputationTaskId) -> Result<RunInformation, TransportError> {
        let url = paths::url(&self.endpoint, &paths::run_action(task_id, "start"));
        post_json(&self.start_client, &url, &()).await
    }

    async fn stop(&self, task_id: &ComputationTaskId) -> Result<(), TransportError> {
        let url = paths::url(&self.endpoint, &paths::run_action(task_id, "stop"));
        let _: Ack = post_json(&self.client, &url, &()).await?;
        Ok(())
    }

    async fn run_property(
        &self,
        task_id: &ComputationTaskId,
        name: &str,
    ) -> Result<Option<Value>, TransportError> {
        let url = paths::url(&self.endpoint, &paths::run_property(task_id, name));
        let response: RunPropertyResponse = get_json(&self.client, &url).await?;
        Ok(response.value)
    }

    async fn abort(&self) -> Result<(), TransportError> {
        let url = paths::url(&self.endpoint, paths::WORKER_ABORT);
        let _: Ack = post_json(&self.client, &url, &()).await?;
        Ok(())
    }
}

/// A task runner's callback server reached over HTTP.
pub struct HttpRunnerCallback {
    base_url: String,
    client: reqwest::Client,
}

impl HttpRunnerCallback {
    pub fn new(base_url: impl Into<String>, client: reqwest::Client) -> Self {
        Self {
            base_url: base_url.into(),
            client,
        }
    }
}

#[async_trait]
impl RemoteRunner for HttpRunnerCallback {
    async fn restart_task(&self, task_id: &ComputationTaskId) -> Result<(), TransportError> {
        let url = paths::url(&self.base_url, &paths::task_restart(task_id));
        let _: Ack = post_json(&self.client, &url, &()).await?;
        Ok(())
    }

    async fn recover_task(
        &self,
        task_id: &ComputationTaskId,
        checkpoint: CheckpointData,
    ) -> Result<(), TransportError> {
        let url = paths::url(&self.base_url, &paths::task_recover(task_id));
        let _: Ack = post_json(&self.client, &url, &RecoverTaskRequest { checkpoint }).await?;
        Ok(())
    }
}

/// Turn a [`RunnerRef`] into something callable.
pub fn resolve_runner(runner: RunnerRef, client: &reqwest::Client) -> Arc<dyn RemoteRunner> {
    match runner {
        RunnerRef::InProcess(runner) => runner,
        RunnerRef::Http(url) => Arc::new(HttpRunnerCallback::new(url, client.clone())),
    }
}
