//! `simrun submit`: run a batch through a local task runner.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tracing::{info, warn};

use simrun_core::{ConfigurationId, DefaultModelReader, RunInformation, TaskConfiguration};
use simrun_runner::{
    create_callback_router, CollectingController, ExecutionController, HttpCoordinatorClient,
    RunnerConfig, RunnerError, TaskRunner,
};

/// Options of one submission.
#[derive(Debug, Clone)]
pub struct SubmitOptions {
    pub master_url: String,
    pub parallel: usize,
    pub cancel_on_error: bool,
    /// Where the restart/recover callback server listens. Only started for
    /// batches containing remote configurations.
    pub callback_bind: String,
    /// Callback URL announced to the master, when it differs from the bound address.
    pub callback_url: Option<String>,
    pub call_timeout: Duration,
}

/// Run `configs` to completion and return their outcomes in completion order.
pub async fn submit(
    configs: Vec<TaskConfiguration>,
    model_dir: Option<&Path>,
    options: &SubmitOptions,
) -> Result<Vec<(ConfigurationId, RunInformation)>, Box<dyn std::error::Error>> {
    let needs_callbacks = configs.iter().any(|c| c.use_master_server);
    let callback_listener = if needs_callbacks {
        Some(TcpListener::bind(&options.callback_bind).await?)
    } else {
        None
    };
    let callback_url = match (&callback_listener, &options.callback_url) {
        (Some(_), Some(url)) => Some(url.clone()),
        (Some(listener), None) => Some(format!("http://{}", listener.local_addr()?)),
        (None, _) => None,
    };

    let model_reader = match model_dir {
        Some(dir) => DefaultModelReader::with_base_dir(dir),
        None => DefaultModelReader::default(),
    };
    let runner = TaskRunner::builder(RunnerConfig {
        max_parallel_runs: options.parallel.max(1),
        cancel_on_error: options.cancel_on_error,
        callback_url: callback_url.clone(),
    })
    .with_coordinator(Arc::new(HttpCoordinatorClient::new(
        options.master_url.clone(),
        options.call_timeout,
    )))
    .with_model_reader(Arc::new(model_reader))
    .build();

    let callback_server = callback_listener.map(|listener| {
        info!(callback_url = ?callback_url, "Callback server listening");
        let router = create_callback_router(runner.clone());
        tokio::spawn(async move { axum::serve(listener, router).await })
    });

    let results = run_batch(runner, configs).await;

    if let Some(server) = callback_server {
        server.abort();
    }
    Ok(results?)
}

/// Schedule `configs` on `runner`, drive its loop and wait for every outcome.
/// Ctrl-C cancels the runs that have not started yet.
pub async fn run_batch(
    runner: Arc<TaskRunner>,
    configs: Vec<TaskConfiguration>,
) -> Result<Vec<(ConfigurationId, RunInformation)>, RunnerError> {
    let expected = configs.len();
    let controller = Arc::new(CollectingController::new());
    runner
        .schedule_configurations(controller.clone(), configs)
        .await?;
    info!(configurations = expected, "Batch scheduled");

    let loop_handle = tokio::spawn(runner.clone().run());

    tokio::select! {
        _ = controller.wait_for(expected) => {}
        _ = tokio::signal::ctrl_c() => {
            warn!("Ctrl-C received, cancelling queued runs");
            controller.stop("interrupted");
            runner.cancel_all_jobs(controller.id()).await;
        }
    }

    runner.stop();
    runner.wait_idle().await;
    if let Err(e) = loop_handle.await {
        warn!(error = %e, "Task runner loop ended abnormally");
    }
    Ok(controller.results())
}

#[cfg(test)]
mod tests {
    use super::*;

    use simrun_core::{FailureKind, ModelReference};

    fn inline(source: &str) -> TaskConfiguration {
        TaskConfiguration::new(ModelReference::new(format!("inline:{}", source)))
    }

    #[tokio::test]
    async fn test_local_batch_runs_to_completion() {
        let configs = vec![inline(r#"{"steps": 3}"#), inline(r#"{"steps": 2}"#)];
        let options = SubmitOptions {
            master_url: "http://127.0.0.1:1".to_string(),
            parallel: 2,
            cancel_on_error: false,
            callback_bind: "127.0.0.1:0".to_string(),
            callback_url: None,
            call_timeout: Duration::from_secs(1),
        };

        let results = submit(configs, None, &options).await.unwrap();
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|(_, info)| info.is_success()));
    }

    #[tokio::test]
    async fn test_remote_batch_without_master_fails_to_dispatch() {
        let configs = vec![inline("").on_master_server()];
        let options = SubmitOptions {
            master_url: "http://127.0.0.1:1".to_string(),
            parallel: 1,
            cancel_on_error: false,
            callback_bind: "127.0.0.1:0".to_string(),
            callback_url: None,
            call_timeout: Duration::from_secs(1),
        };

        let results = submit(configs, None, &options).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(
            results[0].1.failure_kind(),
            Some(FailureKind::RemoteDispatchFailure)
        );
    }
}
