//! Runs hosted on this worker.
//!
//! The master initializes a run, starts it (the start call returns when the
//! computation ends), and may stop it or read its properties in between.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use simrun_core::{
    CheckpointData, ComputationTaskId, ComputationTaskIdent, ModelReader, RunContext,
    RunInformation, SetupStrategies,
};
use simrun_proto::{ErrorCode, InitializeRunRequest};
use simrun_runner::handler::{init_computation_task, run_locally};
use simrun_runner::InitializedComputationTask;

/// Errors answered to the master.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Run {0} is not hosted here")]
    UnknownTask(ComputationTaskId),

    #[error("Run {0} is already hosted here")]
    AlreadyHosted(ComputationTaskId),

    #[error("Run {0} was already started")]
    AlreadyStarted(ComputationTaskId),
}

impl WorkerError {
    pub fn code(&self) -> ErrorCode {
        match self {
            WorkerError::UnknownTask(_) => ErrorCode::UnknownTask,
            WorkerError::AlreadyHosted(_) | WorkerError::AlreadyStarted(_) => {
                ErrorCode::InvalidRequest
            }
        }
    }
}

struct HostedRun {
    /// Taken when the run starts.
    task: Option<InitializedComputationTask>,
    context: RunContext,
}

/// The set of runs this worker hosts.
pub struct RunHost {
    model_reader: Arc<dyn ModelReader>,
    strategies: SetupStrategies,
    checkpoints: Option<mpsc::UnboundedSender<CheckpointData>>,
    runs: Mutex<HashMap<ComputationTaskId, HostedRun>>,
}

impl RunHost {
    pub fn new(model_reader: Arc<dyn ModelReader>, strategies: SetupStrategies) -> Self {
        Self {
            model_reader,
            strategies,
            checkpoints: None,
            runs: Mutex::new(HashMap::new()),
        }
    }

    /// Forward checkpoints of resilient runs into `sender`.
    pub fn with_checkpoint_sender(mut self, sender: mpsc::UnboundedSender<CheckpointData>) -> Self {
        self.checkpoints = Some(sender);
        self
    }

    /// Set up the computation for a run.
    ///
    /// A setup failure is reported in the returned run information and the
    /// run is not kept.
    pub async fn initialize(&self, request: InitializeRunRequest) -> Result<RunInformation, WorkerError> {
        let mut runs = self.runs.lock().await;
        if runs.contains_key(&request.task_id) {
            return Err(WorkerError::AlreadyHosted(request.task_id));
        }

        let ident = ComputationTaskIdent {
            id: request.task_id.clone(),
            data_storage: None,
        };
        let run_info = RunInformation::new(request.task_id.clone(), request.config.id.clone());
        let mut task = init_computation_task(
            &ident,
            &request.config,
            self.model_reader.as_ref(),
            &self.strategies,
            run_info,
            &request.auxiliary,
            request.resume.as_ref(),
        );
        let run_info = task.run_info.clone();
        if run_info.is_failed() {
            return Ok(run_info);
        }

        if request.config.resilient {
            if let Some(sender) = self.checkpoints.clone() {
                task.context = task.context.with_checkpoint_sink(move |checkpoint| {
                    if sender.send(checkpoint).is_err() {
                        debug!("Checkpoint forwarder gone, checkpoint dropped");
                    }
                });
            }
        }

        info!(
            task_id = %request.task_id,
            configuration_id = %request.config.id,
            partition = request.partition.index,
            auxiliary_hosts = request.auxiliary.len(),
            resume_step = request.resume.as_ref().map(|c| c.step),
            "Run initialized"
        );
        let context = task.context.clone();
        runs.insert(
            request.task_id,
            HostedRun {
                task: Some(task),
                context,
            },
        );
        Ok(run_info)
    }

    /// Run an initialized computation to its end.
    pub async fn start(&self, task_id: &ComputationTaskId) -> Result<RunInformation, WorkerError> {
        let task = {
            let mut runs = self.runs.lock().await;
            let run = runs
                .get_mut(task_id)
                .ok_or_else(|| WorkerError::UnknownTask(task_id.clone()))?;
            run.task
                .take()
                .ok_or_else(|| WorkerError::AlreadyStarted(task_id.clone()))?
        };

        info!(task_id = %task_id, "Run started");
        let run_info = run_locally(task).await;
        self.runs.lock().await.remove(task_id);

        match &run_info.failure {
            Some(failure) => warn!(task_id = %task_id, error = %failure.message, "Run failed"),
            None => info!(task_id = %task_id, run_duration_ms = ?run_info.run_duration_ms, "Run finished"),
        }
        Ok(run_info)
    }

    /// Ask a run to stop. A run that has not started yet is dropped.
    pub async fn stop(&self, task_id: &ComputationTaskId) -> Result<(), WorkerError> {
        let mut runs = self.runs.lock().await;
        let run = runs
            .get(task_id)
            .ok_or_else(|| WorkerError::UnknownTask(task_id.clone()))?;
        run.context.request_stop();
        if run.task.is_some() {
            runs.remove(task_id);
        }
        info!(task_id = %task_id, "Run stop requested");
        Ok(())
    }

    pub async fn property(
        &self,
        task_id: &ComputationTaskId,
        name: &str,
    ) -> Result<Option<Value>, WorkerError> {
        let runs = self.runs.lock().await;
        let run = runs
            .get(task_id)
            .ok_or_else(|| WorkerError::UnknownTask(task_id.clone()))?;
        Ok(run.context.property(name))
    }

    /// Stop everything. Returns how many runs were affected.
    pub async fn abort(&self) -> usize {
        let mut runs = self.runs.lock().await;
        for run in runs.values() {
            run.context.request_stop();
        }
        let affected = runs.len();
        runs.retain(|_, run| run.task.is_none());
        if affected > 0 {
            warn!(runs = affected, "All runs aborted");
        }
        affected
    }

    /// Number of runs hosted, started or not.
    pub async fn hosted(&self) -> usize {
        self.runs.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use simrun_core::{DefaultModelReader, FailureKind, ModelReference, Partition, TaskConfiguration};

    fn host() -> RunHost {
        RunHost::new(Arc::new(DefaultModelReader::default()), SetupStrategies::with_builtin())
    }

    fn request(source: &str) -> InitializeRunRequest {
        let config = TaskConfiguration::new(ModelReference::new(format!("inline:{}", source)));
        InitializeRunRequest {
            task_id: ComputationTaskId::generate(),
            config,
            auxiliary: Vec::new(),
            partition: Partition::new(0),
            resume: None,
        }
    }

    #[tokio::test]
    async fn test_initialize_then_start() {
        let host = host();
        let request = request(r#"{"steps": 4}"#);
        let task_id = request.task_id.clone();

        let init = host.initialize(request).await.unwrap();
        assert!(!init.is_failed());
        assert_eq!(host.hosted().await, 1);

        let info = host.start(&task_id).await.unwrap();
        assert!(info.is_success());
        assert_eq!(host.hosted().await, 0);
        assert!(matches!(
            host.start(&task_id).await,
            Err(WorkerError::UnknownTask(_))
        ));
    }

    #[tokio::test]
    async fn test_setup_failure_is_reported_not_kept() {
        let host = host();
        let info = host.initialize(request("not json")).await.unwrap();
        assert_eq!(info.failure_kind(), Some(FailureKind::SetupFailure));
        assert_eq!(host.hosted().await, 0);
    }

    #[tokio::test]
    async fn test_duplicate_initialize_rejected() {
        let host = host();
        let request = request("");
        host.initialize(request.clone()).await.unwrap();
        let err = host.initialize(request).await.unwrap_err();
        assert!(matches!(err, WorkerError::AlreadyHosted(_)));
        assert_eq!(err.code(), ErrorCode::InvalidRequest);
    }

    #[tokio::test]
    async fn test_stop_ends_running_computation() {
        let host = Arc::new(host());
        let request = request(r#"{"steps": 100000, "step_millis": 5}"#);
        let task_id = request.task_id.clone();
        host.initialize(request).await.unwrap();

        let running = {
            let host = host.clone();
            let task_id = task_id.clone();
            tokio::spawn(async move { host.start(&task_id).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(host.property(&task_id, "step").await.unwrap().is_some());
        host.stop(&task_id).await.unwrap();

        let info = tokio::time::timeout(Duration::from_secs(5), running)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(info.failure_kind(), Some(FailureKind::ExecutionFailure));
    }

    #[tokio::test]
    async fn test_resilient_runs_forward_checkpoints() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let host = host().with_checkpoint_sender(tx);
        let mut request = request(r#"{"steps": 6, "checkpoint_every": 2}"#);
        request.config = request.config.with_resilience();
        let task_id = request.task_id.clone();

        host.initialize(request).await.unwrap();
        host.start(&task_id).await.unwrap();

        let first = rx.recv().await.unwrap();
        assert_eq!(first.task_id, task_id);
        assert_eq!(first.step, 2);
        assert!(first.state.get("value").is_some());
    }

    #[tokio::test]
    async fn test_abort_drops_unstarted_runs() {
        let host = host();
        host.initialize(request("")).await.unwrap();
        host.initialize(request("")).await.unwrap();
        assert_eq!(host.abort().await, 2);
        assert_eq!(host.hosted().await, 0);
    }
}
