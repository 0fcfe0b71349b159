//! What the scheduling loop does with each configuration it dequeues.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tracing::{info, warn};

use simrun_core::{CheckpointData, RunInformation, TaskConfiguration};

use crate::error::RunnerError;
use crate::handler;
use crate::task_runner::TaskRunner;

/// Executes one dequeued configuration to a final [`RunInformation`].
///
/// An `Err` tells the runner to stop the owning controller and cancel its
/// queued work.
#[async_trait]
pub trait ConfigurationExecutor: Send + Sync {
    async fn execute_configuration(
        &self,
        runner: &Arc<TaskRunner>,
        config: &TaskConfiguration,
        resume: Option<CheckpointData>,
    ) -> Result<RunInformation, RunnerError>;
}

/// Two-phase execution through [`crate::handler`]: initialize, then run.
#[derive(Debug, Clone, Copy, Default)]
pub struct HandlerExecutor;

#[async_trait]
impl ConfigurationExecutor for HandlerExecutor {
    async fn execute_configuration(
        &self,
        runner: &Arc<TaskRunner>,
        config: &TaskConfiguration,
        resume: Option<CheckpointData>,
    ) -> Result<RunInformation, RunnerError> {
        let task = match handler::init_run_config(config, runner, runner.model_reader(), resume).await {
            Ok(task) => task,
            Err(e) => {
                runner.on_error_hook(&format!(
                    "initialization of configuration {} failed: {}",
                    config.id, e
                ));
                return Err(e);
            }
        };
        let run_info = if task.run_info.is_failed() {
            task.run_info
        } else {
            handler::run_computation_task(Some(task), config, runner).await
        };

        if run_info.superseded {
            return Ok(run_info);
        }

        if let Some(storage) = runner.storage_for(&config.id).await {
            let record = serde_json::to_value(&run_info).unwrap_or_else(|_| json!(null));
            if let Err(e) = storage.write("run_information", record) {
                warn!(configuration_id = %config.id, error = %e, "Writing run information failed");
            }
        }

        if run_info.is_failed() {
            let message = format!(
                "run {} of configuration {} failed: {}",
                run_info.task_id,
                config.id,
                run_info.error_message().unwrap_or("unknown error")
            );
            runner.on_error_hook(&message);
            if runner.cancel_on_error() {
                return Err(RunnerError::RunFailed {
                    config_id: config.id.clone(),
                    message,
                    run_info: Box::new(run_info),
                });
            }
            warn!(configuration_id = %config.id, error = %message, "Run failed, continuing");
        } else {
            info!(
                configuration_id = %config.id,
                task_id = %run_info.task_id,
                run_duration_ms = ?run_info.run_duration_ms,
                "Run completed"
            );
        }
        Ok(run_info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use simrun_core::{FailureKind, ModelReference};

    use crate::config::RunnerConfig;
    use crate::controller::CollectingController;
    use crate::storage::InMemoryStorageFactory;

    fn inline(source: &str) -> TaskConfiguration {
        TaskConfiguration::new(ModelReference::new(format!("inline:{}", source)))
    }

    #[tokio::test]
    async fn test_local_runs_complete_through_the_loop() {
        let factory = Arc::new(InMemoryStorageFactory::new());
        let runner = TaskRunner::builder(RunnerConfig::default())
            .with_storage_factory(factory.clone())
            .build();
        let controller = Arc::new(CollectingController::new());
        let configs = vec![
            inline(r#"{"steps": 3}"#).with_data_storage(),
            inline(r#"{"steps": 4}"#),
        ];

        runner
            .schedule_configurations(controller.clone(), configs)
            .await
            .unwrap();
        let loop_handle = tokio::spawn(runner.clone().run());

        let results = tokio::time::timeout(Duration::from_secs(5), controller.wait_for(2))
            .await
            .unwrap();
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|(_, info)| info.is_success()));
        assert!(!controller.is_stopped());

        runner.wait_idle().await;
        let storages = factory.storages();
        assert_eq!(storages.len(), 1);
        assert!(storages[0].is_closed());
        assert!(storages[0].flushed().contains_key("run_information"));

        runner.stop();
        loop_handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_setup_failure_without_cancel_keeps_controller() {
        let runner = TaskRunner::builder(RunnerConfig {
            max_parallel_runs: 1,
            ..RunnerConfig::default()
        })
        .build();
        let hooked = Arc::new(AtomicUsize::new(0));
        {
            let hooked = hooked.clone();
            runner.set_error_hook(move |_| {
                hooked.fetch_add(1, Ordering::SeqCst);
            });
        }
        let controller = Arc::new(CollectingController::new());

        runner
            .schedule_configurations(
                controller.clone(),
                vec![inline("not json"), inline(r#"{"steps": 2}"#)],
            )
            .await
            .unwrap();
        let loop_handle = tokio::spawn(runner.clone().run());

        let results = tokio::time::timeout(Duration::from_secs(5), controller.wait_for(2))
            .await
            .unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].1.failure_kind(), Some(FailureKind::SetupFailure));
        assert!(results[1].1.is_success());
        assert!(!controller.is_stopped());
        assert_eq!(hooked.load(Ordering::SeqCst), 1);

        runner.stop();
        loop_handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_setup_failure_with_cancel_stops_controller() {
        let runner = TaskRunner::builder(RunnerConfig {
            max_parallel_runs: 1,
            cancel_on_error: true,
            ..RunnerConfig::default()
        })
        .build();
        let controller = Arc::new(CollectingController::new());

        runner
            .schedule_configurations(
                controller.clone(),
                vec![inline("not json"), inline(r#"{"steps": 2}"#)],
            )
            .await
            .unwrap();
        let loop_handle = tokio::spawn(runner.clone().run());

        tokio::time::timeout(Duration::from_secs(5), controller.wait_for(2))
            .await
            .unwrap();
        assert!(controller.is_stopped());

        runner.wait_idle().await;
        let results = controller.results();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].1.failure_kind(), Some(FailureKind::SetupFailure));
        assert_eq!(runner.queued().await, 0);

        runner.stop();
        loop_handle.await.unwrap();
    }
}
