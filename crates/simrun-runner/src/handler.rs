//! Two-phase run dispatch: initialize a configuration, then run it.
//!
//! Everything here is a free function taking its collaborators as arguments.
//! Each phase chooses between in-process execution and delegation to the
//! coordinator, depending on `TaskConfiguration::use_master_server`.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, warn};

use simrun_core::{
    CheckpointData, ComputationError, ComputationHandle, ComputationTaskId, ComputationTaskIdent,
    FailureKind, ModelReader, RunContext, RunInformation, ServiceDescriptor, SetupRequest,
    SetupStrategies, TaskConfiguration,
};

use crate::error::RunnerError;
use crate::task_runner::TaskRunner;

/// A run that went through initialization.
///
/// `handle` is `None` when initialization failed or when the computation
/// lives on a remote host.
pub struct InitializedComputationTask {
    pub ident: ComputationTaskIdent,
    pub handle: Option<Box<dyn ComputationHandle>>,
    pub context: RunContext,
    pub run_info: RunInformation,
}

impl fmt::Debug for InitializedComputationTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InitializedComputationTask")
            .field("ident", &self.ident)
            .field("has_handle", &self.handle.is_some())
            .field("run_info", &self.run_info)
            .finish()
    }
}

/// Build the computation for `config` through its setup strategy.
///
/// Never fails: a setup error is recorded as `SetupFailure` in the returned
/// task's run information and the handle is left empty.
pub fn init_computation_task(
    ident: &ComputationTaskIdent,
    config: &TaskConfiguration,
    model_reader: &dyn ModelReader,
    strategies: &SetupStrategies,
    mut run_info: RunInformation,
    resources: &[ServiceDescriptor],
    resume: Option<&CheckpointData>,
) -> InitializedComputationTask {
    let setup = || -> Result<Box<dyn ComputationHandle>, ComputationError> {
        let strategy = strategies.get(&config.setup_strategy)?;
        let model = model_reader.read(&config.model)?;
        strategy.setup(SetupRequest {
            task_id: &ident.id,
            config,
            model,
            resources,
            resume,
        })
    };

    let handle = match setup() {
        Ok(handle) => {
            run_info.initialized();
            debug!(
                task_id = %ident.id,
                strategy = %config.setup_strategy,
                resume_step = resume.map(|c| c.step),
                "Computation initialized"
            );
            Some(handle)
        }
        Err(e) => {
            warn!(task_id = %ident.id, error = %e, "Computation setup failed");
            run_info.fail(
                FailureKind::SetupFailure,
                format!("setup of configuration {} failed", config.id),
                Some(e.to_string()),
            );
            None
        }
    };

    InitializedComputationTask {
        ident: ident.clone(),
        handle,
        context: RunContext::new(ident.id.clone()),
        run_info,
    }
}

/// Run an initialized task to completion.
///
/// A `None` task yields a failed [`RunInformation`]. Remote runs are executed
/// through the runner's coordinator; transport failures end up in the
/// returned run information, never as an error.
pub async fn run_computation_task(
    task: Option<InitializedComputationTask>,
    config: &TaskConfiguration,
    runner: &Arc<TaskRunner>,
) -> RunInformation {
    let Some(task) = task else {
        let task_id = runner
            .task_id_of(&config.id)
            .await
            .unwrap_or_else(ComputationTaskId::generate);
        let mut run_info = RunInformation::new(task_id, config.id.clone());
        run_info.fail(
            FailureKind::SetupFailure,
            format!("configuration {} was not initialized", config.id),
            None,
        );
        return run_info;
    };

    if config.use_master_server {
        run_on_master_server(task, runner).await
    } else {
        run_locally(task).await
    }
}

async fn run_on_master_server(task: InitializedComputationTask, runner: &Arc<TaskRunner>) -> RunInformation {
    let mut run_info = task.run_info;
    let Some(coordinator) = runner.coordinator() else {
        run_info.fail(
            FailureKind::RemoteDispatchFailure,
            "no coordinator configured",
            None,
        );
        return run_info;
    };

    match coordinator.execute(&task.ident.id, runner.runner_ref()).await {
        Ok(remote) => remote,
        Err(e) => {
            warn!(task_id = %task.ident.id, error = %e, "Remote execution failed");
            run_info.fail(
                FailureKind::RemoteDispatchFailure,
                format!("remote execution of run {} failed", task.ident.id),
                Some(e.to_string()),
            );
            run_info
        }
    }
}

/// Drive a local computation handle on a blocking thread.
///
/// Keep a clone of `task.context` to stop the run or read its properties
/// while it executes.
pub async fn run_locally(task: InitializedComputationTask) -> RunInformation {
    let InitializedComputationTask {
        ident,
        handle,
        context,
        mut run_info,
    } = task;
    let Some(mut handle) = handle else {
        run_info.fail(
            FailureKind::SetupFailure,
            format!("run {} has no computation handle", ident.id),
            None,
        );
        return run_info;
    };

    run_info.start();
    let outcome = tokio::task::spawn_blocking(move || handle.run(&context)).await;
    match outcome {
        Ok(Ok(())) => run_info.complete(),
        Ok(Err(ComputationError::Stopped)) => run_info.fail(
            FailureKind::ExecutionFailure,
            format!("run {} was stopped before completion", ident.id),
            None,
        ),
        Ok(Err(e)) => run_info.fail(
            FailureKind::ExecutionFailure,
            format!("computation of run {} failed", ident.id),
            Some(e.to_string()),
        ),
        Err(e) => run_info.fail(
            FailureKind::ExecutionFailure,
            format!("computation of run {} panicked", ident.id),
            Some(e.to_string()),
        ),
    }
    run_info
}

/// Initialize `config` in-process or on the master server.
pub async fn init_run_config(
    config: &TaskConfiguration,
    runner: &Arc<TaskRunner>,
    model_reader: &dyn ModelReader,
    resume: Option<CheckpointData>,
) -> Result<InitializedComputationTask, RunnerError> {
    if config.use_master_server {
        init_on_master_server(config, runner, resume).await
    } else {
        init_locally(config, runner, model_reader, resume).await
    }
}

pub async fn init_locally(
    config: &TaskConfiguration,
    runner: &Arc<TaskRunner>,
    model_reader: &dyn ModelReader,
    resume: Option<CheckpointData>,
) -> Result<InitializedComputationTask, RunnerError> {
    let ident = runner.get_computation_task_id(config).await?;
    let run_info = RunInformation::new(ident.id.clone(), config.id.clone());
    Ok(init_computation_task(
        &ident,
        config,
        model_reader,
        runner.strategies(),
        run_info,
        &[],
        resume.as_ref(),
    ))
}

/// Have the coordinator book hosts and initialize the run remotely.
///
/// A failed call becomes a failed task, unless the runner cancels on error,
/// in which case the error propagates.
pub async fn init_on_master_server(
    config: &TaskConfiguration,
    runner: &Arc<TaskRunner>,
    resume: Option<CheckpointData>,
) -> Result<InitializedComputationTask, RunnerError> {
    let ident = runner.get_computation_task_id(config).await?;

    let result = match runner.coordinator() {
        Some(coordinator) => coordinator
            .execute_simulation_configuration(
                config.clone(),
                ident.id.clone(),
                runner.runner_ref(),
                resume,
            )
            .await
            .map_err(RunnerError::from),
        None => Err(RunnerError::NoCoordinator(config.id.clone())),
    };

    match result {
        Ok(init) => Ok(InitializedComputationTask {
            context: RunContext::new(init.task_id),
            ident,
            handle: None,
            run_info: init.run_info,
        }),
        Err(e) if runner.cancel_on_error() => Err(e),
        Err(e) => {
            warn!(configuration_id = %config.id, error = %e, "Remote initialization failed");
            let mut run_info = RunInformation::new(ident.id.clone(), config.id.clone());
            run_info.fail(
                e.failure_kind(),
                format!("remote initialization of configuration {} failed", config.id),
                Some(e.to_string()),
            );
            Ok(InitializedComputationTask {
                context: RunContext::new(ident.id.clone()),
                ident,
                handle: None,
                run_info,
            })
        }
    }
}
