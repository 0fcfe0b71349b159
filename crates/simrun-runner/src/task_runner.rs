//! The task runner: a FIFO queue of configurations and the loop draining it.
//!
//! All bookkeeping (queue, owners, idents, storage handles) lives in one
//! [`SchedulerState`] behind one mutex. The loop pops configurations in
//! submission order and spawns each run as its own task, so completions
//! arrive in any order.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use simrun_core::{
    CheckpointData, ComputationTaskId, ComputationTaskIdent, ConfigurationId, ControllerId,
    CoreError, DefaultModelReader, ModelReader, RunInformation, SetupStrategies,
    TaskConfiguration,
};
use simrun_master::{CoordinatorApi, RemoteRunner, RunnerRef, TransportError};

use crate::config::RunnerConfig;
use crate::controller::ExecutionController;
use crate::error::RunnerError;
use crate::executor::{ConfigurationExecutor, HandlerExecutor};
use crate::storage::{DataStorage, DataStorageFactory, InMemoryStorageFactory};

/// Out-of-band failure notification.
pub type ErrorHook = Arc<dyn Fn(&str) + Send + Sync>;

struct ScheduledRun {
    config_id: ConfigurationId,
    resume: Option<CheckpointData>,
}

#[derive(Default)]
struct SchedulerState {
    queue: VecDeque<ScheduledRun>,
    configs: HashMap<ConfigurationId, TaskConfiguration>,
    owners: HashMap<ConfigurationId, Arc<dyn ExecutionController>>,
    idents: HashMap<ConfigurationId, ComputationTaskIdent>,
    by_task: HashMap<ComputationTaskId, ConfigurationId>,
    storages: HashMap<ConfigurationId, Arc<dyn DataStorage>>,
}

/// Builder for [`TaskRunner`].
pub struct TaskRunnerBuilder {
    config: RunnerConfig,
    coordinator: Option<Arc<dyn CoordinatorApi>>,
    executor: Arc<dyn ConfigurationExecutor>,
    model_reader: Arc<dyn ModelReader>,
    strategies: SetupStrategies,
    storage_factory: Arc<dyn DataStorageFactory>,
}

impl TaskRunnerBuilder {
    /// Coordinator used for configurations that run on the master server.
    pub fn with_coordinator(mut self, coordinator: Arc<dyn CoordinatorApi>) -> Self {
        self.coordinator = Some(coordinator);
        self
    }

    pub fn with_executor(mut self, executor: Arc<dyn ConfigurationExecutor>) -> Self {
        self.executor = executor;
        self
    }

    pub fn with_model_reader(mut self, model_reader: Arc<dyn ModelReader>) -> Self {
        self.model_reader = model_reader;
        self
    }

    pub fn with_strategies(mut self, strategies: SetupStrategies) -> Self {
        self.strategies = strategies;
        self
    }

    pub fn with_storage_factory(mut self, factory: Arc<dyn DataStorageFactory>) -> Self {
        self.storage_factory = factory;
        self
    }

    pub fn build(self) -> Arc<TaskRunner> {
        let permits = self.config.max_parallel_runs.max(1);
        let cancel_on_error = self.config.cancel_on_error;
        Arc::new_cyclic(|self_ref| TaskRunner {
            config: self.config,
            coordinator: self.coordinator,
            executor: self.executor,
            model_reader: self.model_reader,
            strategies: self.strategies,
            storage_factory: self.storage_factory,
            state: Mutex::new(SchedulerState::default()),
            wake: Notify::new(),
            changed: Notify::new(),
            stopping: CancellationToken::new(),
            pausing: AtomicBool::new(false),
            cancel_on_error: AtomicBool::new(cancel_on_error),
            error_hook: StdMutex::new(None),
            permits: Arc::new(Semaphore::new(permits)),
            active: AtomicUsize::new(0),
            self_ref: self_ref.clone(),
        })
    }
}

/// Queues configurations and drives them through initialization and execution.
pub struct TaskRunner {
    config: RunnerConfig,
    coordinator: Option<Arc<dyn CoordinatorApi>>,
    executor: Arc<dyn ConfigurationExecutor>,
    model_reader: Arc<dyn ModelReader>,
    strategies: SetupStrategies,
    storage_factory: Arc<dyn DataStorageFactory>,
    state: Mutex<SchedulerState>,
    /// Wakes the scheduling loop.
    wake: Notify,
    /// Signalled whenever a run finished or the queue shrank.
    changed: Notify,
    stopping: CancellationToken,
    pausing: AtomicBool,
    cancel_on_error: AtomicBool,
    error_hook: StdMutex<Option<ErrorHook>>,
    permits: Arc<Semaphore>,
    active: AtomicUsize,
    self_ref: Weak<TaskRunner>,
}

impl TaskRunner {
    pub fn builder(config: RunnerConfig) -> TaskRunnerBuilder {
        TaskRunnerBuilder {
            config,
            coordinator: None,
            executor: Arc::new(HandlerExecutor),
            model_reader: Arc::new(DefaultModelReader::default()),
            strategies: SetupStrategies::with_builtin(),
            storage_factory: Arc::new(InMemoryStorageFactory::new()),
        }
    }

    /// Runner with default collaborators and no coordinator.
    pub fn new(config: RunnerConfig) -> Arc<Self> {
        Self::builder(config).build()
    }

    pub fn coordinator(&self) -> Option<&Arc<dyn CoordinatorApi>> {
        self.coordinator.as_ref()
    }

    pub fn model_reader(&self) -> &dyn ModelReader {
        self.model_reader.as_ref()
    }

    pub fn strategies(&self) -> &SetupStrategies {
        &self.strategies
    }

    /// Reference the coordinator uses to call this runner back.
    pub fn runner_ref(&self) -> Option<RunnerRef> {
        if let Some(url) = &self.config.callback_url {
            return Some(RunnerRef::Http(url.clone()));
        }
        self.self_ref
            .upgrade()
            .map(|runner| RunnerRef::InProcess(runner as Arc<dyn RemoteRunner>))
    }

    // ------------------------------------------------------------------
    // Submission
    // ------------------------------------------------------------------

    /// Append `configs` to the queue, owned by `controller`.
    ///
    /// Every configuration is validated before any is enqueued.
    pub async fn schedule_configurations(
        &self,
        controller: Arc<dyn ExecutionController>,
        configs: Vec<TaskConfiguration>,
    ) -> Result<(), RunnerError> {
        for config in &configs {
            config.validate()?;
        }

        let mut state = self.state.lock().await;
        for (i, config) in configs.iter().enumerate() {
            let duplicate = state.configs.contains_key(&config.id)
                || configs[..i].iter().any(|c| c.id == config.id);
            if duplicate {
                return Err(CoreError::InvalidConfiguration(format!(
                    "configuration {} is already scheduled",
                    config.id
                ))
                .into());
            }
        }

        let count = configs.len();
        for config in configs {
            state.owners.insert(config.id.clone(), controller.clone());
            state.queue.push_back(ScheduledRun {
                config_id: config.id.clone(),
                resume: None,
            });
            state.configs.insert(config.id.clone(), config);
        }
        drop(state);

        info!(
            controller_id = %controller.id(),
            count,
            "Configurations scheduled"
        );
        self.wake.notify_one();
        Ok(())
    }

    // ------------------------------------------------------------------
    // Scheduling loop
    // ------------------------------------------------------------------

    /// Scheduling loop. Returns once [`TaskRunner::stop`] was called.
    pub async fn run(self: Arc<Self>) {
        info!(
            max_parallel_runs = self.config.max_parallel_runs,
            "Task runner started"
        );

        loop {
            if self.is_stopping() {
                break;
            }

            let permit = tokio::select! {
                permit = self.permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = self.stopping.cancelled() => break,
            };

            let next = if self.is_pausing() {
                None
            } else {
                self.state.lock().await.queue.pop_front()
            };

            let Some(scheduled) = next else {
                drop(permit);
                tokio::select! {
                    _ = self.wake.notified() => {}
                    _ = self.stopping.cancelled() => {}
                }
                continue;
            };

            self.active.fetch_add(1, Ordering::SeqCst);
            let runner = self.clone();
            tokio::spawn(async move {
                runner.execute_scheduled(scheduled).await;
                drop(permit);
                runner.active.fetch_sub(1, Ordering::SeqCst);
                runner.changed.notify_waiters();
            });
        }

        info!("Task runner stopped");
    }

    async fn execute_scheduled(self: &Arc<Self>, scheduled: ScheduledRun) {
        let (config, owner) = {
            let state = self.state.lock().await;
            match (
                state.configs.get(&scheduled.config_id),
                state.owners.get(&scheduled.config_id),
            ) {
                (Some(config), Some(owner)) => (config.clone(), owner.clone()),
                _ => {
                    debug!(configuration_id = %scheduled.config_id, "Configuration retired before start");
                    return;
                }
            }
        };

        debug!(
            configuration_id = %config.id,
            resume = scheduled.resume.is_some(),
            "Executing configuration"
        );
        match self
            .executor
            .execute_configuration(self, &config, scheduled.resume)
            .await
        {
            Ok(run_info) => self.report_run(&config, &owner, run_info).await,
            Err(e) => {
                error!(configuration_id = %config.id, error = %e, "Configuration failed");
                let run_info = match e {
                    RunnerError::RunFailed { run_info, .. } => *run_info,
                    ref other => {
                        let task_id = self
                            .task_id_of(&config.id)
                            .await
                            .unwrap_or_else(ComputationTaskId::generate);
                        let mut info = RunInformation::new(task_id, config.id.clone());
                        info.fail(other.failure_kind(), other.to_string(), None);
                        info
                    }
                };
                owner.stop(&format!("configuration {} failed", config.id));
                self.report_run(&config, &owner, run_info).await;
                self.cancel_all_jobs(owner.id()).await;
            }
        }
    }

    /// Hand a final outcome to the owner and retire the configuration.
    /// Superseded outcomes are dropped: a recovery run took over.
    async fn report_run(
        &self,
        config: &TaskConfiguration,
        owner: &Arc<dyn ExecutionController>,
        run_info: RunInformation,
    ) {
        if run_info.superseded {
            debug!(configuration_id = %config.id, "Run superseded by recovery");
            return;
        }
        owner.on_run_finished(config, &run_info);
        self.remove_execution_controller(&config.id).await;
    }

    /// Prevent further configurations from starting. Running ones continue.
    pub fn stop(&self) {
        info!("Task runner stopping");
        self.stopping.cancel();
        self.wake.notify_one();
        self.changed.notify_waiters();
    }

    /// Suspend dequeuing without stopping.
    pub fn pause(&self) {
        self.pausing.store(true, Ordering::SeqCst);
        info!("Task runner paused");
    }

    pub fn resume(&self) {
        self.pausing.store(false, Ordering::SeqCst);
        info!("Task runner resumed");
        self.wake.notify_one();
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.is_cancelled()
    }

    pub fn is_pausing(&self) -> bool {
        self.pausing.load(Ordering::SeqCst)
    }

    /// True when nothing is queued and nothing is running.
    pub async fn is_idle(&self) -> bool {
        self.active.load(Ordering::SeqCst) == 0 && self.state.lock().await.queue.is_empty()
    }

    /// Number of configurations waiting to start.
    pub async fn queued(&self) -> usize {
        self.state.lock().await.queue.len()
    }

    /// Wait until the runner is idle.
    pub async fn wait_idle(&self) {
        loop {
            let changed = self.changed.notified();
            if self.is_idle().await {
                return;
            }
            changed.await;
        }
    }

    // ------------------------------------------------------------------
    // Error policy
    // ------------------------------------------------------------------

    /// Install a hook. The new hook runs first, then the previous chain.
    pub fn set_error_hook(&self, hook: impl Fn(&str) + Send + Sync + 'static) {
        let mut slot = self
            .error_hook
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let chained: ErrorHook = match slot.take() {
            Some(previous) => Arc::new(move |message: &str| {
                hook(message);
                previous(message);
            }),
            None => Arc::new(hook),
        };
        *slot = Some(chained);
    }

    /// Invoke the installed hook chain, if any.
    pub fn on_error_hook(&self, message: &str) {
        let hook = self
            .error_hook
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        match hook {
            Some(hook) => hook(message),
            None => debug!(message = %message, "No error hook installed"),
        }
    }

    pub fn cancel_on_error(&self) -> bool {
        self.cancel_on_error.load(Ordering::SeqCst)
    }

    pub fn set_cancel_on_error(&self, cancel: bool) {
        self.cancel_on_error.store(cancel, Ordering::SeqCst);
    }

    // ------------------------------------------------------------------
    // Bookkeeping
    // ------------------------------------------------------------------

    /// Stable run identity of `config`.
    ///
    /// Created on first request; a configuration that needs data storage gets
    /// exactly one storage handle even under concurrent callers.
    pub async fn get_computation_task_id(
        &self,
        config: &TaskConfiguration,
    ) -> Result<ComputationTaskIdent, RunnerError> {
        let mut state = self.state.lock().await;
        if let Some(ident) = state.idents.get(&config.id) {
            return Ok(ident.clone());
        }

        let storage = if config.needs_data_storage {
            Some(self.storage_factory.create(config)?)
        } else {
            None
        };
        let ident = ComputationTaskIdent::new(storage.as_ref().map(|s| s.id().clone()));
        if let Some(storage) = storage {
            state.storages.insert(config.id.clone(), storage);
        }
        state.by_task.insert(ident.id.clone(), config.id.clone());
        state.idents.insert(config.id.clone(), ident.clone());
        debug!(
            configuration_id = %config.id,
            task_id = %ident.id,
            data_storage = ?ident.data_storage,
            "Run identity created"
        );
        Ok(ident)
    }

    /// Task id already assigned to a configuration, if any.
    pub async fn task_id_of(&self, config_id: &ConfigurationId) -> Option<ComputationTaskId> {
        self.state
            .lock()
            .await
            .idents
            .get(config_id)
            .map(|ident| ident.id.clone())
    }

    /// Storage handle owned by a configuration.
    pub async fn storage_for(&self, config_id: &ConfigurationId) -> Option<Arc<dyn DataStorage>> {
        self.state.lock().await.storages.get(config_id).cloned()
    }

    /// Retire a finished configuration: close its storage and drop its owner.
    pub async fn remove_execution_controller(&self, config_id: &ConfigurationId) {
        let storage = {
            let mut state = self.state.lock().await;
            state.owners.remove(config_id);
            state.configs.remove(config_id);
            if let Some(ident) = state.idents.remove(config_id) {
                state.by_task.remove(&ident.id);
            }
            state.storages.remove(config_id)
        };

        if let Some(storage) = storage {
            if let Err(e) = storage.close() {
                warn!(configuration_id = %config_id, error = %e, "Closing data storage failed");
            }
        }
        self.changed.notify_waiters();
    }

    /// Remove the queued (not yet started) configurations of a controller.
    /// Returns how many were removed.
    pub async fn cancel_all_jobs(&self, controller_id: &ControllerId) -> usize {
        let cancelled: Vec<ConfigurationId> = {
            let mut state = self.state.lock().await;
            let SchedulerState { queue, owners, .. } = &mut *state;
            let mut cancelled = Vec::new();
            queue.retain(|scheduled| {
                let owned = owners
                    .get(&scheduled.config_id)
                    .is_some_and(|owner| owner.id() == controller_id);
                if owned {
                    cancelled.push(scheduled.config_id.clone());
                }
                !owned
            });
            cancelled
        };

        for config_id in &cancelled {
            self.remove_execution_controller(config_id).await;
        }
        if !cancelled.is_empty() {
            info!(controller_id = %controller_id, cancelled = cancelled.len(), "Queued configurations cancelled");
        }
        cancelled.len()
    }

    // ------------------------------------------------------------------
    // Recovery
    // ------------------------------------------------------------------

    /// Put a known run back at the head of the queue.
    pub async fn requeue(
        &self,
        task_id: &ComputationTaskId,
        resume: Option<CheckpointData>,
    ) -> Result<(), RunnerError> {
        {
            let mut state = self.state.lock().await;
            let config_id = state
                .by_task
                .get(task_id)
                .cloned()
                .ok_or_else(|| RunnerError::UnknownTask(task_id.clone()))?;
            info!(
                task_id = %task_id,
                configuration_id = %config_id,
                from_step = resume.as_ref().map(|c| c.step),
                "Run requeued for recovery"
            );
            state.queue.push_front(ScheduledRun { config_id, resume });
        }
        self.wake.notify_one();
        Ok(())
    }
}

fn callback_error(task_id: &ComputationTaskId, err: RunnerError) -> TransportError {
    let code = err.error_code();
    TransportError::Status {
        target: format!("task runner ({})", task_id),
        status: code.http_status(),
        code: Some(code),
        message: err.to_string(),
    }
}

#[async_trait]
impl RemoteRunner for TaskRunner {
    async fn restart_task(&self, task_id: &ComputationTaskId) -> Result<(), TransportError> {
        self.requeue(task_id, None)
            .await
            .map_err(|e| callback_error(task_id, e))
    }

    async fn recover_task(
        &self,
        task_id: &ComputationTaskId,
        checkpoint: CheckpointData,
    ) -> Result<(), TransportError> {
        self.requeue(task_id, Some(checkpoint))
            .await
            .map_err(|e| callback_error(task_id, e))
    }
}
