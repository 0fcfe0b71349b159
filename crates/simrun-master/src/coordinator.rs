//! The coordinator: books hosts for runs, dispatches them, tracks which host
//! runs which task and recovers runs whose host broke down.
//!
//! Every managed run carries a generation number. Whoever removes a run from
//! the table owns its cleanup; a late finisher whose generation no longer
//! matches leaves the (possibly already re-booked) task id alone.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures_util::future::join_all;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use simrun_core::{
    CheckpointData, ComputationTaskId, ConfigurationId, CoreError, FailureKind, Partition,
    RunInformation, RunState, ServiceDescriptor, ServiceId, TaskConfiguration,
};
use simrun_proto::{InitializeRunRequest, RemoteInitialization};

use crate::allocator::{PartitionAllocator, ResourceAllocator};
use crate::api::CoordinatorApi;
use crate::config::Config;
use crate::error::{CoordinatorError, TransportError};
use crate::registry::ServiceRegistry;
use crate::remote::{HostConnector, RemoteRunner, RunnerRef};
use crate::resilience::ResilienceStore;
use crate::transport::{client_with_timeout, resolve_runner};

type RunTable = Arc<Mutex<HashMap<ComputationTaskId, ManagedRun>>>;

/// Signals shared between a run's `execute` call and breakdown handling.
#[derive(Default)]
struct RunSignals {
    cancel: CancellationToken,
    recovering: AtomicBool,
}

struct ManagedRun {
    config: TaskConfiguration,
    state: RunState,
    generation: u64,
    /// Booked hosts, primary first.
    hosts: Vec<ServiceDescriptor>,
    partition: Partition,
    runner: Option<Arc<dyn RemoteRunner>>,
    run_info: RunInformation,
    signals: Arc<RunSignals>,
}

/// Point-in-time view of a managed run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSnapshot {
    pub task_id: ComputationTaskId,
    pub configuration_id: ConfigurationId,
    pub state: RunState,
    pub hosts: Vec<ServiceId>,
    pub resilient: bool,
}

/// Frees a run's bookings if the owning call is dropped before it cleaned up.
struct CleanupGuard {
    runs: RunTable,
    registry: Arc<dyn ServiceRegistry>,
    task_id: ComputationTaskId,
    generation: u64,
    armed: bool,
}

impl CleanupGuard {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let runs = self.runs.clone();
        let registry = self.registry.clone();
        let task_id = self.task_id.clone();
        let generation = self.generation;
        handle.spawn(async move {
            if take_run(&runs, &task_id, generation).await.is_some() {
                warn!(task_id = %task_id, "Run abandoned by its caller, releasing resources");
                registry.free(&task_id).await;
            }
        });
    }
}

async fn take_run(runs: &RunTable, task_id: &ComputationTaskId, generation: u64) -> Option<ManagedRun> {
    let mut runs = runs.lock().await;
    if runs.get(task_id).is_some_and(|r| r.generation == generation) {
        runs.remove(task_id)
    } else {
        None
    }
}

/// Await `fut`, giving up after `limit` if one is set.
async fn bounded<F: Future>(limit: Option<Duration>, fut: F) -> Option<F::Output> {
    match limit {
        Some(limit) => tokio::time::timeout(limit, fut).await.ok(),
        None => Some(fut.await),
    }
}

/// Long-lived broker between task runners and worker hosts.
pub struct Coordinator {
    config: Config,
    registry: Arc<dyn ServiceRegistry>,
    resilience: Arc<dyn ResilienceStore>,
    connector: Arc<dyn HostConnector>,
    allocator: Arc<dyn ResourceAllocator>,
    callback_client: reqwest::Client,
    runs: RunTable,
    next_generation: AtomicU64,
    shutdown: CancellationToken,
}

impl Coordinator {
    /// Create a coordinator over explicit registry, resilience store and host connector.
    pub fn new(
        config: Config,
        registry: Arc<dyn ServiceRegistry>,
        resilience: Arc<dyn ResilienceStore>,
        connector: Arc<dyn HostConnector>,
    ) -> Self {
        let callback_client = client_with_timeout(Some(config.remote_call_timeout()));
        Self {
            config,
            registry,
            resilience,
            connector,
            allocator: Arc::new(PartitionAllocator),
            callback_client,
            runs: Arc::new(Mutex::new(HashMap::new())),
            next_generation: AtomicU64::new(1),
            shutdown: CancellationToken::new(),
        }
    }

    /// Builder method to replace the resource allocator.
    pub fn with_allocator(mut self, allocator: Arc<dyn ResourceAllocator>) -> Self {
        self.allocator = allocator;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &Arc<dyn ServiceRegistry> {
        &self.registry
    }

    /// Token cancelled once [`CoordinatorApi::shut_down`] ran.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Snapshot of every managed run.
    pub async fn runs(&self) -> Vec<RunSnapshot> {
        self.runs
            .lock()
            .await
            .iter()
            .map(|(task_id, run)| RunSnapshot {
                task_id: task_id.clone(),
                configuration_id: run.config.id.clone(),
                state: run.state,
                hosts: run.hosts.iter().map(|h| h.id.clone()).collect(),
                resilient: run.config.resilient,
            })
            .collect()
    }

    /// Record a sign of life from a service.
    pub async fn heartbeat(&self, service_id: &ServiceId) -> bool {
        self.registry.heartbeat(service_id).await
    }

    /// Store a checkpoint a host took for a resilient run.
    pub async fn record_checkpoint(&self, checkpoint: CheckpointData) -> Result<(), CoordinatorError> {
        let task_id = checkpoint.task_id.clone();
        if self.resilience.store_checkpoint(checkpoint).await {
            Ok(())
        } else {
            Err(CoordinatorError::unknown_task(&task_id))
        }
    }

    /// Book `required` hosts for `task_id`, retrying with a doubling, capped wait.
    async fn book_resources(
        &self,
        config: &TaskConfiguration,
        task_id: &ComputationTaskId,
    ) -> Result<Vec<ServiceDescriptor>, CoordinatorError> {
        let required = self.allocator.required_hosts(config);
        let attempts = self.config.booking_attempts.max(1);
        let max_delay = self.config.booking_max_delay();
        let mut delay = self.config.booking_retry_delay();

        for attempt in 1..=attempts {
            if self.shutdown.is_cancelled() {
                return Err(CoordinatorError::ShutDown);
            }

            let candidates = self.registry.list_unbooked(&config.capability).await;
            let mut booked = Vec::with_capacity(required);
            for candidate in candidates {
                if booked.len() == required {
                    break;
                }
                if self.registry.book(&candidate.id, task_id).await {
                    booked.push(candidate);
                }
            }

            if booked.len() == required {
                info!(
                    task_id = %task_id,
                    attempt,
                    hosts = ?booked.iter().map(|h| h.id.as_str()).collect::<Vec<_>>(),
                    "Resources booked"
                );
                return Ok(booked);
            }
            if !booked.is_empty() {
                self.registry.free(task_id).await;
            }

            if attempt < attempts {
                debug!(
                    task_id = %task_id,
                    attempt,
                    required,
                    wait_ms = delay.as_millis() as u64,
                    "Not enough free hosts, retrying"
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = self.shutdown.cancelled() => return Err(CoordinatorError::ShutDown),
                }
                delay = (delay * 2).min(max_delay);
            }
        }

        warn!(
            task_id = %task_id,
            capability = %config.capability,
            attempts,
            "Booking gave up"
        );
        Err(CoordinatorError::NoResourceAvailable {
            capability: config.capability.clone(),
            attempts,
        })
    }

    /// Drop a run that failed before it started and release its hosts.
    async fn abandon_init(&self, task_id: &ComputationTaskId, generation: u64) {
        if let Some(mut run) = take_run(&self.runs, task_id, generation).await {
            let _ = run.state.transition(RunState::Failed);
            run.partition.clear_processor_state();
            let freed = self.registry.free(task_id).await;
            debug!(task_id = %task_id, freed = freed.len(), "Initialization abandoned");
        }
    }

    /// Handle the loss of a booked host.
    ///
    /// Tries to stop the run, frees everything booked for it and, for
    /// resilient runs, tells the submitting runner to restart or recover.
    /// Never fails: errors along the way are logged and dropped.
    pub async fn handle_breakdown(&self, task_id: &ComputationTaskId, broken_host: &ServiceId) {
        warn!(task_id = %task_id, service_id = %broken_host, "Host breakdown");
        self.registry.unregister(broken_host).await;

        let run = self.runs.lock().await.remove(task_id);
        let Some(mut run) = run else {
            let freed = self.registry.free(task_id).await;
            debug!(task_id = %task_id, freed = freed.len(), "Breakdown for unmanaged run");
            return;
        };

        if let Some(primary) = run.hosts.first() {
            let host = self.connector.connect(primary);
            match tokio::time::timeout(self.config.remote_call_timeout(), host.stop(task_id)).await {
                Ok(Ok(())) => debug!(task_id = %task_id, "Defensive stop delivered"),
                Ok(Err(e)) => debug!(task_id = %task_id, error = %e, "Defensive stop failed"),
                Err(_) => debug!(task_id = %task_id, "Defensive stop timed out"),
            }
        }

        self.registry.free(task_id).await;
        run.partition.clear_processor_state();
        let _ = run.state.transition(RunState::CleanedUp);

        let resilient = run.config.resilient && self.resilience.is_registered(task_id).await;
        let runner = if resilient { run.runner.clone() } else { None };
        if runner.is_some() {
            run.signals.recovering.store(true, Ordering::SeqCst);
        }
        run.signals.cancel.cancel();

        let Some(runner) = runner else {
            if resilient {
                warn!(task_id = %task_id, "Resilient run has no runner reference, cannot recover");
            }
            return;
        };

        match self.resilience.latest_checkpoint(task_id).await {
            None => {
                info!(task_id = %task_id, "No checkpoint, restarting run");
                if let Err(e) = runner.restart_task(task_id).await {
                    error!(task_id = %task_id, error = %e, "Restart callback failed");
                }
            }
            Some(checkpoint) => {
                info!(task_id = %task_id, step = checkpoint.step, "Recovering run from checkpoint");
                if let Err(e) = runner.recover_task(task_id, checkpoint).await {
                    error!(task_id = %task_id, error = %e, "Recover callback failed");
                }
            }
        }
    }

    /// Run breakdown handling for every run booked on a host that stopped
    /// sending heartbeats. Unbooked stale hosts are simply unregistered.
    /// Returns the number of hosts found stale.
    pub async fn check_heartbeats(&self, timeout: Duration) -> usize {
        let timeout = chrono::Duration::from_std(timeout).unwrap_or_else(|_| chrono::Duration::zero());
        let stale = self.registry.stale_since(Utc::now() - timeout).await;
        for service in &stale {
            match service.booking.booked_for() {
                Some(task_id) => self.handle_breakdown(task_id, &service.descriptor.id).await,
                None => {
                    warn!(service_id = %service.descriptor.id, "Service missed heartbeats, unregistering");
                    self.registry.unregister(&service.descriptor.id).await;
                }
            }
        }
        stale.len()
    }
}

enum StartOutcome {
    Finished(RunInformation),
    Transport(TransportError),
    TimedOut,
    Cancelled,
}

#[async_trait]
impl CoordinatorApi for Coordinator {
    async fn register(&self, service: ServiceDescriptor) -> Result<Option<String>, CoordinatorError> {
        if self.shutdown.is_cancelled() {
            return Err(CoordinatorError::ShutDown);
        }
        let warning = if service.version != self.config.framework_version {
            let message = format!(
                "service {} runs framework version {}, master runs {}",
                service.id, service.version, self.config.framework_version
            );
            warn!(
                service_id = %service.id,
                service_version = %service.version,
                master_version = %self.config.framework_version,
                "Framework version mismatch"
            );
            Some(message)
        } else {
            None
        };
        self.registry.register(service).await;
        Ok(warning)
    }

    async fn unregister(&self, service_id: &ServiceId) -> Result<(), CoordinatorError> {
        match self.registry.unregister(service_id).await {
            Some(_) => Ok(()),
            None => Err(CoreError::ServiceNotFound(service_id.to_string()).into()),
        }
    }

    async fn execute_simulation_configuration(
        &self,
        config: TaskConfiguration,
        task_id: ComputationTaskId,
        runner: Option<RunnerRef>,
        resume: Option<CheckpointData>,
    ) -> Result<RemoteInitialization, CoordinatorError> {
        if self.shutdown.is_cancelled() {
            return Err(CoordinatorError::ShutDown);
        }
        config.validate()?;

        let mut run_info = RunInformation::new(task_id.clone(), config.id.clone());
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        let signals = Arc::new(RunSignals::default());
        {
            let mut runs = self.runs.lock().await;
            if runs.contains_key(&task_id) {
                return Err(CoordinatorError::AlreadyManaged(task_id));
            }
            let mut state = RunState::Requested;
            state.transition(RunState::Booking)?;
            runs.insert(
                task_id.clone(),
                ManagedRun {
                    config: config.clone(),
                    state,
                    generation,
                    hosts: Vec::new(),
                    partition: Partition::new(0),
                    runner: runner.map(|r| resolve_runner(r, &self.callback_client)),
                    run_info: run_info.clone(),
                    signals: signals.clone(),
                },
            );
        }
        info!(
            task_id = %task_id,
            configuration_id = %config.id,
            capability = %config.capability,
            partitions = config.partitions,
            resume = resume.is_some(),
            "Booking resources for configuration"
        );

        let booked = match self.book_resources(&config, &task_id).await {
            Ok(booked) => booked,
            Err(CoordinatorError::NoResourceAvailable { capability, attempts }) => {
                take_run(&self.runs, &task_id, generation).await;
                run_info.fail(
                    FailureKind::NoResourceAvailable,
                    format!(
                        "no free host with capability '{}' after {} attempts",
                        capability, attempts
                    ),
                    None,
                );
                return Ok(RemoteInitialization { task_id, run_info });
            }
            Err(e) => {
                take_run(&self.runs, &task_id, generation).await;
                self.registry.free(&task_id).await;
                return Err(e);
            }
        };

        let partition = self.allocator.partition(&config, &booked);
        {
            let mut runs = self.runs.lock().await;
            match runs.get_mut(&task_id) {
                Some(run) if run.generation == generation => {
                    run.hosts = booked.clone();
                    run.partition = partition.clone();
                }
                _ => {
                    drop(runs);
                    self.registry.free(&task_id).await;
                    run_info.fail(FailureKind::HostBreakdown, "run dropped while booking", None);
                    if signals.recovering.load(Ordering::SeqCst) {
                        run_info.supersede();
                    }
                    return Ok(RemoteInitialization { task_id, run_info });
                }
            }
        }
        let guard = CleanupGuard {
            runs: self.runs.clone(),
            registry: self.registry.clone(),
            task_id: task_id.clone(),
            generation,
            armed: true,
        };

        let primary = booked[0].clone();
        let request = InitializeRunRequest {
            task_id: task_id.clone(),
            config: config.clone(),
            auxiliary: booked[1..].to_vec(),
            partition,
            resume,
        };
        let host = self.connector.connect(&primary);
        run_info.host = Some(primary.id.clone());

        let outcome = tokio::select! {
            result = tokio::time::timeout(self.config.remote_call_timeout(), host.initialize(request)) => Some(result),
            _ = signals.cancel.cancelled() => None,
        };
        let failure = match outcome {
            Some(Ok(Ok(remote))) if !remote.is_failed() => None,
            Some(Ok(Ok(remote))) => {
                let failure = remote.failure.unwrap_or_else(|| simrun_core::RunFailure {
                    kind: FailureKind::SetupFailure,
                    message: "host reported setup failure".to_string(),
                    cause: None,
                });
                Some((FailureKind::SetupFailure, failure.message, failure.cause))
            }
            Some(Ok(Err(e))) => Some((
                FailureKind::RemoteDispatchFailure,
                format!("initialization on {} failed", primary.id),
                Some(e.to_string()),
            )),
            Some(Err(_)) => Some((
                FailureKind::RemoteDispatchFailure,
                format!("initialization on {} timed out", primary.id),
                None,
            )),
            None => Some((
                FailureKind::HostBreakdown,
                format!("run cancelled while initializing on {}", primary.id),
                None,
            )),
        };

        if let Some((kind, message, cause)) = failure {
            warn!(task_id = %task_id, service_id = %primary.id, error = %message, "Remote initialization failed");
            run_info.fail(kind, message, cause);
            if signals.recovering.load(Ordering::SeqCst) {
                run_info.supersede();
            }
            self.abandon_init(&task_id, generation).await;
            guard.disarm();
            return Ok(RemoteInitialization { task_id, run_info });
        }

        run_info.initialized();
        {
            let mut runs = self.runs.lock().await;
            match runs.get_mut(&task_id) {
                Some(run) if run.generation == generation => {
                    run.state.transition(RunState::Initialized)?;
                    run.run_info = run_info.clone();
                }
                _ => {
                    guard.disarm();
                    run_info.fail(FailureKind::HostBreakdown, "run dropped during initialization", None);
                    if signals.recovering.load(Ordering::SeqCst) {
                        run_info.supersede();
                    }
                    return Ok(RemoteInitialization { task_id, run_info });
                }
            }
        }
        guard.disarm();

        if config.resilient {
            let hosts = booked.iter().map(|h| h.id.clone()).collect();
            self.resilience.register_run(&task_id, hosts).await;
        }

        info!(task_id = %task_id, service_id = %primary.id, "Run initialized");
        Ok(RemoteInitialization { task_id, run_info })
    }

    async fn execute(
        &self,
        task_id: &ComputationTaskId,
        runner: Option<RunnerRef>,
    ) -> Result<RunInformation, CoordinatorError> {
        let (primary, signals, generation, resilient, mut run_info) = {
            let mut runs = self.runs.lock().await;
            let run = runs
                .get_mut(task_id)
                .ok_or_else(|| CoordinatorError::unknown_task(task_id))?;
            run.state.transition(RunState::Running)?;
            if let Some(runner) = runner {
                run.runner = Some(resolve_runner(runner, &self.callback_client));
            }
            let primary = run
                .hosts
                .first()
                .cloned()
                .ok_or_else(|| CoordinatorError::unknown_task(task_id))?;
            (
                primary,
                run.signals.clone(),
                run.generation,
                run.config.resilient,
                run.run_info.clone(),
            )
        };
        let guard = CleanupGuard {
            runs: self.runs.clone(),
            registry: self.registry.clone(),
            task_id: task_id.clone(),
            generation,
            armed: true,
        };

        info!(task_id = %task_id, service_id = %primary.id, "Starting run");
        run_info.start();
        let host = self.connector.connect(&primary);
        let outcome = tokio::select! {
            result = bounded(self.config.run_timeout(), host.start(task_id)) => match result {
                Some(Ok(remote)) => StartOutcome::Finished(remote),
                Some(Err(e)) => StartOutcome::Transport(e),
                None => StartOutcome::TimedOut,
            },
            _ = signals.cancel.cancelled() => StartOutcome::Cancelled,
        };

        match outcome {
            StartOutcome::Finished(remote) if remote.is_success() => run_info.complete(),
            StartOutcome::Finished(remote) => {
                let (kind, message, cause) = match remote.failure {
                    Some(f) => (f.kind, f.message, f.cause),
                    None => (
                        FailureKind::ExecutionFailure,
                        "host reported no outcome".to_string(),
                        None,
                    ),
                };
                run_info.fail(kind, message, cause);
            }
            StartOutcome::Transport(e) if resilient && e.is_unreachable() => {
                warn!(task_id = %task_id, service_id = %primary.id, error = %e, "Host unreachable during run");
                self.handle_breakdown(task_id, &primary.id).await;
                run_info.fail(
                    FailureKind::HostBreakdown,
                    format!("host {} became unreachable", primary.id),
                    Some(e.to_string()),
                );
            }
            StartOutcome::Transport(e) => {
                run_info.fail(
                    FailureKind::RemoteDispatchFailure,
                    format!("starting run on {} failed", primary.id),
                    Some(e.to_string()),
                );
            }
            StartOutcome::TimedOut => {
                if let Err(e) = host.stop(task_id).await {
                    debug!(task_id = %task_id, error = %e, "Stop after timeout failed");
                }
                run_info.fail(
                    FailureKind::RemoteDispatchFailure,
                    format!("run on {} exceeded the run timeout", primary.id),
                    None,
                );
            }
            StartOutcome::Cancelled => {
                let message = if self.shutdown.is_cancelled() {
                    "coordinator shut down while the run was executing".to_string()
                } else {
                    format!("host breakdown while running on {}", primary.id)
                };
                run_info.fail(FailureKind::HostBreakdown, message, None);
            }
        }
        if signals.recovering.load(Ordering::SeqCst) {
            run_info.supersede();
        }

        let final_state = if run_info.is_success() {
            RunState::Completed
        } else {
            RunState::Failed
        };
        if let Some(mut run) = take_run(&self.runs, task_id, generation).await {
            if let Err(e) = run.state.transition(final_state) {
                warn!(task_id = %task_id, error = %e, "Unexpected run state at completion");
            }
            run.partition.clear_processor_state();
            let _ = run.state.transition(RunState::CleanedUp);
            let freed = self.registry.free(task_id).await;
            debug!(task_id = %task_id, freed = freed.len(), "Run cleaned up");
            if !run_info.superseded {
                self.resilience.remove_run(task_id).await;
            }
        }
        guard.disarm();

        info!(
            task_id = %task_id,
            success = run_info.is_success(),
            superseded = run_info.superseded,
            error = ?run_info.error_message(),
            "Run finished"
        );
        Ok(run_info)
    }

    async fn stop(&self, task_id: &ComputationTaskId) -> Result<(), CoordinatorError> {
        let primary = {
            let runs = self.runs.lock().await;
            runs.get(task_id).and_then(|r| r.hosts.first().cloned())
        }
        .ok_or_else(|| CoordinatorError::unknown_task(task_id))?;

        info!(task_id = %task_id, service_id = %primary.id, "Stopping run");
        let host = self.connector.connect(&primary);
        match tokio::time::timeout(self.config.remote_call_timeout(), host.stop(task_id)).await {
            Ok(result) => result.map_err(CoordinatorError::from),
            Err(_) => Err(TransportError::Timeout {
                target: primary.endpoint.clone(),
            }
            .into()),
        }
    }

    async fn get_partition(&self, task_id: &ComputationTaskId) -> Result<Partition, CoordinatorError> {
        self.runs
            .lock()
            .await
            .get(task_id)
            .map(|r| r.partition.clone())
            .ok_or_else(|| CoordinatorError::unknown_task(task_id))
    }

    async fn get_run_property(
        &self,
        task_id: &ComputationTaskId,
        name: &str,
    ) -> Result<Option<Value>, CoordinatorError> {
        let primary = {
            let runs = self.runs.lock().await;
            runs.get(task_id).and_then(|r| r.hosts.first().cloned())
        }
        .ok_or_else(|| CoordinatorError::unknown_task(task_id))?;

        let host = self.connector.connect(&primary);
        match tokio::time::timeout(
            self.config.remote_call_timeout(),
            host.run_property(task_id, name),
        )
        .await
        {
            Ok(result) => result.map_err(CoordinatorError::from),
            Err(_) => Err(TransportError::Timeout {
                target: primary.endpoint.clone(),
            }
            .into()),
        }
    }

    async fn shut_down(&self) -> Result<usize, CoordinatorError> {
        if self.shutdown.is_cancelled() {
            return Ok(0);
        }
        self.shutdown.cancel();
        info!("Coordinator shutting down");

        let services = self.registry.broadcast_abort().await;
        let timeout = self.config.remote_call_timeout();
        let aborts = services.iter().map(|service| {
            let host = self.connector.connect(service);
            async move {
                match tokio::time::timeout(timeout, host.abort()).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!(service_id = %service.id, error = %e, "Abort failed"),
                    Err(_) => warn!(service_id = %service.id, "Abort timed out"),
                }
            }
        });
        join_all(aborts).await;

        let runs: Vec<ManagedRun> = self.runs.lock().await.drain().map(|(_, run)| run).collect();
        for run in &runs {
            run.signals.cancel.cancel();
        }
        self.resilience.shutdown().await;

        info!(
            aborted_services = services.len(),
            dropped_runs = runs.len(),
            "Coordinator shut down"
        );
        Ok(services.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex as StdMutex;

    use serde_json::json;

    use crate::registry::InMemoryRegistry;
    use crate::remote::RemoteHost;
    use crate::resilience::InMemoryResilienceStore;
    use simrun_core::ModelReference;

    #[derive(Clone, Copy, PartialEq)]
    enum Behaviour {
        Succeed,
        FailSetup,
        FailRun,
        Unreachable,
        Hang,
    }

    #[derive(Default)]
    struct MockHosts {
        behaviour: StdMutex<HashMap<ServiceId, Behaviour>>,
        calls: StdMutex<Vec<String>>,
        init_requests: StdMutex<Vec<InitializeRunRequest>>,
    }

    impl MockHosts {
        fn set(&self, id: &str, behaviour: Behaviour) {
            self.behaviour.lock().unwrap().insert(ServiceId::new(id), behaviour);
        }

        fn behaviour(&self, id: &ServiceId) -> Behaviour {
            *self.behaviour.lock().unwrap().get(id).unwrap_or(&Behaviour::Succeed)
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    struct MockHost {
        id: ServiceId,
        hosts: Arc<MockHosts>,
    }

    fn unreachable(id: &ServiceId) -> TransportError {
        TransportError::Request {
            target: id.to_string(),
            message: "connection refused".to_string(),
        }
    }

    #[async_trait]
    impl RemoteHost for MockHost {
        async fn initialize(&self, request: InitializeRunRequest) -> Result<RunInformation, TransportError> {
            self.hosts.calls.lock().unwrap().push(format!("init:{}", self.id));
            let mut info = RunInformation::new(request.task_id.clone(), request.config.id.clone());
            self.hosts.init_requests.lock().unwrap().push(request);
            match self.hosts.behaviour(&self.id) {
                Behaviour::Unreachable => Err(unreachable(&self.id)),
                Behaviour::FailSetup => {
                    info.fail(FailureKind::SetupFailure, "bad model", Some("parse error".into()));
                    Ok(info)
                }
                _ => {
                    info.initialized();
                    Ok(info)
                }
            }
        }

        async fn start(&self, task_id: &ComputationTaskId) -> Result<RunInformation, TransportError> {
            self.hosts.calls.lock().unwrap().push(format!("start:{}", self.id));
            let mut info = RunInformation::new(task_id.clone(), ConfigurationId::new("remote"));
            match self.hosts.behaviour(&self.id) {
                Behaviour::Unreachable => Err(unreachable(&self.id)),
                Behaviour::Hang => std::future::pending().await,
                Behaviour::FailRun => {
                    info.fail(FailureKind::ExecutionFailure, "diverged", None);
                    Ok(info)
                }
                _ => {
                    info.complete();
                    Ok(info)
                }
            }
        }

        async fn stop(&self, _task_id: &ComputationTaskId) -> Result<(), TransportError> {
            self.hosts.calls.lock().unwrap().push(format!("stop:{}", self.id));
            match self.hosts.behaviour(&self.id) {
                Behaviour::Unreachable => Err(unreachable(&self.id)),
                _ => Ok(()),
            }
        }

        async fn run_property(
            &self,
            _task_id: &ComputationTaskId,
            name: &str,
        ) -> Result<Option<Value>, TransportError> {
            Ok((name == "step").then(|| json!(7)))
        }

        async fn abort(&self) -> Result<(), TransportError> {
            self.hosts.calls.lock().unwrap().push(format!("abort:{}", self.id));
            Ok(())
        }
    }

    struct MockConnector(Arc<MockHosts>);

    impl HostConnector for MockConnector {
        fn connect(&self, service: &ServiceDescriptor) -> Arc<dyn RemoteHost> {
            Arc::new(MockHost {
                id: service.id.clone(),
                hosts: self.0.clone(),
            })
        }
    }

    #[derive(Default)]
    struct RecordingRunner {
        restarts: AtomicUsize,
        recoveries: StdMutex<Vec<CheckpointData>>,
    }

    #[async_trait]
    impl RemoteRunner for RecordingRunner {
        async fn restart_task(&self, _task_id: &ComputationTaskId) -> Result<(), TransportError> {
            self.restarts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn recover_task(
            &self,
            _task_id: &ComputationTaskId,
            checkpoint: CheckpointData,
        ) -> Result<(), TransportError> {
            self.recoveries.lock().unwrap().push(checkpoint);
            Ok(())
        }
    }

    struct Fixture {
        coordinator: Arc<Coordinator>,
        registry: Arc<InMemoryRegistry>,
        hosts: Arc<MockHosts>,
        runner: Arc<RecordingRunner>,
    }

    impl Fixture {
        fn runner_ref(&self) -> Option<RunnerRef> {
            Some(RunnerRef::InProcess(self.runner.clone()))
        }

        async fn add_hosts(&self, ids: &[&str]) {
            for id in ids {
                self.coordinator
                    .register(ServiceDescriptor::new(
                        ServiceId::new(*id),
                        "simulation",
                        format!("http://{}", id),
                    ))
                    .await
                    .unwrap();
            }
        }

        async fn init(&self, config: TaskConfiguration) -> RemoteInitialization {
            self.coordinator
                .execute_simulation_configuration(
                    config,
                    ComputationTaskId::generate(),
                    self.runner_ref(),
                    None,
                )
                .await
                .unwrap()
        }
    }

    fn test_config() -> Config {
        Config {
            booking_attempts: 3,
            booking_retry_delay_ms: 1,
            booking_max_delay_ms: 2,
            remote_call_timeout_secs: 2,
            ..Config::default()
        }
    }

    fn fixture() -> Fixture {
        let registry = Arc::new(InMemoryRegistry::new());
        let hosts = Arc::new(MockHosts::default());
        let coordinator = Coordinator::new(
            test_config(),
            registry.clone(),
            Arc::new(InMemoryResilienceStore::new()),
            Arc::new(MockConnector(hosts.clone())),
        );
        Fixture {
            coordinator: Arc::new(coordinator),
            registry,
            hosts,
            runner: Arc::new(RecordingRunner::default()),
        }
    }

    fn remote_config() -> TaskConfiguration {
        TaskConfiguration::new(ModelReference::new("inline:")).on_master_server()
    }

    #[tokio::test]
    async fn test_execute_happy_path_frees_resources() {
        let f = fixture();
        f.add_hosts(&["h1"]).await;

        let init = f.init(remote_config()).await;
        assert!(init.is_initialized());
        assert_eq!(init.run_info.host, Some(ServiceId::new("h1")));
        assert!(f.registry.list_unbooked("simulation").await.is_empty());
        assert_eq!(f.coordinator.runs().await[0].state, RunState::Initialized);

        let info = f.coordinator.execute(&init.task_id, None).await.unwrap();
        assert!(info.is_success());
        assert!(info.run_duration_ms.is_some());
        assert_eq!(f.registry.list_unbooked("simulation").await.len(), 1);
        assert!(f.coordinator.runs().await.is_empty());
    }

    #[tokio::test]
    async fn test_no_free_host_terminates_with_failure() {
        let f = fixture();
        let init = tokio::time::timeout(Duration::from_secs(5), f.init(remote_config()))
            .await
            .expect("booking must give up");
        assert!(!init.is_initialized());
        assert_eq!(
            init.run_info.failure_kind(),
            Some(FailureKind::NoResourceAvailable)
        );
        assert!(f.coordinator.runs().await.is_empty());
    }

    #[tokio::test]
    async fn test_partitioned_run_books_in_registry_order() {
        let f = fixture();
        f.add_hosts(&["h1", "h2", "h3"]).await;

        let init = f.init(remote_config().with_partitions(2)).await;
        assert!(init.is_initialized());

        let booked = f.registry.services_for(&init.task_id).await;
        assert_eq!(booked.len(), 2);
        let requests = f.hosts.init_requests.lock().unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].auxiliary[0].id, ServiceId::new("h2"));
        assert_eq!(f.hosts.calls(), vec!["init:h1".to_string()]);

        let partition = requests[0].partition.clone();
        assert_eq!(
            partition.hosts(),
            vec![ServiceId::new("h1"), ServiceId::new("h2")]
        );
    }

    #[tokio::test]
    async fn test_partial_booking_released_when_short() {
        let f = fixture();
        f.add_hosts(&["h1"]).await;

        let init = f.init(remote_config().with_partitions(2)).await;
        assert_eq!(
            init.run_info.failure_kind(),
            Some(FailureKind::NoResourceAvailable)
        );
        assert_eq!(f.registry.list_unbooked("simulation").await.len(), 1);
    }

    #[tokio::test]
    async fn test_remote_setup_failure_is_reported_and_freed() {
        let f = fixture();
        f.add_hosts(&["h1"]).await;
        f.hosts.set("h1", Behaviour::FailSetup);

        let init = f.init(remote_config()).await;
        assert!(!init.is_initialized());
        assert_eq!(init.run_info.failure_kind(), Some(FailureKind::SetupFailure));
        assert_eq!(init.run_info.error_message(), Some("bad model"));
        assert_eq!(f.registry.list_unbooked("simulation").await.len(), 1);
        assert!(f.coordinator.runs().await.is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_host_during_init() {
        let f = fixture();
        f.add_hosts(&["h1"]).await;
        f.hosts.set("h1", Behaviour::Unreachable);

        let init = f.init(remote_config()).await;
        assert_eq!(
            init.run_info.failure_kind(),
            Some(FailureKind::RemoteDispatchFailure)
        );
        assert_eq!(f.registry.list_unbooked("simulation").await.len(), 1);
    }

    #[tokio::test]
    async fn test_execution_failure_still_frees() {
        let f = fixture();
        f.add_hosts(&["h1"]).await;
        f.hosts.set("h1", Behaviour::FailRun);

        let init = f.init(remote_config()).await;
        let info = f.coordinator.execute(&init.task_id, None).await.unwrap();
        assert_eq!(info.failure_kind(), Some(FailureKind::ExecutionFailure));
        assert_eq!(f.registry.list_unbooked("simulation").await.len(), 1);
    }

    #[tokio::test]
    async fn test_transport_failure_on_start_non_resilient() {
        let f = fixture();
        f.add_hosts(&["h1"]).await;
        let init = f.init(remote_config()).await;
        f.hosts.set("h1", Behaviour::Unreachable);

        let info = f.coordinator.execute(&init.task_id, None).await.unwrap();
        assert_eq!(
            info.failure_kind(),
            Some(FailureKind::RemoteDispatchFailure)
        );
        assert!(!info.superseded);
        assert_eq!(f.registry.list_unbooked("simulation").await.len(), 1);
        assert_eq!(f.runner.restarts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_execute_unknown_task() {
        let f = fixture();
        let err = f
            .coordinator
            .execute(&ComputationTaskId::new("missing"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::Core(CoreError::UnknownTask(_))));
    }

    #[tokio::test]
    async fn test_stop_unknown_task() {
        let f = fixture();
        let err = f
            .coordinator
            .stop(&ComputationTaskId::new("missing"))
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::Core(CoreError::UnknownTask(_))));
    }

    #[tokio::test]
    async fn test_stop_forwards_to_primary() {
        let f = fixture();
        f.add_hosts(&["h1"]).await;
        let init = f.init(remote_config()).await;
        f.coordinator.stop(&init.task_id).await.unwrap();
        assert!(f.hosts.calls().contains(&"stop:h1".to_string()));
    }

    #[tokio::test]
    async fn test_version_mismatch_warns_but_registers() {
        let f = fixture();
        let warning = f
            .coordinator
            .register(
                ServiceDescriptor::new(ServiceId::new("old"), "simulation", "http://old")
                    .with_version("0.0.1"),
            )
            .await
            .unwrap();
        assert!(warning.unwrap().contains("0.0.1"));
        assert_eq!(f.registry.count("simulation").await, 1);
    }

    #[tokio::test]
    async fn test_unregister_unknown_service() {
        let f = fixture();
        let err = f
            .coordinator
            .unregister(&ServiceId::new("ghost"))
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::Core(CoreError::ServiceNotFound(_))));
    }

    #[tokio::test]
    async fn test_breakdown_without_resilience_frees_and_does_not_recover() {
        let f = fixture();
        f.add_hosts(&["h1", "h2"]).await;
        let init = f.init(remote_config().with_partitions(2)).await;

        f.coordinator
            .handle_breakdown(&init.task_id, &ServiceId::new("h1"))
            .await;

        assert!(f.registry.services_for(&init.task_id).await.is_empty());
        assert_eq!(f.registry.list_unbooked("simulation").await.len(), 1);
        assert_eq!(f.runner.restarts.load(Ordering::SeqCst), 0);
        assert!(f.runner.recoveries.lock().unwrap().is_empty());
        assert!(f.coordinator.runs().await.is_empty());
    }

    #[tokio::test]
    async fn test_breakdown_resilient_without_checkpoint_restarts_once() {
        let f = fixture();
        f.add_hosts(&["h1", "h2"]).await;
        let init = f.init(remote_config().with_resilience()).await;

        f.coordinator
            .handle_breakdown(&init.task_id, &ServiceId::new("h1"))
            .await;

        assert_eq!(f.runner.restarts.load(Ordering::SeqCst), 1);
        assert!(f.runner.recoveries.lock().unwrap().is_empty());
        assert!(f.registry.services_for(&init.task_id).await.is_empty());
    }

    #[tokio::test]
    async fn test_breakdown_resilient_with_checkpoint_recovers_once() {
        let f = fixture();
        f.add_hosts(&["h1"]).await;
        let init = f.init(remote_config().with_resilience()).await;
        f.coordinator
            .record_checkpoint(CheckpointData::new(init.task_id.clone(), 5, json!({"value": 0.3})))
            .await
            .unwrap();

        f.coordinator
            .handle_breakdown(&init.task_id, &ServiceId::new("h1"))
            .await;

        assert_eq!(f.runner.restarts.load(Ordering::SeqCst), 0);
        let recoveries = f.runner.recoveries.lock().unwrap();
        assert_eq!(recoveries.len(), 1);
        assert_eq!(recoveries[0].step, 5);
    }

    #[tokio::test]
    async fn test_breakdown_for_unmanaged_run_only_frees() {
        let f = fixture();
        f.add_hosts(&["h1"]).await;
        let task_id = ComputationTaskId::new("stray");
        f.registry.book(&ServiceId::new("h1"), &task_id).await;

        f.coordinator.handle_breakdown(&task_id, &ServiceId::new("h9")).await;
        assert_eq!(f.registry.list_unbooked("simulation").await.len(), 1);
        assert_eq!(f.runner.restarts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_checkpoint_for_unregistered_run_rejected() {
        let f = fixture();
        let err = f
            .coordinator
            .record_checkpoint(CheckpointData::new(ComputationTaskId::new("x"), 1, json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::Core(CoreError::UnknownTask(_))));
    }

    #[tokio::test]
    async fn test_breakdown_during_execute_supersedes_result() {
        let f = fixture();
        f.add_hosts(&["h1"]).await;
        f.hosts.set("h1", Behaviour::Hang);
        let init = f.init(remote_config().with_resilience()).await;

        let coordinator = f.coordinator.clone();
        let task_id = init.task_id.clone();
        let running = tokio::spawn(async move { coordinator.execute(&task_id, None).await });

        // Wait until the run is marked running.
        for _ in 0..100 {
            if f.coordinator.runs().await.first().map(|r| r.state) == Some(RunState::Running) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        f.coordinator
            .handle_breakdown(&init.task_id, &ServiceId::new("h1"))
            .await;

        let info = running.await.unwrap().unwrap();
        assert!(info.superseded);
        assert_eq!(info.failure_kind(), Some(FailureKind::HostBreakdown));
        assert_eq!(f.runner.restarts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unreachable_resilient_host_triggers_recovery() {
        let f = fixture();
        f.add_hosts(&["h1"]).await;
        let init = f.init(remote_config().with_resilience()).await;
        f.hosts.set("h1", Behaviour::Unreachable);

        let info = f.coordinator.execute(&init.task_id, None).await.unwrap();
        assert!(info.superseded);
        assert_eq!(f.runner.restarts.load(Ordering::SeqCst), 1);
        assert!(f.registry.get(&ServiceId::new("h1")).await.is_none());
    }

    #[tokio::test]
    async fn test_run_property_and_partition() {
        let f = fixture();
        f.add_hosts(&["h1"]).await;
        let init = f.init(remote_config()).await;

        let value = f
            .coordinator
            .get_run_property(&init.task_id, "step")
            .await
            .unwrap();
        assert_eq!(value, Some(json!(7)));
        let partition = f.coordinator.get_partition(&init.task_id).await.unwrap();
        assert_eq!(partition.host, Some(ServiceId::new("h1")));
    }

    #[tokio::test]
    async fn test_shut_down_aborts_services() {
        let f = fixture();
        f.add_hosts(&["h1", "h2"]).await;

        assert_eq!(f.coordinator.shut_down().await.unwrap(), 2);
        assert!(f.registry.list_all().await.is_empty());
        let calls = f.hosts.calls();
        assert!(calls.contains(&"abort:h1".to_string()));
        assert!(calls.contains(&"abort:h2".to_string()));

        let err = f
            .coordinator
            .execute_simulation_configuration(remote_config(), ComputationTaskId::generate(), None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::ShutDown));
        assert_eq!(f.coordinator.shut_down().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_stale_heartbeat_triggers_breakdown() {
        let f = fixture();
        f.add_hosts(&["h1", "idle"]).await;
        let init = f.init(remote_config().with_resilience()).await;
        assert_eq!(init.run_info.host, Some(ServiceId::new("h1")));

        tokio::time::sleep(Duration::from_millis(20)).await;
        let stale = f.coordinator.check_heartbeats(Duration::from_millis(10)).await;

        assert_eq!(stale, 2);
        assert_eq!(f.runner.restarts.load(Ordering::SeqCst), 1);
        assert!(f.registry.list_all().await.is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_task_id_rejected() {
        let f = fixture();
        f.add_hosts(&["h1", "h2"]).await;
        let task_id = ComputationTaskId::new("dup");
        f.coordinator
            .execute_simulation_configuration(remote_config(), task_id.clone(), None, None)
            .await
            .unwrap();
        let err = f
            .coordinator
            .execute_simulation_configuration(remote_config(), task_id, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::AlreadyManaged(_)));
    }
}
