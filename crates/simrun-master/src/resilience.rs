//! Resilience store: checkpoints and recovery metadata per run.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use simrun_core::{CheckpointData, ComputationTaskId, ServiceId};

/// Persists checkpoints for runs registered as resilient.
#[async_trait]
pub trait ResilienceStore: Send + Sync {
    /// Register a run together with the hosts booked for it.
    /// Re-registering keeps stored checkpoints and replaces the host list.
    async fn register_run(&self, task_id: &ComputationTaskId, hosts: Vec<ServiceId>);

    /// Whether the run is registered.
    async fn is_registered(&self, task_id: &ComputationTaskId) -> bool;

    /// Whether a checkpoint exists for the run.
    async fn has_checkpoint(&self, task_id: &ComputationTaskId) -> bool;

    /// Most advanced checkpoint of the run.
    async fn latest_checkpoint(&self, task_id: &ComputationTaskId) -> Option<CheckpointData>;

    /// Store a checkpoint. False if the run is not registered.
    async fn store_checkpoint(&self, checkpoint: CheckpointData) -> bool;

    /// Forget a run and its checkpoints.
    async fn remove_run(&self, task_id: &ComputationTaskId);

    /// Stop accepting registrations and checkpoints.
    async fn shutdown(&self);
}

#[derive(Debug, Default)]
struct ResilientRun {
    hosts: Vec<ServiceId>,
    latest: Option<CheckpointData>,
}

/// Resilience store kept in memory. Only the latest checkpoint is retained.
#[derive(Default)]
pub struct InMemoryResilienceStore {
    runs: RwLock<HashMap<ComputationTaskId, ResilientRun>>,
    shut_down: AtomicBool,
}

impl InMemoryResilienceStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Hosts registered for a run.
    pub async fn hosts(&self, task_id: &ComputationTaskId) -> Vec<ServiceId> {
        self.runs
            .read()
            .await
            .get(task_id)
            .map(|r| r.hosts.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl ResilienceStore for InMemoryResilienceStore {
    async fn register_run(&self, task_id: &ComputationTaskId, hosts: Vec<ServiceId>) {
        if self.shut_down.load(Ordering::SeqCst) {
            warn!(task_id = %task_id, "Resilience store shut down, run not registered");
            return;
        }
        info!(task_id = %task_id, hosts = hosts.len(), "Run registered for resilience");
        self.runs.write().await.entry(task_id.clone()).or_default().hosts = hosts;
    }

    async fn is_registered(&self, task_id: &ComputationTaskId) -> bool {
        self.runs.read().await.contains_key(task_id)
    }

    async fn has_checkpoint(&self, task_id: &ComputationTaskId) -> bool {
        self.runs
            .read()
            .await
            .get(task_id)
            .is_some_and(|r| r.latest.is_some())
    }

    async fn latest_checkpoint(&self, task_id: &ComputationTaskId) -> Option<CheckpointData> {
        self.runs
            .read()
            .await
            .get(task_id)
            .and_then(|r| r.latest.clone())
    }

    async fn store_checkpoint(&self, checkpoint: CheckpointData) -> bool {
        if self.shut_down.load(Ordering::SeqCst) {
            return false;
        }
        let mut runs = self.runs.write().await;
        let Some(run) = runs.get_mut(&checkpoint.task_id) else {
            return false;
        };
        let newer = run
            .latest
            .as_ref()
            .map_or(true, |current| checkpoint.step >= current.step);
        if newer {
            debug!(task_id = %checkpoint.task_id, step = checkpoint.step, "Checkpoint stored");
            run.latest = Some(checkpoint);
        }
        true
    }

    async fn remove_run(&self, task_id: &ComputationTaskId) {
        self.runs.write().await.remove(task_id);
    }

    async fn shutdown(&self) {
        self.shut_down.store(true, Ordering::SeqCst);
        let count = self.runs.read().await.len();
        info!(tracked_runs = count, "Resilience store shut down");
    }
}
