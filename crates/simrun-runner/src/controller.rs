//! Execution controllers: the owners of submitted configurations.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use tokio::sync::Notify;
use tracing::{info, warn};

use simrun_core::{ConfigurationId, ControllerId, RunInformation, TaskConfiguration};

/// Owner of one or more scheduled configurations.
///
/// Notified once per finished run. Told to stop when one of its runs failed
/// in a way that makes its remaining work pointless.
pub trait ExecutionController: Send + Sync {
    fn id(&self) -> &ControllerId;

    /// A run of `config` reached a final outcome.
    fn on_run_finished(&self, config: &TaskConfiguration, run_info: &RunInformation);

    /// Abort remaining work.
    fn stop(&self, reason: &str);
}

/// Controller that collects run outcomes and lets callers wait for them.
pub struct CollectingController {
    id: ControllerId,
    results: Mutex<Vec<(ConfigurationId, RunInformation)>>,
    stopped: AtomicBool,
    changed: Notify,
}

impl CollectingController {
    pub fn new() -> Self {
        Self {
            id: ControllerId::generate(),
            results: Mutex::new(Vec::new()),
            stopped: AtomicBool::new(false),
            changed: Notify::new(),
        }
    }

    /// Outcomes received so far, in completion order.
    pub fn results(&self) -> Vec<(ConfigurationId, RunInformation)> {
        self.results
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Wait until `count` outcomes arrived or the controller was stopped.
    pub async fn wait_for(&self, count: usize) -> Vec<(ConfigurationId, RunInformation)> {
        loop {
            let changed = self.changed.notified();
            if self.is_stopped() || self.results_len() >= count {
                return self.results();
            }
            changed.await;
        }
    }

    fn results_len(&self) -> usize {
        self.results
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }
}

impl Default for CollectingController {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutionController for CollectingController {
    fn id(&self) -> &ControllerId {
        &self.id
    }

    fn on_run_finished(&self, config: &TaskConfiguration, run_info: &RunInformation) {
        info!(
            controller_id = %self.id,
            configuration_id = %config.id,
            success = run_info.is_success(),
            "Run outcome received"
        );
        self.results
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push((config.id.clone(), run_info.clone()));
        self.changed.notify_waiters();
    }

    fn stop(&self, reason: &str) {
        warn!(controller_id = %self.id, reason = %reason, "Controller stopped");
        self.stopped.store(true, Ordering::SeqCst);
        self.changed.notify_waiters();
    }
}
