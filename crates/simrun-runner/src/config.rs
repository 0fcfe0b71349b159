//! Task runner configuration.

/// Task runner configuration.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Maximum number of runs executing at the same time.
    pub max_parallel_runs: usize,

    /// Whether a failed run aborts its owning controller.
    pub cancel_on_error: bool,

    /// Base URL of this runner's callback server, announced to the
    /// coordinator for restart/recover notifications.
    pub callback_url: Option<String>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            max_parallel_runs: 4,
            cancel_on_error: false,
            callback_url: None,
        }
    }
}
