//! Route paths (axum 0.7 syntax) and helpers building concrete URLs.

use simrun_core::{ComputationTaskId, ServiceId};

// Master
pub const HEALTH: &str = "/health";
pub const METRICS: &str = "/metrics";
pub const SERVICES: &str = "/v1/services";
pub const SERVICE: &str = "/v1/services/:service_id";
pub const SERVICE_HEARTBEAT: &str = "/v1/services/:service_id/heartbeat";
pub const RUNS: &str = "/v1/runs";
pub const RUN_EXECUTE: &str = "/v1/runs/:task_id/execute";
pub const RUN_STOP: &str = "/v1/runs/:task_id/stop";
pub const RUN_PARTITION: &str = "/v1/runs/:task_id/partition";
pub const RUN_PROPERTY: &str = "/v1/runs/:task_id/properties/:name";
pub const RUN_CHECKPOINTS: &str = "/v1/runs/:task_id/checkpoints";
pub const RUN_BREAKDOWN: &str = "/v1/runs/:task_id/breakdown/:service_id";
pub const SHUTDOWN: &str = "/v1/shutdown";

// Worker
pub const WORKER_INIT: &str = "/v1/runs/:task_id/init";
pub const WORKER_START: &str = "/v1/runs/:task_id/start";
pub const WORKER_STOP: &str = "/v1/runs/:task_id/stop";
pub const WORKER_PROPERTY: &str = "/v1/runs/:task_id/properties/:name";
pub const WORKER_ABORT: &str = "/v1/abort";

// Task runner callbacks
pub const TASK_RESTART: &str = "/v1/tasks/:task_id/restart";
pub const TASK_RECOVER: &str = "/v1/tasks/:task_id/recover";

/// Join `base` and `path`, tolerating a trailing slash on `base`.
pub fn url(base: &str, path: &str) -> String {
    format!("{}{}", base.trim_end_matches('/'), path)
}

pub fn service(id: &ServiceId) -> String {
    format!("/v1/services/{}", id)
}

pub fn service_heartbeat(id: &ServiceId) -> String {
    format!("/v1/services/{}/heartbeat", id)
}

/// `/v1/runs/<task_id>/<action>`, used for both master and worker run routes.
pub fn run_action(task_id: &ComputationTaskId, action: &str) -> String {
    format!("/v1/runs/{}/{}", task_id, action)
}

pub fn run_property(task_id: &ComputationTaskId, name: &str) -> String {
    format!("/v1/runs/{}/properties/{}", task_id, name)
}

pub fn run_breakdown(task_id: &ComputationTaskId, service_id: &ServiceId) -> String {
    format!("/v1/runs/{}/breakdown/{}", task_id, service_id)
}

pub fn task_restart(task_id: &ComputationTaskId) -> String {
    format!("/v1/tasks/{}/restart", task_id)
}

pub fn task_recover(task_id: &ComputationTaskId) -> String {
    format!("/v1/tasks/{}/recover", task_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_join() {
        assert_eq!(url("http://h:1/", "/health"), "http://h:1/health");
        assert_eq!(url("http://h:1", "/health"), "http://h:1/health");
    }

    #[test]
    fn test_run_action_matches_route_shape() {
        let path = run_action(&ComputationTaskId::new("t1"), "execute");
        assert_eq!(path, RUN_EXECUTE.replace(":task_id", "t1"));
    }
}
