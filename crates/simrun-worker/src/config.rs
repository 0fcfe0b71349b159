//! Worker configuration.

use std::time::Duration;

use simrun_core::{ServiceId, SIMULATION_CAPABILITY};

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Master server base URL.
    pub master_url: String,

    /// Service ID this worker registers under.
    pub worker_id: ServiceId,

    /// Address the run API listens on.
    pub bind_addr: String,

    /// URL the master uses to reach this worker. Derived from `bind_addr`
    /// when unset.
    pub advertised_endpoint: Option<String>,

    /// Capability class offered to the master.
    pub capability: String,

    /// Heartbeat interval in seconds. The master's answer to registration
    /// takes precedence.
    pub heartbeat_interval_secs: u64,

    /// Delay before registering again after losing the master (seconds).
    pub reconnect_delay_secs: u64,

    /// Timeout for calls to the master (seconds).
    pub call_timeout_secs: u64,
}

impl Config {
    /// Endpoint announced at registration.
    pub fn endpoint(&self) -> String {
        match &self.advertised_endpoint {
            Some(endpoint) => endpoint.clone(),
            None => format!("http://{}", self.bind_addr),
        }
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            master_url: "http://127.0.0.1:7070".to_string(),
            worker_id: ServiceId::generate(),
            bind_addr: "127.0.0.1:7071".to_string(),
            advertised_endpoint: None,
            capability: SIMULATION_CAPABILITY.to_string(),
            heartbeat_interval_secs: 10,
            reconnect_delay_secs: 5,
            call_timeout_secs: 10,
        }
    }
}
