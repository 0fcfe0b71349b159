//! Master server configuration.

use std::time::Duration;

/// Master server configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP server bind address.
    pub bind_addr: String,

    /// Framework version services are compared against on registration.
    pub framework_version: String,

    /// How many times booking is attempted before giving up.
    pub booking_attempts: u32,

    /// Wait after the first failed booking attempt (milliseconds).
    pub booking_retry_delay_ms: u64,

    /// Upper bound for the doubling wait between booking attempts (milliseconds).
    pub booking_max_delay_ms: u64,

    /// Timeout for short remote calls: initialize, stop, abort, properties (seconds).
    pub remote_call_timeout_secs: u64,

    /// Upper bound on one run's execution; `None` waits until the host answers
    /// or a breakdown cancels the run.
    pub run_timeout_secs: Option<u64>,

    /// Heartbeat interval announced to services (seconds).
    pub heartbeat_interval_secs: u64,

    /// Heartbeat age after which a service is considered broken down (seconds).
    pub heartbeat_timeout_secs: u64,
}

impl Config {
    pub fn booking_retry_delay(&self) -> Duration {
        Duration::from_millis(self.booking_retry_delay_ms)
    }

    pub fn booking_max_delay(&self) -> Duration {
        Duration::from_millis(self.booking_max_delay_ms.max(self.booking_retry_delay_ms))
    }

    pub fn remote_call_timeout(&self) -> Duration {
        Duration::from_secs(self.remote_call_timeout_secs)
    }

    pub fn run_timeout(&self) -> Option<Duration> {
        self.run_timeout_secs.map(Duration::from_secs)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:7070".to_string(),
            framework_version: env!("CARGO_PKG_VERSION").to_string(),
            booking_attempts: 10,
            booking_retry_delay_ms: 1_000,
            booking_max_delay_ms: 8_000,
            remote_call_timeout_secs: 30,
            run_timeout_secs: None,
            heartbeat_interval_secs: 15,
            heartbeat_timeout_secs: 45,
        }
    }
}
