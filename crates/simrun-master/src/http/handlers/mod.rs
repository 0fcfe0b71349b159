//! HTTP request handlers.

mod health;
mod runs;
mod services;

pub use health::{health_check, metrics_handler};
pub use runs::{
    execute_configuration, execute_run, get_partition, get_run_property, list_runs,
    record_checkpoint, report_breakdown, shut_down, stop_run,
};
pub use services::{heartbeat, list_services, register_service, unregister_service};
