//! Prometheus metrics collection and formatting.
//!
//! This module provides metrics in Prometheus text exposition format.

use std::fmt::Write;

use simrun_core::RunState;

use crate::coordinator::Coordinator;

/// Collect all metrics from the coordinator and format as Prometheus text.
pub async fn collect_metrics(coordinator: &Coordinator) -> String {
    let mut output = String::new();

    collect_service_metrics(coordinator, &mut output).await;
    collect_run_metrics(coordinator, &mut output).await;

    output
}

/// Collect service metrics by booking state.
async fn collect_service_metrics(coordinator: &Coordinator, output: &mut String) {
    let services = coordinator.registry().list_all().await;
    let free = services.iter().filter(|s| s.booking.is_free()).count();
    let booked = services.len() - free;

    writeln!(
        output,
        "# HELP simrun_services_registered Number of registered services by booking state"
    )
    .ok();
    writeln!(output, "# TYPE simrun_services_registered gauge").ok();
    writeln!(output, "simrun_services_registered{{booking=\"free\"}} {free}").ok();
    writeln!(output, "simrun_services_registered{{booking=\"booked\"}} {booked}").ok();
}

/// Collect managed runs by state.
async fn collect_run_metrics(coordinator: &Coordinator, output: &mut String) {
    let runs = coordinator.runs().await;

    writeln!(output).ok();
    writeln!(
        output,
        "# HELP simrun_runs_managed Number of runs managed by the master by state"
    )
    .ok();
    writeln!(output, "# TYPE simrun_runs_managed gauge").ok();
    for state in RunState::all() {
        let count = runs.iter().filter(|r| r.state == *state).count();
        writeln!(output, "simrun_runs_managed{{state=\"{state}\"}} {count}").ok();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use simrun_core::{ServiceDescriptor, ServiceId};

    use crate::api::CoordinatorApi;
    use crate::config::Config;
    use crate::registry::InMemoryRegistry;
    use crate::resilience::InMemoryResilienceStore;
    use crate::transport::HttpHostConnector;

    #[tokio::test]
    async fn test_collect_metrics_counts_services() {
        let config = Config::default();
        let coordinator = Coordinator::new(
            config.clone(),
            Arc::new(InMemoryRegistry::new()),
            Arc::new(InMemoryResilienceStore::new()),
            Arc::new(HttpHostConnector::new(config.remote_call_timeout(), None)),
        );
        coordinator
            .register(ServiceDescriptor::new(ServiceId::new("h1"), "simulation", "http://h1"))
            .await
            .unwrap();

        let output = collect_metrics(&coordinator).await;

        assert!(output.contains("simrun_services_registered{booking=\"free\"} 1"));
        assert!(output.contains("simrun_services_registered{booking=\"booked\"} 0"));
        assert!(output.contains("simrun_runs_managed{state=\"running\"} 0"));
    }
}
