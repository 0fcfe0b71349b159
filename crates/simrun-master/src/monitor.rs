//! Heartbeat monitor: turns services that went silent into breakdowns.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::coordinator::Coordinator;

/// Check heartbeats every `interval` until `shutdown` fires.
pub async fn run_heartbeat_monitor(
    coordinator: Arc<Coordinator>,
    interval: Duration,
    timeout: Duration,
    shutdown: CancellationToken,
) {
    info!(
        interval_secs = interval.as_secs(),
        timeout_secs = timeout.as_secs(),
        "Heartbeat monitor started"
    );
    let mut interval_timer = tokio::time::interval(interval);
    // The first tick completes immediately.
    interval_timer.tick().await;

    loop {
        tokio::select! {
            _ = interval_timer.tick() => {}
            _ = shutdown.cancelled() => break,
        }

        let stale = coordinator.check_heartbeats(timeout).await;
        if stale > 0 {
            warn!(stale, "Services missed their heartbeat");
        } else {
            debug!("All services alive");
        }
    }

    info!("Heartbeat monitor stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    use simrun_core::{ServiceDescriptor, ServiceId};

    use crate::api::CoordinatorApi;
    use crate::config::Config;
    use crate::registry::{InMemoryRegistry, ServiceRegistry};
    use crate::resilience::InMemoryResilienceStore;
    use crate::transport::HttpHostConnector;

    #[tokio::test]
    async fn test_monitor_drops_silent_services_and_stops() {
        let registry = Arc::new(InMemoryRegistry::new());
        let coordinator = Arc::new(Coordinator::new(
            Config::default(),
            registry.clone(),
            Arc::new(InMemoryResilienceStore::new()),
            Arc::new(HttpHostConnector::new(Duration::from_secs(1), None)),
        ));
        coordinator
            .register(ServiceDescriptor::new(ServiceId::new("quiet"), "simulation", "http://quiet"))
            .await
            .unwrap();

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(run_heartbeat_monitor(
            coordinator.clone(),
            Duration::from_millis(10),
            Duration::from_millis(5),
            shutdown.clone(),
        ));

        for _ in 0..100 {
            if registry.list_all().await.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(registry.list_all().await.is_empty());

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
