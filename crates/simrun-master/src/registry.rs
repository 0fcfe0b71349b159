//! Service registry: which hosts exist and which are booked by whom.
//!
//! The registry is the single source of truth for booking state. The
//! coordinator never flips a booking itself; it always goes through
//! [`ServiceRegistry::book`] and [`ServiceRegistry::free`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::{debug, info};

use simrun_core::{BookingState, ComputationTaskId, ServiceDescriptor, ServiceId, ServiceInfo};

/// Pool of registered, bookable services.
#[async_trait]
pub trait ServiceRegistry: Send + Sync {
    /// Add a service, or refresh the descriptor of a known one (keeping its booking).
    async fn register(&self, descriptor: ServiceDescriptor) -> ServiceInfo;

    /// Remove a service.
    async fn unregister(&self, id: &ServiceId) -> Option<ServiceInfo>;

    /// Look up a service.
    async fn get(&self, id: &ServiceId) -> Option<ServiceInfo>;

    /// Unbooked services offering `capability`, in registry order.
    async fn list_unbooked(&self, capability: &str) -> Vec<ServiceDescriptor>;

    /// Atomically book a service for a run. False if it is booked or unknown.
    async fn book(&self, id: &ServiceId, task_id: &ComputationTaskId) -> bool;

    /// Free every service booked for `task_id`. Idempotent; returns what was freed.
    async fn free(&self, task_id: &ComputationTaskId) -> Vec<ServiceId>;

    /// Services currently booked for `task_id`.
    async fn services_for(&self, task_id: &ComputationTaskId) -> Vec<ServiceDescriptor>;

    /// Drop every service and return them so the caller can send aborts.
    async fn broadcast_abort(&self) -> Vec<ServiceDescriptor>;

    /// Number of services offering `capability`.
    async fn count(&self, capability: &str) -> usize;

    /// Every registered service.
    async fn list_all(&self) -> Vec<ServiceInfo>;

    /// Record a sign of life. False if the service is unknown.
    async fn heartbeat(&self, id: &ServiceId) -> bool;

    /// Services whose last heartbeat is older than `cutoff`.
    async fn stale_since(&self, cutoff: DateTime<Utc>) -> Vec<ServiceInfo> {
        self.list_all()
            .await
            .into_iter()
            .filter(|s| s.last_heartbeat < cutoff)
            .collect()
    }
}

/// Registry kept in memory, preserving registration order.
#[derive(Default)]
pub struct InMemoryRegistry {
    services: RwLock<Vec<ServiceInfo>>,
}

impl InMemoryRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ServiceRegistry for InMemoryRegistry {
    async fn register(&self, descriptor: ServiceDescriptor) -> ServiceInfo {
        let mut services = self.services.write().await;
        if let Some(existing) = services.iter_mut().find(|s| s.descriptor.id == descriptor.id) {
            debug!(service_id = %descriptor.id, "Refreshing registered service");
            existing.descriptor = descriptor;
            existing.last_heartbeat = Utc::now();
            return existing.clone();
        }

        info!(
            service_id = %descriptor.id,
            capability = %descriptor.capability,
            endpoint = %descriptor.endpoint,
            "Service registered"
        );
        let info = ServiceInfo::new(descriptor);
        services.push(info.clone());
        info
    }

    async fn unregister(&self, id: &ServiceId) -> Option<ServiceInfo> {
        let mut services = self.services.write().await;
        let position = services.iter().position(|s| &s.descriptor.id == id)?;
        info!(service_id = %id, "Service unregistered");
        Some(services.remove(position))
    }

    async fn get(&self, id: &ServiceId) -> Option<ServiceInfo> {
        self.services
            .read()
            .await
            .iter()
            .find(|s| &s.descriptor.id == id)
            .cloned()
    }

    async fn list_unbooked(&self, capability: &str) -> Vec<ServiceDescriptor> {
        self.services
            .read()
            .await
            .iter()
            .filter(|s| s.booking.is_free() && s.descriptor.has_capability(capability))
            .map(|s| s.descriptor.clone())
            .collect()
    }

    async fn book(&self, id: &ServiceId, task_id: &ComputationTaskId) -> bool {
        let mut services = self.services.write().await;
        match services.iter_mut().find(|s| &s.descriptor.id == id) {
            Some(service) if service.booking.is_free() => {
                service.booking = BookingState::Booked(task_id.clone());
                debug!(service_id = %id, task_id = %task_id, "Service booked");
                true
            }
            _ => false,
        }
    }

    async fn free(&self, task_id: &ComputationTaskId) -> Vec<ServiceId> {
        let mut services = self.services.write().await;
        let mut freed = Vec::new();
        for service in services.iter_mut() {
            if service.booking.booked_for() == Some(task_id) {
                service.booking = BookingState::Free;
                freed.push(service.descriptor.id.clone());
            }
        }
        if !freed.is_empty() {
            debug!(task_id = %task_id, count = freed.len(), "Services freed");
        }
        freed
    }

    async fn services_for(&self, task_id: &ComputationTaskId) -> Vec<ServiceDescriptor> {
        self.services
            .read()
            .await
            .iter()
            .filter(|s| s.booking.booked_for() == Some(task_id))
            .map(|s| s.descriptor.clone())
            .collect()
    }

    async fn broadcast_abort(&self) -> Vec<ServiceDescriptor> {
        let mut services = self.services.write().await;
        services.drain(..).map(|s| s.descriptor).collect()
    }

    async fn count(&self, capability: &str) -> usize {
        self.services
            .read()
            .await
            .iter()
            .filter(|s| s.descriptor.has_capability(capability))
            .count()
    }

    async fn list_all(&self) -> Vec<ServiceInfo> {
        self.services.read().await.clone()
    }

    async fn heartbeat(&self, id: &ServiceId) -> bool {
        let mut services = self.services.write().await;
        match services.iter_mut().find(|s| &s.descriptor.id == id) {
            Some(service) => {
                service.last_heartbeat = Utc::now();
                true
            }
            None => false,
        }
    }
}
