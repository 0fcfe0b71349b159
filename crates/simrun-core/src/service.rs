//! Remote service (worker host) descriptions.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{ComputationTaskId, ServiceId};

/// Identifies a registered remote service and what it can do.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    /// Unique service identifier.
    pub id: ServiceId,

    /// Capability class, e.g. [`crate::SIMULATION_CAPABILITY`].
    pub capability: String,

    /// Base URL the service accepts dispatch requests on.
    pub endpoint: String,

    /// Hostname of the machine running the service.
    pub hostname: String,

    /// Framework version the service was built against.
    pub version: String,

    /// Service-level labels (region, hardware, etc.).
    pub labels: HashMap<String, String>,
}

impl ServiceDescriptor {
    /// Create a new ServiceDescriptor.
    pub fn new(
        id: ServiceId,
        capability: impl Into<String>,
        endpoint: impl Into<String>,
    ) -> Self {
        Self {
            id,
            capability: capability.into(),
            endpoint: endpoint.into(),
            hostname: String::new(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            labels: HashMap::new(),
        }
    }

    /// Builder method to set the hostname.
    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = hostname.into();
        self
    }

    /// Builder method to set the declared version.
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// Builder method to add a label.
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Check if this service offers a capability.
    pub fn has_capability(&self, capability: &str) -> bool {
        self.capability == capability
    }
}

/// Booking state of a registered service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "task_id", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BookingState {
    /// Available for booking.
    #[default]
    Free,
    /// Exclusively booked for one run.
    Booked(ComputationTaskId),
}

impl BookingState {
    /// Returns true if the service can be booked.
    pub fn is_free(&self) -> bool {
        matches!(self, Self::Free)
    }

    /// Task the service is booked for.
    pub fn booked_for(&self) -> Option<&ComputationTaskId> {
        match self {
            Self::Free => None,
            Self::Booked(id) => Some(id),
        }
    }
}

/// Registry view of a service: descriptor plus booking and liveness.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceInfo {
    /// Service description.
    pub descriptor: ServiceDescriptor,

    /// Current booking.
    pub booking: BookingState,

    /// When the service registered.
    pub registered_at: DateTime<Utc>,

    /// Last time the service proved it was alive.
    pub last_heartbeat: DateTime<Utc>,
}

impl ServiceInfo {
    /// Create a fresh, unbooked entry.
    pub fn new(descriptor: ServiceDescriptor) -> Self {
        let now = Utc::now();
        Self {
            descriptor,
            booking: BookingState::Free,
            registered_at: now,
            last_heartbeat: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_service_is_free() {
        let info = ServiceInfo::new(ServiceDescriptor::new(
            ServiceId::new("h1"),
            "simulation",
            "http://h1:7000",
        ));
        assert!(info.booking.is_free());
        assert_eq!(info.booking.booked_for(), None);
    }

    #[test]
    fn test_booking_state_serialization() {
        let state = BookingState::Booked(ComputationTaskId::new("t1"));
        let json = serde_json::to_string(&state).unwrap();
        assert_eq!(json, r#"{"state":"BOOKED","task_id":"t1"}"#);
    }
}
