//! simrun Master Server Library
//!
//! The master server books worker hosts for simulation runs, dispatches
//! runs to them, tracks which host runs which task and drives recovery of
//! resilient runs after a host breakdown.

pub mod allocator;
pub mod api;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod http;
pub mod metrics;
pub mod monitor;
pub mod registry;
pub mod remote;
pub mod resilience;
pub mod transport;

pub use allocator::{PartitionAllocator, ResourceAllocator};
pub use api::CoordinatorApi;
pub use config::Config;
pub use coordinator::{Coordinator, RunSnapshot};
pub use error::{CoordinatorError, TransportError};
pub use registry::{InMemoryRegistry, ServiceRegistry};
pub use remote::{HostConnector, RemoteHost, RemoteRunner, RunnerRef};
pub use resilience::{InMemoryResilienceStore, ResilienceStore};
pub use transport::HttpHostConnector;
