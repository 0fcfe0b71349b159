//! Task configurations: immutable descriptions of one computation to run.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{ConfigurationId, CoreError};

/// Capability every worker host registers with by default.
pub const SIMULATION_CAPABILITY: &str = "simulation";

/// Setup strategy used when a configuration does not name one.
pub const DEFAULT_SETUP_STRATEGY: &str = "step-simulation";

/// Reference to the model a computation is built from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModelReference(String);

impl ModelReference {
    /// Create a new model reference from a URI-like string.
    pub fn new(uri: impl Into<String>) -> Self {
        Self(uri.into())
    }

    /// Get the inner string reference.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ModelReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// An immutable request to run one computation.
///
/// Built with the `with_*` methods before submission; nothing mutates it
/// after it has been handed to a task runner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskConfiguration {
    /// Process-unique configuration identifier.
    pub id: ConfigurationId,

    /// Model the computation is set up from.
    pub model: ModelReference,

    /// Name of the setup strategy that turns the model into a runnable computation.
    pub setup_strategy: String,

    /// Model parameters.
    pub parameters: BTreeMap<String, Value>,

    /// Whether the run writes into a data-storage sink.
    pub needs_data_storage: bool,

    /// Whether the run executes on the coordinator's remote pool.
    pub use_master_server: bool,

    /// Whether the coordinator should register the run for checkpoint recovery.
    pub resilient: bool,

    /// Number of hosts the run is partitioned over (remote runs only).
    pub partitions: u32,

    /// Capability a host must offer to run this configuration.
    pub capability: String,

    /// Free-form labels.
    pub labels: HashMap<String, String>,

    /// When the configuration was created.
    pub created_at: DateTime<Utc>,
}

impl TaskConfiguration {
    /// Create a local, single-partition configuration for `model`.
    pub fn new(model: ModelReference) -> Self {
        Self {
            id: ConfigurationId::generate(),
            model,
            setup_strategy: DEFAULT_SETUP_STRATEGY.to_string(),
            parameters: BTreeMap::new(),
            needs_data_storage: false,
            use_master_server: false,
            resilient: false,
            partitions: 1,
            capability: SIMULATION_CAPABILITY.to_string(),
            labels: HashMap::new(),
            created_at: Utc::now(),
        }
    }

    /// Builder method to set a model parameter.
    pub fn with_parameter(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.insert(name.into(), value.into());
        self
    }

    /// Builder method to select the setup strategy.
    pub fn with_setup_strategy(mut self, strategy: impl Into<String>) -> Self {
        self.setup_strategy = strategy.into();
        self
    }

    /// Builder method to request a data-storage sink.
    pub fn with_data_storage(mut self) -> Self {
        self.needs_data_storage = true;
        self
    }

    /// Builder method to run on the coordinator's remote pool.
    pub fn on_master_server(mut self) -> Self {
        self.use_master_server = true;
        self
    }

    /// Builder method to enable checkpoint-based recovery.
    pub fn with_resilience(mut self) -> Self {
        self.resilient = true;
        self
    }

    /// Builder method to set the number of partitions.
    pub fn with_partitions(mut self, partitions: u32) -> Self {
        self.partitions = partitions;
        self
    }

    /// Builder method to set the required host capability.
    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.capability = capability.into();
        self
    }

    /// Builder method to add a label.
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Builder method to set a specific ID (useful for testing).
    pub fn with_id(mut self, id: ConfigurationId) -> Self {
        self.id = id;
        self
    }

    /// Look up a parameter.
    pub fn parameter(&self, name: &str) -> Option<&Value> {
        self.parameters.get(name)
    }

    /// Check the configuration can be submitted.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.model.as_str().trim().is_empty() {
            return Err(CoreError::InvalidConfiguration(format!(
                "configuration {} has no model reference",
                self.id
            )));
        }
        if self.setup_strategy.trim().is_empty() {
            return Err(CoreError::InvalidConfiguration(format!(
                "configuration {} has no setup strategy",
                self.id
            )));
        }
        if self.partitions == 0 {
            return Err(CoreError::InvalidConfiguration(format!(
                "configuration {} requests zero partitions",
                self.id
            )));
        }
        if self.use_master_server && self.capability.trim().is_empty() {
            return Err(CoreError::InvalidConfiguration(format!(
                "configuration {} requires a host capability",
                self.id
            )));
        }
        Ok(())
    }
}
