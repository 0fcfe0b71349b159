//! Batch files: the JSON documents `simrun submit` reads.
//!
//! A batch file is either a single configuration object or an array of them:
//!
//! ```json
//! [
//!   { "model": "models/logistic.json", "parameters": { "steps": 50 } },
//!   { "model": "inline:{\"steps\": 10}", "remote": true, "resilient": true }
//! ]
//! ```

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use simrun_core::{CoreError, ModelReference, TaskConfiguration};

#[derive(Debug, Error)]
pub enum BatchError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("Invalid batch file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Batch entry {index}: {source}")]
    Invalid { index: usize, source: CoreError },

    #[error("Batch file contains no configurations")]
    Empty,
}

/// One configuration as written in a batch file.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BatchEntry {
    pub model: String,
    #[serde(default)]
    pub setup_strategy: Option<String>,
    #[serde(default)]
    pub parameters: BTreeMap<String, Value>,
    #[serde(default)]
    pub data_storage: bool,
    #[serde(default)]
    pub remote: bool,
    #[serde(default)]
    pub resilient: bool,
    #[serde(default)]
    pub partitions: Option<u32>,
    #[serde(default)]
    pub capability: Option<String>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

impl BatchEntry {
    pub fn into_configuration(self) -> TaskConfiguration {
        let mut config = TaskConfiguration::new(ModelReference::new(self.model));
        if let Some(strategy) = self.setup_strategy {
            config = config.with_setup_strategy(strategy);
        }
        for (name, value) in self.parameters {
            config = config.with_parameter(name, value);
        }
        for (key, value) in self.labels {
            config = config.with_label(key, value);
        }
        if self.data_storage {
            config = config.with_data_storage();
        }
        if self.remote || self.resilient {
            config = config.on_master_server();
        }
        if self.resilient {
            config = config.with_resilience();
        }
        if let Some(partitions) = self.partitions {
            config = config.with_partitions(partitions);
        }
        if let Some(capability) = self.capability {
            config = config.with_capability(capability);
        }
        config
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum BatchDocument {
    Many(Vec<BatchEntry>),
    One(BatchEntry),
}

/// Parse a batch document into validated configurations.
pub fn parse(source: &str) -> Result<Vec<TaskConfiguration>, BatchError> {
    let entries = match serde_json::from_str::<BatchDocument>(source)? {
        BatchDocument::Many(entries) => entries,
        BatchDocument::One(entry) => vec![entry],
    };
    if entries.is_empty() {
        return Err(BatchError::Empty);
    }

    entries
        .into_iter()
        .enumerate()
        .map(|(index, entry)| {
            let config = entry.into_configuration();
            config
                .validate()
                .map_err(|source| BatchError::Invalid { index, source })?;
            Ok(config)
        })
        .collect()
}

pub fn load(path: &Path) -> Result<Vec<TaskConfiguration>, BatchError> {
    let source = std::fs::read_to_string(path).map_err(|source| BatchError::Read {
        path: path.display().to_string(),
        source,
    })?;
    parse(&source)
}
