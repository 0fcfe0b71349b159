//! Contracts between the orchestration layer and the computation it runs.
//!
//! The orchestration code never knows what a computation does. A
//! [`SetupStrategy`], selected by name from the configuration, turns a model
//! and its parameters into a [`ComputationHandle`] that is then driven to
//! completion on a blocking thread with a [`RunContext`].

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::{ComputationTaskId, ModelReference, ServiceDescriptor, TaskConfiguration};

/// Errors raised while reading a model.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("Model not found: {0}")]
    NotFound(String),

    #[error("Failed to read model '{reference}': {source}")]
    Io {
        reference: String,
        #[source]
        source: std::io::Error,
    },
}

/// Errors raised while setting up or running a computation.
#[derive(Debug, Error)]
pub enum ComputationError {
    #[error("Unknown setup strategy: {0}")]
    UnknownStrategy(String),

    #[error("Model error: {0}")]
    Model(#[from] ModelError),

    #[error("Setup failed: {0}")]
    Setup(String),

    #[error("Computation failed: {0}")]
    Execution(String),

    #[error("Computation stopped before completion")]
    Stopped,
}

/// Checkpoint written by a running computation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointData {
    /// Run the checkpoint belongs to.
    pub task_id: ComputationTaskId,

    /// Progress marker (e.g. simulation step).
    pub step: u64,

    /// Opaque computation state needed to resume.
    pub state: Value,

    /// When the checkpoint was taken.
    pub created_at: DateTime<Utc>,
}

impl CheckpointData {
    /// Create a checkpoint stamped with the current time.
    pub fn new(task_id: ComputationTaskId, step: u64, state: Value) -> Self {
        Self {
            task_id,
            step,
            state,
            created_at: Utc::now(),
        }
    }
}

/// A model loaded from a [`ModelReference`].
#[derive(Debug, Clone, PartialEq)]
pub struct Model {
    pub reference: ModelReference,
    pub source: String,
}

/// Loads models by reference.
pub trait ModelReader: Send + Sync {
    fn read(&self, reference: &ModelReference) -> Result<Model, ModelError>;
}

/// Reads `inline:<source>` references verbatim and anything else from disk.
#[derive(Debug, Clone, Default)]
pub struct DefaultModelReader {
    base_dir: Option<PathBuf>,
}

impl DefaultModelReader {
    /// Create a reader resolving relative paths against `base_dir`.
    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: Some(base_dir.into()),
        }
    }
}

impl ModelReader for DefaultModelReader {
    fn read(&self, reference: &ModelReference) -> Result<Model, ModelError> {
        let raw = reference.as_str();
        if let Some(source) = raw.strip_prefix("inline:") {
            return Ok(Model {
                reference: reference.clone(),
                source: source.to_string(),
            });
        }

        let path = PathBuf::from(raw.strip_prefix("file:").unwrap_or(raw));
        let path = match &self.base_dir {
            Some(base) if path.is_relative() => base.join(path),
            _ => path,
        };
        if !path.exists() {
            return Err(ModelError::NotFound(path.display().to_string()));
        }
        let source = std::fs::read_to_string(&path).map_err(|source| ModelError::Io {
            reference: raw.to_string(),
            source,
        })?;
        Ok(Model {
            reference: reference.clone(),
            source,
        })
    }
}

type CheckpointSink = Arc<dyn Fn(CheckpointData) + Send + Sync>;

/// Execution context handed to a running computation.
///
/// Cloning shares the stop flag, the checkpoint sink and the published
/// properties, so the orchestration side keeps a clone to stop the run or
/// read properties while it executes.
#[derive(Clone)]
pub struct RunContext {
    task_id: ComputationTaskId,
    stop: Arc<AtomicBool>,
    checkpoint_sink: Option<CheckpointSink>,
    properties: Arc<Mutex<BTreeMap<String, Value>>>,
}

impl RunContext {
    /// Create a context without checkpoint sink.
    pub fn new(task_id: ComputationTaskId) -> Self {
        Self {
            task_id,
            stop: Arc::new(AtomicBool::new(false)),
            checkpoint_sink: None,
            properties: Arc::new(Mutex::new(BTreeMap::new())),
        }
    }

    /// Builder method to forward checkpoints to `sink`.
    pub fn with_checkpoint_sink(
        mut self,
        sink: impl Fn(CheckpointData) + Send + Sync + 'static,
    ) -> Self {
        self.checkpoint_sink = Some(Arc::new(sink));
        self
    }

    /// Run this context belongs to.
    pub fn task_id(&self) -> &ComputationTaskId {
        &self.task_id
    }

    /// Ask the computation to stop at its next opportunity.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    /// Whether a stop was requested.
    pub fn is_stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// Whether checkpoints are collected by anyone.
    pub fn accepts_checkpoints(&self) -> bool {
        self.checkpoint_sink.is_some()
    }

    /// Emit a checkpoint.
    pub fn checkpoint(&self, step: u64, state: Value) {
        if let Some(sink) = &self.checkpoint_sink {
            sink(CheckpointData::new(self.task_id.clone(), step, state));
        }
    }

    /// Publish a named run property.
    pub fn publish(&self, name: impl Into<String>, value: Value) {
        self.properties
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(name.into(), value);
    }

    /// Read a published run property.
    pub fn property(&self, name: &str) -> Option<Value> {
        self.properties
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(name)
            .cloned()
    }
}

impl fmt::Debug for RunContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunContext")
            .field("task_id", &self.task_id)
            .field("stop_requested", &self.is_stop_requested())
            .field("accepts_checkpoints", &self.accepts_checkpoints())
            .finish()
    }
}

/// A runnable computation produced by a [`SetupStrategy`].
pub trait ComputationHandle: Send {
    /// Drive the computation to completion. Runs on a blocking thread.
    fn run(&mut self, ctx: &RunContext) -> Result<(), ComputationError>;
}

/// Everything a setup strategy may draw on.
pub struct SetupRequest<'a> {
    pub task_id: &'a ComputationTaskId,
    pub config: &'a TaskConfiguration,
    pub model: Model,
    /// Additional hosts booked for sub-partitioned execution.
    pub resources: &'a [ServiceDescriptor],
    /// Checkpoint to resume from instead of starting fresh.
    pub resume: Option<&'a CheckpointData>,
}

/// Turns a symbolic task description into a runnable handle.
pub trait SetupStrategy: Send + Sync {
    /// Name configurations use to select this strategy.
    fn name(&self) -> &str;

    /// Build the computation.
    fn setup(&self, request: SetupRequest<'_>) -> Result<Box<dyn ComputationHandle>, ComputationError>;
}

/// Setup strategies known to a process, looked up by name.
#[derive(Clone, Default)]
pub struct SetupStrategies {
    strategies: HashMap<String, Arc<dyn SetupStrategy>>,
}

impl SetupStrategies {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a set holding the built-in strategies.
    pub fn with_builtin() -> Self {
        Self::new().with(crate::builtin::StepSimulationSetup)
    }

    /// Builder method to register a strategy.
    pub fn with(mut self, strategy: impl SetupStrategy + 'static) -> Self {
        self.register(Arc::new(strategy));
        self
    }

    /// Register a strategy, replacing any with the same name.
    pub fn register(&mut self, strategy: Arc<dyn SetupStrategy>) {
        self.strategies.insert(strategy.name().to_string(), strategy);
    }

    /// Look up the strategy named by a configuration.
    pub fn get(&self, name: &str) -> Result<Arc<dyn SetupStrategy>, ComputationError> {
        self.strategies
            .get(name)
            .cloned()
            .ok_or_else(|| ComputationError::UnknownStrategy(name.to_string()))
    }

    /// Registered strategy names.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.strategies.keys().cloned().collect();
        names.sort();
        names
    }
}

impl fmt::Debug for SetupStrategies {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SetupStrategies")
            .field("names", &self.names())
            .finish()
    }
}
