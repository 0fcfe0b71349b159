//! Data storage sinks attached to configurations that asked for persistence.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tracing::debug;

use simrun_core::{DataStorageId, TaskConfiguration};

use crate::error::StorageError;

/// A sink run results are written into.
pub trait DataStorage: Send + Sync {
    fn id(&self) -> &DataStorageId;

    fn write(&self, key: &str, value: Value) -> Result<(), StorageError>;

    fn flush(&self) -> Result<(), StorageError>;

    /// Flush and release the handle. Further writes fail.
    fn close(&self) -> Result<(), StorageError>;
}

/// Creates one storage handle per configuration.
pub trait DataStorageFactory: Send + Sync {
    fn create(&self, config: &TaskConfiguration) -> Result<Arc<dyn DataStorage>, StorageError>;
}

/// Storage kept in memory.
pub struct InMemoryStorage {
    id: DataStorageId,
    entries: Mutex<BTreeMap<String, Value>>,
    flushed: Mutex<BTreeMap<String, Value>>,
    closed: AtomicBool,
}

impl InMemoryStorage {
    pub fn new(id: DataStorageId) -> Self {
        Self {
            id,
            entries: Mutex::new(BTreeMap::new()),
            flushed: Mutex::new(BTreeMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Entries made durable by the last flush.
    pub fn flushed(&self) -> BTreeMap<String, Value> {
        self.flushed
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<(), StorageError> {
        if self.is_closed() {
            Err(StorageError::Closed(self.id.to_string()))
        } else {
            Ok(())
        }
    }
}

impl DataStorage for InMemoryStorage {
    fn id(&self) -> &DataStorageId {
        &self.id
    }

    fn write(&self, key: &str, value: Value) -> Result<(), StorageError> {
        self.ensure_open()?;
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(key.to_string(), value);
        Ok(())
    }

    fn flush(&self) -> Result<(), StorageError> {
        self.ensure_open()?;
        let entries = self
            .entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        *self
            .flushed
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = entries;
        Ok(())
    }

    fn close(&self) -> Result<(), StorageError> {
        self.flush()?;
        self.closed.store(true, Ordering::SeqCst);
        debug!(storage_id = %self.id, "Data storage closed");
        Ok(())
    }
}

/// Factory handing out [`InMemoryStorage`] handles and keeping them reachable.
#[derive(Default)]
pub struct InMemoryStorageFactory {
    created: AtomicUsize,
    storages: Mutex<Vec<Arc<InMemoryStorage>>>,
}

impl InMemoryStorageFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of handles created so far.
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    /// Every handle created so far.
    pub fn storages(&self) -> Vec<Arc<InMemoryStorage>> {
        self.storages
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

impl DataStorageFactory for InMemoryStorageFactory {
    fn create(&self, config: &TaskConfiguration) -> Result<Arc<dyn DataStorage>, StorageError> {
        let storage = Arc::new(InMemoryStorage::new(DataStorageId::generate()));
        self.created.fetch_add(1, Ordering::SeqCst);
        self.storages
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(storage.clone());
        debug!(
            configuration_id = %config.id,
            storage_id = %storage.id,
            "Data storage created"
        );
        Ok(storage)
    }
}
