//! In-memory backend.

use crate::backend::KvBackend;
use crate::error::{StorageError, StorageResult};
use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

/// Backend that keeps everything in process memory.
///
/// It stands in for durable storage: contents live as long as the backend
/// value, across any number of engine restarts that share it.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    namespaces: RwLock<HashMap<String, BTreeMap<String, String>>>,
}

impl MemoryBackend {
    /// Creates an empty backend.
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn get(&self, namespace: &str, key: &str) -> StorageResult<Option<String>> {
        let namespaces = self.namespaces.read().map_err(|_| StorageError::LockPoisoned)?;
        Ok(namespaces.get(namespace).and_then(|ns| ns.get(key)).cloned())
    }

    fn put(&self, namespace: &str, key: &str, value: &str) -> StorageResult<()> {
        let mut namespaces = self.namespaces.write().map_err(|_| StorageError::LockPoisoned)?;
        namespaces
            .entry(namespace.to_string())
            .or_default()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn delete(&self, namespace: &str, key: &str) -> StorageResult<bool> {
        let mut namespaces = self.namespaces.write().map_err(|_| StorageError::LockPoisoned)?;
        Ok(namespaces
            .get_mut(namespace)
            .is_some_and(|ns| ns.remove(key).is_some()))
    }

    fn list(&self, namespace: &str) -> StorageResult<Vec<(String, String)>> {
        let namespaces = self.namespaces.read().map_err(|_| StorageError::LockPoisoned)?;
        Ok(namespaces
            .get(namespace)
            .map(|ns| ns.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default())
    }

    fn clear(&self, namespace: &str) -> StorageResult<usize> {
        let mut namespaces = self.namespaces.write().map_err(|_| StorageError::LockPoisoned)?;
        Ok(namespaces.remove(namespace).map_or(0, |ns| ns.len()))
    }
}
