//! Backend trait and JSON helpers.

use crate::error::StorageResult;
use serde::Serialize;
use serde::de::DeserializeOwned;

/// A namespaced key-value store.
///
/// Namespaces partition records by owner (`versions`, `offline_changes`, ...).
/// Implementations must be safe to share between tasks; calls are short and
/// synchronous.
pub trait KvBackend: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Reads a value.
    fn get(&self, namespace: &str, key: &str) -> StorageResult<Option<String>>;

    /// Inserts or replaces a value.
    fn put(&self, namespace: &str, key: &str, value: &str) -> StorageResult<()>;

    /// Removes a value. Returns whether it existed.
    fn delete(&self, namespace: &str, key: &str) -> StorageResult<bool>;

    /// Lists every `(key, value)` pair in a namespace, ordered by key.
    fn list(&self, namespace: &str) -> StorageResult<Vec<(String, String)>>;

    /// Removes every value in a namespace. Returns how many were removed.
    fn clear(&self, namespace: &str) -> StorageResult<usize>;
}

/// Serialises `value` as JSON and stores it.
pub fn put_json<T: Serialize + ?Sized>(
    backend: &dyn KvBackend,
    namespace: &str,
    key: &str,
    value: &T,
) -> StorageResult<()> {
    let json = serde_json::to_string(value)?;
    backend.put(namespace, key, &json)
}

/// Loads and deserialises a JSON value.
pub fn get_json<T: DeserializeOwned>(
    backend: &dyn KvBackend,
    namespace: &str,
    key: &str,
) -> StorageResult<Option<T>> {
    match backend.get(namespace, key)? {
        Some(json) => Ok(Some(serde_json::from_str(&json)?)),
        None => Ok(None),
    }
}

/// Loads and deserialises every value in a namespace.
pub fn list_json<T: DeserializeOwned>(
    backend: &dyn KvBackend,
    namespace: &str,
) -> StorageResult<Vec<(String, T)>> {
    backend
        .list(namespace)?
        .into_iter()
        .map(|(key, json)| Ok((key, serde_json::from_str(&json)?)))
        .collect()
}
