//! Key-value persistence for Concord.
//!
//! The engine never cares where versions and offline changes end up. It talks
//! to a [`KvBackend`], a namespaced string store, and serialises its records
//! as JSON through the helpers in this crate.
//!
//! # Backends
//!
//! - [`MemoryBackend`]: process-local maps, the default
//! - [`SqliteBackend`]: a single `kv` table in a SQLite file (or in memory)

mod backend;
mod error;
mod memory;
mod sqlite;

pub use backend::{KvBackend, get_json, list_json, put_json};
pub use error::{StorageError, StorageResult};
pub use memory::MemoryBackend;
pub use sqlite::SqliteBackend;
