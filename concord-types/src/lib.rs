//! Core type definitions for Concord.
//!
//! This crate defines the small, dependency-light vocabulary shared by the
//! storage layer and the consistency engine:
//! - Identifiers for versions, conflicts, offline changes and integrity issues (UUID v7)
//! - Source identifiers and entity keys (`item_type`, `item_id`)
//! - Millisecond timestamps and an injectable [`Clock`]
//! - Canonical content checksums over JSON payloads
//!
//! Anything that knows about strategies, sources or scheduling lives in
//! `concord-sync`, not here.

mod checksum;
mod ids;
mod key;
mod timestamp;

pub use checksum::{checksum, checksum_opt};
pub use ids::{ChangeId, ConflictId, IssueId, SourceId, VersionId};
pub use key::ItemKey;
pub use timestamp::{Clock, ManualClock, SystemClock, Timestamp};

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in type operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid UUID: {0}")]
    InvalidUuid(#[from] uuid::Error),

    #[error("invalid item key: {0}")]
    InvalidKey(String),

    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(String),
}
