//! Error types for the consistency engine.

use concord_storage::StorageError;
use thiserror::Error;

/// Result type for engine operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur in engine operations.
#[derive(Debug, Error)]
pub enum SyncError {
    /// An operation was called before `initialize` (or after `dispose`).
    #[error("engine not initialized")]
    NotInitialized,

    /// A referenced version, conflict, change or item does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Unsupported strategy, malformed key or rule, bad configuration.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A single-flight operation is already running.
    #[error("{0} already in progress")]
    AlreadyInProgress(&'static str),

    /// Some entries of a batch failed.
    #[error("{failed} of {total} items failed")]
    PartialFailure { failed: usize, total: usize },

    /// A source collaborator failed to read or write.
    #[error("source {source_id} unavailable: {message}")]
    TransientSource { source_id: String, message: String },

    /// Persistence backend error.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// An event channel was closed.
    #[error("channel closed")]
    ChannelClosed,

    /// The operation observed the cancellation flag and stopped early.
    #[error("operation cancelled")]
    Cancelled,
}

impl SyncError {
    /// Builds a [`SyncError::TransientSource`].
    pub fn transient(source_id: impl ToString, message: impl Into<String>) -> Self {
        Self::TransientSource {
            source_id: source_id.to_string(),
            message: message.into(),
        }
    }

    /// Whether retrying the same call later could succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::TransientSource { .. } | Self::AlreadyInProgress(_) | Self::Storage(_)
        )
    }
}

impl From<concord_types::Error> for SyncError {
    fn from(e: concord_types::Error) -> Self {
        Self::InvalidArgument(e.to_string())
    }
}
