//! Sync state tracking.
//!
//! Each source carries a [`SyncStatus`]. The aggregate status is derived on
//! demand from the per-source ones and never stored.

use concord_types::{SourceId, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Lifecycle of a source's reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SyncState {
    #[default]
    Stopped,
    Running,
    Paused,
    Completed,
    Error,
}

/// Sync status of one source, or of the whole engine.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub state: SyncState,
    pub last_sync_time: Option<Timestamp>,
    pub pending_changes_count: usize,
    /// Fraction of the current cycle done, in `[0, 1]`.
    pub progress: f64,
    pub error: Option<String>,
}

impl SyncStatus {
    /// Derives an aggregate from per-source statuses.
    ///
    /// `error` dominates, then `running`. `paused` only when every source is
    /// paused, then `completed` if any source completed, else `stopped`.
    pub fn aggregate<'a>(statuses: impl IntoIterator<Item = &'a SyncStatus>) -> SyncStatus {
        let statuses: Vec<&SyncStatus> = statuses.into_iter().collect();
        let any = |state: SyncState| statuses.iter().any(|s| s.state == state);

        let state = if any(SyncState::Error) {
            SyncState::Error
        } else if any(SyncState::Running) {
            SyncState::Running
        } else if !statuses.is_empty() && statuses.iter().all(|s| s.state == SyncState::Paused) {
            SyncState::Paused
        } else if any(SyncState::Completed) {
            SyncState::Completed
        } else {
            SyncState::Stopped
        };

        let progress = if statuses.is_empty() {
            0.0
        } else {
            statuses.iter().map(|s| s.progress).sum::<f64>() / statuses.len() as f64
        };

        SyncStatus {
            state,
            last_sync_time: statuses.iter().filter_map(|s| s.last_sync_time).max(),
            pending_changes_count: statuses.iter().map(|s| s.pending_changes_count).sum(),
            progress,
            error: statuses.iter().find_map(|s| s.error.clone()),
        }
    }
}

/// Aggregate plus per-source detail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatusReport {
    pub aggregate: SyncStatus,
    pub sources: BTreeMap<SourceId, SyncStatus>,
    pub globally_paused: bool,
}
