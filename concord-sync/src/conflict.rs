//! Conflict records, the active conflict set and resolution history.

use crate::detector::DetectionStrategy;
use crate::error::{SyncError, SyncResult};
use crate::resolver::ResolutionStrategy;
use concord_types::{ConflictId, ItemKey, SourceId, Timestamp, VersionId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// One source's value for a conflicted entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompetingValue {
    pub source_id: SourceId,
    pub payload: Value,
    pub timestamp: Timestamp,
    pub version: u64,
    pub checksum: String,
}

/// What kind of disagreement was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConflictType {
    TimestampDivergence,
    VersionDivergence,
    ContentMismatch,
    RuleViolation,
}

/// How urgent a conflict is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConflictSeverity {
    Low,
    Medium,
    High,
    Critical,
}

/// A detected disagreement between sources for one entity key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataConflict {
    pub conflict_id: ConflictId,
    pub item: ItemKey,
    pub competing_values: Vec<CompetingValue>,
    pub detection_strategy: DetectionStrategy,
    pub conflict_type: ConflictType,
    pub severity: ConflictSeverity,
    /// Rule that fired, for rule-based detection.
    pub rule_id: Option<String>,
    pub description: String,
    pub detected_at: Timestamp,
}

/// Lifecycle of a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConflictState {
    Detected,
    Resolving,
    Resolved,
    Failed,
    PendingManual,
}

/// A step taken while resolving.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum ResolutionAction {
    SelectedValue { source_id: Option<SourceId> },
    MergedValues { count: usize },
    WroteSource { source_id: SourceId },
    WriteFailed { source_id: SourceId, error: String },
    CreatedVersion { version_id: VersionId, version_number: u64 },
    RemovedFromActiveSet,
    AwaitingManualInput,
}

/// Outcome of one resolution attempt. Always produced, even on failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictResolutionResult {
    pub conflict_id: ConflictId,
    pub item: Option<ItemKey>,
    pub success: bool,
    pub strategy_used: ResolutionStrategy,
    pub state: ConflictState,
    pub resolved_value: Option<Value>,
    pub actions: Vec<ResolutionAction>,
    pub resolved_at: Timestamp,
    pub duration_ms: u64,
    pub error: Option<String>,
}

/// A conflict in the active set with its lifecycle state.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackedConflict {
    pub conflict: DataConflict,
    pub state: ConflictState,
    pub attempts: u32,
}

/// Active conflict set plus append-only resolution history.
///
/// The detector inserts, the resolver drives state transitions. Only
/// successful resolutions remove an entry.
pub struct ConflictRegistry {
    max_active: usize,
    active: Mutex<HashMap<ConflictId, TrackedConflict>>,
    history: RwLock<Vec<ConflictResolutionResult>>,
}

/// Holds a conflict in `Resolving` for the length of one attempt.
///
/// Dropping the guard without [`finish`](Self::finish), for instance when
/// the resolving future is cancelled, returns the conflict to the state it
/// had before the attempt.
pub struct ResolvingGuard<'a> {
    registry: &'a ConflictRegistry,
    conflict: DataConflict,
    previous: ConflictState,
    armed: bool,
}

impl ResolvingGuard<'_> {
    pub fn conflict(&self) -> &DataConflict {
        &self.conflict
    }

    /// Applies the outcome of the attempt and appends it to history.
    pub async fn finish(mut self, result: ConflictResolutionResult) {
        self.armed = false;
        self.registry.finish(result).await;
    }
}

impl Drop for ResolvingGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let id = self.conflict.conflict_id;
        let mut active = self.registry.lock_active();
        if let Some(tracked) = active.get_mut(&id) {
            if tracked.state == ConflictState::Resolving {
                tracked.state = self.previous;
                debug!("Resolution of {} abandoned, back to {:?}", id, self.previous);
            }
        }
    }
}

impl ConflictRegistry {
    /// Creates a registry tracking at most `max_active` unresolved conflicts.
    pub fn new(max_active: usize) -> Self {
        Self {
            max_active: max_active.max(1),
            active: Mutex::new(HashMap::new()),
            history: RwLock::new(Vec::new()),
        }
    }

    fn lock_active(&self) -> MutexGuard<'_, HashMap<ConflictId, TrackedConflict>> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Adds a newly detected conflict, evicting the oldest when full.
    pub async fn insert(&self, conflict: DataConflict) {
        let mut active = self.lock_active();
        if active.len() >= self.max_active {
            let oldest = active
                .values()
                .filter(|t| t.state != ConflictState::Resolving)
                .min_by_key(|t| t.conflict.detected_at)
                .map(|t| t.conflict.conflict_id);
            if let Some(id) = oldest {
                warn!("Active conflict set full, evicting {}", id);
                active.remove(&id);
            }
        }
        debug!("Tracking conflict {} for {}", conflict.conflict_id, conflict.item);
        active.insert(
            conflict.conflict_id,
            TrackedConflict {
                conflict,
                state: ConflictState::Detected,
                attempts: 0,
            },
        );
    }

    /// An unresolved conflict already tracked for `key`, if any.
    pub async fn find_for_item(&self, key: &ItemKey) -> Option<DataConflict> {
        self.tracked_for_item(key).await.map(|t| t.conflict)
    }

    /// Same as [`find_for_item`](Self::find_for_item) with the lifecycle
    /// state.
    pub async fn tracked_for_item(&self, key: &ItemKey) -> Option<TrackedConflict> {
        self.lock_active()
            .values()
            .find(|t| &t.conflict.item == key)
            .cloned()
    }

    /// Moves a conflict into `Resolving`.
    pub async fn begin_resolving(&self, id: ConflictId) -> SyncResult<ResolvingGuard<'_>> {
        let mut active = self.lock_active();
        let tracked = active
            .get_mut(&id)
            .ok_or_else(|| SyncError::NotFound(format!("conflict {id}")))?;
        if tracked.state == ConflictState::Resolving {
            return Err(SyncError::AlreadyInProgress("conflict resolution"));
        }
        let previous = tracked.state;
        tracked.state = ConflictState::Resolving;
        tracked.attempts += 1;
        Ok(ResolvingGuard {
            registry: self,
            conflict: tracked.conflict.clone(),
            previous,
            armed: true,
        })
    }

    async fn finish(&self, result: ConflictResolutionResult) {
        {
            let mut active = self.lock_active();
            if result.success {
                active.remove(&result.conflict_id);
            } else if let Some(tracked) = active.get_mut(&result.conflict_id) {
                tracked.state = result.state;
            }
        }
        self.history.write().await.push(result);
    }

    /// Appends an attempt that never reached the active set.
    pub async fn record_attempt(&self, result: ConflictResolutionResult) {
        self.history.write().await.push(result);
    }

    /// Unresolved conflicts, oldest first.
    pub async fn active(&self) -> Vec<DataConflict> {
        let mut out: Vec<DataConflict> = self
            .lock_active()
            .values()
            .map(|t| t.conflict.clone())
            .collect();
        out.sort_by_key(|c| c.detected_at);
        out
    }

    /// A tracked conflict with its state.
    pub async fn get(&self, id: ConflictId) -> Option<TrackedConflict> {
        self.lock_active().get(&id).cloned()
    }

    /// Whether the conflict is still unresolved.
    pub async fn is_active(&self, id: ConflictId) -> bool {
        self.lock_active().contains_key(&id)
    }

    /// Number of unresolved conflicts.
    pub async fn active_count(&self) -> usize {
        self.lock_active().len()
    }

    /// Full resolution history, oldest first.
    pub async fn history(&self) -> Vec<ConflictResolutionResult> {
        self.history.read().await.clone()
    }

    /// Resolution attempts for one conflict.
    pub async fn history_for(&self, id: ConflictId) -> Vec<ConflictResolutionResult> {
        self.history
            .read()
            .await
            .iter()
            .filter(|r| r.conflict_id == id)
            .cloned()
            .collect()
    }
}
