//! Offline change ledger.
//!
//! Changes made while a source is unreachable are recorded here, indexed by
//! entity key, item type and source, and written through to the backend
//! under `offline_changes`. A sync pass replays unsynced changes against
//! their source, detecting remote conflicts by checksum. Only one pass may
//! run at a time.

use crate::error::{SyncError, SyncResult};
use crate::merge::{MergeCandidate, MergeStrategy};
use crate::resolver::ResolutionStrategy;
use crate::source::SourceSet;
use crate::ticker::CancellationFlag;
use concord_storage::{KvBackend, list_json, put_json};
use concord_types::{ChangeId, Clock, ItemKey, SourceId, Timestamp, checksum};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Backend namespace for recorded changes.
pub const OFFLINE_CHANGES_NAMESPACE: &str = "offline_changes";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ChangeType {
    Create,
    Update,
    Delete,
}

/// A local mutation waiting to reach its source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfflineDataChange {
    pub change_id: ChangeId,
    pub data_type: String,
    pub data_key: String,
    pub change_type: ChangeType,
    /// The value the change was made against.
    pub previous_payload: Option<Value>,
    pub new_payload: Value,
    pub timestamp: Timestamp,
    pub source_id: SourceId,
    /// Per-key sequence number.
    pub version: u64,
    pub checksum: String,
    pub sync_failure_count: u32,
    pub is_synced: bool,
    pub synced_at: Option<Timestamp>,
    pub last_error: Option<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl OfflineDataChange {
    pub fn item_key(&self) -> SyncResult<ItemKey> {
        Ok(ItemKey::new(self.data_type.as_str(), self.data_key.as_str())?)
    }
}

/// Input to [`OfflineChangeLedger::record_data_change`].
#[derive(Debug, Clone, PartialEq)]
pub struct NewDataChange {
    pub data_type: String,
    pub data_key: String,
    pub payload: Value,
    pub source_id: SourceId,
    pub change_type: ChangeType,
    pub previous_payload: Option<Value>,
    pub metadata: Map<String, Value>,
}

impl NewDataChange {
    pub fn new(
        data_type: impl Into<String>,
        data_key: impl Into<String>,
        payload: Value,
        source_id: impl Into<SourceId>,
        change_type: ChangeType,
    ) -> Self {
        Self {
            data_type: data_type.into(),
            data_key: data_key.into(),
            payload,
            source_id: source_id.into(),
            change_type,
            previous_payload: None,
            metadata: Map::new(),
        }
    }

    #[must_use]
    pub fn with_previous(mut self, previous: Value) -> Self {
        self.previous_payload = Some(previous);
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeFailure {
    pub change_id: ChangeId,
    pub error: String,
}

/// Outcome of one replay pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfflineSyncResult {
    pub success: bool,
    pub processed: usize,
    pub synced: usize,
    pub failed: usize,
    pub conflicts_detected: usize,
    pub conflicts_resolved: usize,
    pub failures: Vec<ChangeFailure>,
    pub cancelled: bool,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub total_changes: usize,
    pub pending_changes_count: usize,
    pub synced_changes: usize,
    /// Unsynced changes with at least one failed attempt.
    pub failing_changes: usize,
    pub estimated_size_bytes: usize,
    pub by_type: BTreeMap<String, usize>,
    pub by_source: BTreeMap<SourceId, usize>,
    /// Unsynced changes per entity key (`type:key`).
    pub pending_by_key: BTreeMap<String, usize>,
    pub oldest_pending: Option<Timestamp>,
}

impl CacheStats {
    /// Unsynced changes for one entity key.
    pub fn pending_for(&self, key: &ItemKey) -> usize {
        self.pending_by_key.get(&key.to_string()).copied().unwrap_or(0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfflineSyncStatus {
    pub is_syncing: bool,
    pub pending_changes_count: usize,
    pub total: usize,
    pub processed: usize,
    pub progress: f64,
    pub estimated_remaining_ms: Option<u64>,
    pub last_sync_at: Option<Timestamp>,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupResult {
    pub removed: usize,
    pub remaining: usize,
}

#[derive(Default)]
struct LedgerState {
    changes: HashMap<ChangeId, OfflineDataChange>,
    by_key: HashMap<ItemKey, Vec<ChangeId>>,
    by_type: HashMap<String, Vec<ChangeId>>,
    by_source: HashMap<SourceId, Vec<ChangeId>>,
    key_versions: HashMap<ItemKey, u64>,
    last_sync_at: Option<Timestamp>,
    last_error: Option<String>,
}

impl LedgerState {
    fn index(&mut self, key: ItemKey, change: OfflineDataChange) {
        let id = change.change_id;
        let version = self.key_versions.entry(key.clone()).or_insert(0);
        *version = (*version).max(change.version);
        self.by_key.entry(key).or_default().push(id);
        self.by_type.entry(change.data_type.clone()).or_default().push(id);
        self.by_source.entry(change.source_id.clone()).or_default().push(id);
        self.changes.insert(id, change);
    }

    /// Drops removed ids from the secondary indices and empty buckets.
    fn compact(&mut self) {
        let live = &self.changes;
        self.by_key.retain(|_, ids| {
            ids.retain(|id| live.contains_key(id));
            !ids.is_empty()
        });
        self.by_type.retain(|_, ids| {
            ids.retain(|id| live.contains_key(id));
            !ids.is_empty()
        });
        self.by_source.retain(|_, ids| {
            ids.retain(|id| live.contains_key(id));
            !ids.is_empty()
        });
    }

    fn latest_for(&self, key: &ItemKey) -> Option<&OfflineDataChange> {
        self.by_key
            .get(key)?
            .iter()
            .filter_map(|id| self.changes.get(id))
            .max_by_key(|c| c.version)
    }
}

#[derive(Default)]
struct Progress {
    total: usize,
    processed: usize,
    started: Option<Instant>,
}

/// Resets the single-flight flag when a pass ends, however it ends.
struct SyncingGuard<'a>(&'a AtomicBool);

impl Drop for SyncingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// What replaying one change did.
enum Applied {
    Written,
    /// Nothing to write: the remote already matches.
    Skipped,
    /// The remote won; the change adopts its value.
    Adopted { payload: Value, checksum: String },
    Merged(Value),
    NeedsManual,
}

/// Records offline changes and replays them on reconnect.
pub struct OfflineChangeLedger {
    backend: Arc<dyn KvBackend>,
    sources: Arc<SourceSet>,
    clock: Arc<dyn Clock>,
    cancel: CancellationFlag,
    strategy: ResolutionStrategy,
    replay_delay: Duration,
    retention: Duration,
    state: RwLock<LedgerState>,
    syncing: AtomicBool,
    progress: Mutex<Progress>,
}

impl OfflineChangeLedger {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        backend: Arc<dyn KvBackend>,
        sources: Arc<SourceSet>,
        clock: Arc<dyn Clock>,
        cancel: CancellationFlag,
        strategy: ResolutionStrategy,
        replay_delay: Duration,
        retention: Duration,
    ) -> Self {
        Self {
            backend,
            sources,
            clock,
            cancel,
            strategy,
            replay_delay,
            retention,
            state: RwLock::new(LedgerState::default()),
            syncing: AtomicBool::new(false),
            progress: Mutex::new(Progress::default()),
        }
    }

    fn progress(&self) -> std::sync::MutexGuard<'_, Progress> {
        self.progress.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn persist(&self, change: &OfflineDataChange) -> SyncResult<()> {
        put_json(
            self.backend.as_ref(),
            OFFLINE_CHANGES_NAMESPACE,
            &change.change_id.to_string(),
            change,
        )?;
        Ok(())
    }

    /// Rebuilds the indices from the backend. Returns the number of changes.
    pub async fn load(&self) -> SyncResult<usize> {
        let stored: Vec<(String, OfflineDataChange)> =
            list_json(self.backend.as_ref(), OFFLINE_CHANGES_NAMESPACE)?;
        let mut state = LedgerState::default();
        for (_, change) in stored {
            match change.item_key() {
                Ok(key) => state.index(key, change),
                Err(e) => warn!("Skipping stored change {}: {}", change.change_id, e),
            }
        }
        let count = state.changes.len();
        *self.state.write().await = state;
        if count > 0 {
            info!("Loaded {} offline changes", count);
        }
        Ok(count)
    }

    /// Records a local change.
    ///
    /// Without an explicit previous payload, the change is taken to build on
    /// the last recorded change for the same key.
    pub async fn record_data_change(&self, new: NewDataChange) -> SyncResult<OfflineDataChange> {
        let key = ItemKey::new(new.data_type.as_str(), new.data_key.as_str())?;
        let mut state = self.state.write().await;
        let version = state.key_versions.get(&key).copied().unwrap_or(0) + 1;
        let previous_payload = new
            .previous_payload
            .or_else(|| state.latest_for(&key).map(|c| c.new_payload.clone()));

        let change = OfflineDataChange {
            change_id: ChangeId::new(),
            data_type: new.data_type,
            data_key: new.data_key,
            change_type: new.change_type,
            previous_payload,
            checksum: checksum(&new.payload),
            new_payload: new.payload,
            timestamp: self.clock.now(),
            source_id: new.source_id,
            version,
            sync_failure_count: 0,
            is_synced: false,
            synced_at: None,
            last_error: None,
            metadata: new.metadata,
        };
        self.persist(&change)?;
        state.index(key.clone(), change.clone());
        debug!("Recorded offline {:?} of {} (version {})", change.change_type, key, version);
        Ok(change)
    }

    /// Whether `local` differs from what the remote holds.
    ///
    /// `remote_checksum` is the checksum the remote reported; when absent it
    /// is computed from `remote`.
    pub fn detect_data_conflict(
        &self,
        key: &ItemKey,
        local: &Value,
        remote: &Value,
        remote_checksum: Option<&str>,
    ) -> bool {
        let remote_checksum = remote_checksum.map_or_else(|| checksum(remote), str::to_string);
        let conflict = checksum(local) != remote_checksum;
        if conflict {
            debug!("Offline conflict on {}", key);
        }
        conflict
    }

    /// Replays unsynced changes, optionally restricted to one source or to
    /// specific change ids.
    ///
    /// Fails fast with `AlreadyInProgress` if another pass is running.
    pub async fn sync_cached_changes(
        &self,
        source_id: Option<&SourceId>,
        change_ids: Option<&[ChangeId]>,
    ) -> SyncResult<OfflineSyncResult> {
        if self
            .syncing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(SyncError::AlreadyInProgress("offline sync"));
        }
        let _guard = SyncingGuard(&self.syncing);
        let started = Instant::now();

        let mut pending: Vec<OfflineDataChange> = {
            let state = self.state.read().await;
            state
                .changes
                .values()
                .filter(|c| !c.is_synced)
                .filter(|c| source_id.is_none_or(|s| &c.source_id == s))
                .filter(|c| change_ids.is_none_or(|ids| ids.contains(&c.change_id)))
                .cloned()
                .collect()
        };
        // Changes that failed least go first, then oldest.
        pending.sort_by_key(|c| (c.sync_failure_count, c.timestamp, c.version));

        *self.progress() = Progress {
            total: pending.len(),
            processed: 0,
            started: Some(started),
        };

        let mut result = OfflineSyncResult {
            success: true,
            processed: 0,
            synced: 0,
            failed: 0,
            conflicts_detected: 0,
            conflicts_resolved: 0,
            failures: Vec::new(),
            cancelled: false,
            duration_ms: 0,
        };

        for change in &pending {
            if self.cancel.is_cancelled() {
                result.cancelled = true;
                break;
            }
            if !self.replay_delay.is_zero() {
                tokio::time::sleep(self.replay_delay).await;
            }

            let replayed = self.replay(change).await;
            let now = self.clock.now();
            let mut state = self.state.write().await;
            let Some(stored) = state.changes.get_mut(&change.change_id) else {
                // Purged by cleanup mid-pass.
                continue;
            };
            let error = match replayed {
                Ok((conflict, applied)) => {
                    if conflict {
                        result.conflicts_detected += 1;
                    }
                    let error = match applied {
                        Applied::NeedsManual => {
                            Some("remote conflict needs manual resolution".to_string())
                        }
                        Applied::Adopted { payload, checksum } => {
                            stored.new_payload = payload;
                            stored.checksum = checksum;
                            None
                        }
                        Applied::Merged(payload) => {
                            stored.checksum = checksum(&payload);
                            stored.new_payload = payload;
                            None
                        }
                        Applied::Written | Applied::Skipped => None,
                    };
                    if conflict && error.is_none() {
                        result.conflicts_resolved += 1;
                    }
                    error
                }
                Err(e) => Some(e.to_string()),
            };

            match error {
                None => {
                    stored.is_synced = true;
                    stored.synced_at = Some(now);
                    stored.last_error = None;
                    result.synced += 1;
                }
                Some(message) => {
                    warn!("Replay of change {} failed: {}", change.change_id, message);
                    stored.sync_failure_count += 1;
                    stored.last_error = Some(message.clone());
                    result.failed += 1;
                    result.failures.push(ChangeFailure {
                        change_id: change.change_id,
                        error: message.clone(),
                    });
                    state.last_error = Some(message);
                }
            }
            if let Some(stored) = state.changes.get(&change.change_id) {
                self.persist(stored)?;
            }
            drop(state);

            result.processed += 1;
            self.progress().processed = result.processed;
        }

        result.success = result.failed == 0 && !result.cancelled;
        result.duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.state.write().await.last_sync_at = Some(self.clock.now());
        self.progress().started = None;

        info!(
            "Offline sync: {} synced, {} failed, {} conflicts ({} resolved)",
            result.synced, result.failed, result.conflicts_detected, result.conflicts_resolved
        );
        Ok(result)
    }

    /// Replays one change against its source. Returns whether the remote
    /// conflicted, and what was done.
    async fn replay(&self, change: &OfflineDataChange) -> SyncResult<(bool, Applied)> {
        let source = self
            .sources
            .get(&change.source_id)
            .ok_or_else(|| SyncError::NotFound(format!("source {}", change.source_id)))?;
        let key = change.item_key()?;
        let remote = source.read(&key).await?;

        let Some(remote) = remote else {
            if change.change_type == ChangeType::Delete {
                return Ok((false, Applied::Skipped));
            }
            source.write(&key, change.new_payload.clone()).await?;
            return Ok((false, Applied::Written));
        };
        if change.change_type != ChangeType::Delete && remote.checksum == change.checksum {
            return Ok((false, Applied::Skipped));
        }

        let conflict = match &change.previous_payload {
            Some(base) => {
                self.detect_data_conflict(&key, base, &remote.payload, Some(&remote.checksum))
            }
            // A create against an existing remote value.
            None => true,
        };

        let mut payload = change.new_payload.clone();
        let mut merged = false;
        if conflict {
            let local_newer = change.timestamp >= remote.updated_at;
            let adopt = Applied::Adopted {
                payload: remote.payload.clone(),
                checksum: remote.checksum.clone(),
            };
            match self.strategy {
                ResolutionStrategy::LatestWins | ResolutionStrategy::Auto => {
                    if !local_newer {
                        return Ok((true, adopt));
                    }
                }
                ResolutionStrategy::EarliestWins => {
                    if change.timestamp > remote.updated_at {
                        return Ok((true, adopt));
                    }
                }
                ResolutionStrategy::Merge => {
                    if change.change_type != ChangeType::Delete {
                        let origin = change.source_id.as_str();
                        let candidates = [
                            MergeCandidate {
                                origin,
                                timestamp: remote.updated_at,
                                value: &remote.payload,
                            },
                            MergeCandidate {
                                origin: "offline",
                                timestamp: change.timestamp,
                                value: &change.new_payload,
                            },
                        ];
                        payload = MergeStrategy::MergeAll.merger().merge(&candidates).value;
                        merged = true;
                    }
                }
                ResolutionStrategy::Manual | ResolutionStrategy::UserChoice => {
                    return Ok((true, Applied::NeedsManual));
                }
            }
        }

        if change.change_type == ChangeType::Delete {
            source.delete(&key).await?;
        } else {
            source.write(&key, payload.clone()).await?;
        }
        Ok((conflict, if merged { Applied::Merged(payload) } else { Applied::Written }))
    }

    /// Purges changes older than `older_than` (the configured retention by
    /// default), synced or not.
    pub async fn cleanup_expired_cache(
        &self,
        older_than: Option<Duration>,
    ) -> SyncResult<CleanupResult> {
        let cutoff = self.clock.now().saturating_sub(older_than.unwrap_or(self.retention));
        let mut state = self.state.write().await;
        let expired: Vec<ChangeId> = state
            .changes
            .values()
            .filter(|c| c.timestamp < cutoff)
            .map(|c| c.change_id)
            .collect();
        for id in &expired {
            self.backend
                .delete(OFFLINE_CHANGES_NAMESPACE, &id.to_string())?;
            state.changes.remove(id);
        }
        state.compact();
        let remaining = state.changes.len();
        if !expired.is_empty() {
            info!("Purged {} expired offline changes", expired.len());
        }
        Ok(CleanupResult {
            removed: expired.len(),
            remaining,
        })
    }

    /// Counts, size estimate and per-key pending counts.
    pub async fn cache_stats(&self) -> CacheStats {
        let state = self.state.read().await;
        let mut stats = CacheStats {
            total_changes: state.changes.len(),
            pending_changes_count: 0,
            synced_changes: 0,
            failing_changes: 0,
            estimated_size_bytes: 0,
            by_type: BTreeMap::new(),
            by_source: BTreeMap::new(),
            pending_by_key: BTreeMap::new(),
            oldest_pending: None,
        };
        for (data_type, ids) in &state.by_type {
            stats.by_type.insert(data_type.clone(), ids.len());
        }
        for (source_id, ids) in &state.by_source {
            stats.by_source.insert(source_id.clone(), ids.len());
        }
        for (key, ids) in &state.by_key {
            let pending = ids
                .iter()
                .filter_map(|id| state.changes.get(id))
                .filter(|c| !c.is_synced)
                .count();
            if pending > 0 {
                stats.pending_by_key.insert(key.to_string(), pending);
            }
        }
        for change in state.changes.values() {
            stats.estimated_size_bytes += change.new_payload.to_string().len()
                + change
                    .previous_payload
                    .as_ref()
                    .map_or(0, |p| p.to_string().len());
            if change.is_synced {
                stats.synced_changes += 1;
            } else {
                stats.pending_changes_count += 1;
                if change.sync_failure_count > 0 {
                    stats.failing_changes += 1;
                }
                if stats.oldest_pending.is_none_or(|t| change.timestamp < t) {
                    stats.oldest_pending = Some(change.timestamp);
                }
            }
        }
        stats
    }

    /// Progress of the running pass, or the idle state.
    pub async fn offline_sync_status(&self) -> OfflineSyncStatus {
        let (pending, last_sync_at, last_error) = {
            let state = self.state.read().await;
            (
                state.changes.values().filter(|c| !c.is_synced).count(),
                state.last_sync_at,
                state.last_error.clone(),
            )
        };
        let is_syncing = self.syncing.load(Ordering::SeqCst);
        let progress = self.progress();
        let fraction = if progress.total == 0 {
            if is_syncing { 0.0 } else { 1.0 }
        } else {
            progress.processed as f64 / progress.total as f64
        };
        let estimated_remaining_ms = match progress.started {
            Some(started) if is_syncing && fraction > 0.0 => {
                let elapsed = started.elapsed().as_millis() as f64;
                Some((elapsed / fraction * (1.0 - fraction)) as u64)
            }
            _ => None,
        };
        OfflineSyncStatus {
            is_syncing,
            pending_changes_count: pending,
            total: progress.total,
            processed: progress.processed,
            progress: fraction,
            estimated_remaining_ms,
            last_sync_at,
            last_error,
        }
    }

    /// One change by id.
    pub async fn get_change(&self, change_id: ChangeId) -> Option<OfflineDataChange> {
        self.state.read().await.changes.get(&change_id).cloned()
    }

    /// Changes for one entity key, oldest first.
    pub async fn changes_for(&self, key: &ItemKey) -> Vec<OfflineDataChange> {
        let state = self.state.read().await;
        let mut out: Vec<OfflineDataChange> = state
            .by_key
            .get(key)
            .into_iter()
            .flatten()
            .filter_map(|id| state.changes.get(id).cloned())
            .collect();
        out.sort_by_key(|c| c.version);
        out
    }

    /// Unsynced changes recorded against one source.
    pub async fn pending_for_source(&self, source_id: &SourceId) -> usize {
        let state = self.state.read().await;
        state
            .by_source
            .get(source_id)
            .into_iter()
            .flatten()
            .filter_map(|id| state.changes.get(id))
            .filter(|c| !c.is_synced)
            .count()
    }

    /// Whether a pass is running.
    pub fn is_syncing(&self) -> bool {
        self.syncing.load(Ordering::SeqCst)
    }

    /// Drops the in-memory indices; persisted changes stay in the backend.
    pub async fn clear(&self) {
        *self.state.write().await = LedgerState::default();
        *self.progress() = Progress::default();
    }
}
