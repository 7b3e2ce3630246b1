//! Reconciliation cycles across registered sources.
//!
//! A cycle picks its participating sources and keys by [`SyncScope`], then
//! per key: pulls agreed source values into the version store (resolving
//! disagreements through the detector and resolver) and pushes the current
//! version to sources that differ, as selected by [`SyncDirection`]. Writes
//! only happen where checksums differ, so repeating a cycle is a no-op.
//!
//! A key is never pushed while it has an unresolved conflict or while the
//! sources holding it disagree; sources missing the key still receive it.

use crate::conflict::{ConflictRegistry, ConflictState};
use crate::detector::{ConflictDetector, DetectionStrategy};
use crate::error::{SyncError, SyncResult};
use crate::events::EventBus;
use crate::ledger::OfflineChangeLedger;
use crate::metrics::MetricsAggregator;
use crate::resolver::{ConflictResolver, ResolutionStrategy};
use crate::source::{DataSource, RouteOp, SourceRecord, SourceSet, read_all};
use crate::state::{SyncState, SyncStatus, SyncStatusReport};
use crate::ticker::CancellationFlag;
use crate::version::{VersionMetadata, VersionStore, VersionType};
use concord_types::{Clock, ConflictId, ItemKey, SourceId, Timestamp, checksum};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

/// Which sources and items take part in a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SyncScope {
    /// Every item of every participating source.
    All,
    /// Explicitly named sources; without names, the sources that need
    /// attention (never synced, failed, or holding offline changes).
    Selective,
    /// Items changed since the last sync time.
    Incremental,
}

/// Which way values flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SyncDirection {
    /// Current versions out to sources.
    Push,
    /// Source values into the version store.
    Pull,
    Bidirectional,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum SyncChangeKind {
    VersionRecorded { version_number: u64 },
    ConflictResolved { conflict_id: ConflictId },
    Pushed { source_id: SourceId },
}

/// One effect of a cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncChange {
    pub key: ItemKey,
    #[serde(flatten)]
    pub kind: SyncChangeKind,
}

/// Outcome of one cycle; also the payload of the sync-completed channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncCycleResult {
    pub started_at: Timestamp,
    pub completed_at: Timestamp,
    pub scope: SyncScope,
    pub direction: SyncDirection,
    pub sources: Vec<SourceId>,
    pub keys_examined: usize,
    pub changes: Vec<SyncChange>,
    pub conflicts_detected: usize,
    pub conflicts_resolved: usize,
    pub errors: Vec<String>,
    pub success: bool,
    /// Nothing ran: paused, or no eligible source.
    pub skipped: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForceSyncResult {
    pub success: bool,
    pub cycle: Option<SyncCycleResult>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default)]
struct SourceEntry {
    status: SyncStatus,
    paused: bool,
}

/// Collaborators a scheduler drives.
pub struct SchedulerParts {
    pub sources: Arc<SourceSet>,
    pub versions: Arc<VersionStore>,
    pub registry: Arc<ConflictRegistry>,
    pub detector: Arc<ConflictDetector>,
    pub resolver: Arc<ConflictResolver>,
    pub ledger: Arc<OfflineChangeLedger>,
    pub metrics: Arc<MetricsAggregator>,
    pub events: Arc<EventBus>,
    pub clock: Arc<dyn Clock>,
    pub cancel: CancellationFlag,
}

/// Settings a scheduler runs with.
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub detection: DetectionStrategy,
    pub resolution: ResolutionStrategy,
    pub incremental_window: Duration,
    pub created_by: String,
}

/// Drives reconciliation cycles and tracks per-source status.
pub struct SyncScheduler {
    parts: SchedulerParts,
    settings: SchedulerSettings,
    entries: RwLock<HashMap<SourceId, SourceEntry>>,
    globally_paused: AtomicBool,
    cycle_lock: Mutex<()>,
    last_cycle: RwLock<Option<Timestamp>>,
}

/// Per-cycle scratch state.
struct Cycle {
    result: SyncCycleResult,
    source_errors: HashMap<SourceId, String>,
}

impl SyncScheduler {
    pub fn new(parts: SchedulerParts, settings: SchedulerSettings) -> Self {
        Self {
            parts,
            settings,
            entries: RwLock::new(HashMap::new()),
            globally_paused: AtomicBool::new(false),
            cycle_lock: Mutex::new(()),
            last_cycle: RwLock::new(None),
        }
    }

    /// Runs a cycle over unpaused sources.
    ///
    /// For the incremental scope, items changed at or after `last_sync_time`
    /// are examined; without one, the configured look-back window is used.
    pub async fn perform_incremental_sync(
        &self,
        scope: SyncScope,
        direction: SyncDirection,
        last_sync_time: Option<Timestamp>,
    ) -> SyncResult<SyncCycleResult> {
        let since = (scope == SyncScope::Incremental).then(|| {
            last_sync_time.unwrap_or_else(|| {
                self.parts
                    .clock
                    .now()
                    .saturating_sub(self.settings.incremental_window)
            })
        });
        self.run_cycle(None, scope, direction, since, true).await
    }

    /// Timer entry point: incremental, bidirectional, from the last cycle.
    pub async fn run_scheduled(&self) -> SyncResult<SyncCycleResult> {
        let last = *self.last_cycle.read().await;
        self.perform_incremental_sync(SyncScope::Incremental, SyncDirection::Bidirectional, last)
            .await
    }

    /// Runs a bidirectional cycle now, ignoring pauses.
    ///
    /// Always returns a result; unknown source ids or a failed cycle come
    /// back as `success = false`.
    pub async fn force_sync(
        &self,
        source_ids: Option<&[SourceId]>,
        scope: SyncScope,
    ) -> SyncResult<ForceSyncResult> {
        if let Some(ids) = source_ids {
            if let Some(unknown) = ids.iter().find(|id| self.parts.sources.get(id).is_none()) {
                return Ok(ForceSyncResult {
                    success: false,
                    cycle: None,
                    error: Some(format!("unknown source {unknown}")),
                });
            }
        }
        let since = match scope {
            SyncScope::Incremental => Some(self.last_cycle.read().await.unwrap_or_else(|| {
                self.parts
                    .clock
                    .now()
                    .saturating_sub(self.settings.incremental_window)
            })),
            _ => None,
        };
        match self
            .run_cycle(source_ids, scope, SyncDirection::Bidirectional, since, false)
            .await
        {
            Ok(cycle) => Ok(ForceSyncResult {
                success: cycle.success,
                error: cycle.errors.first().cloned(),
                cycle: Some(cycle),
            }),
            Err(e) => Ok(ForceSyncResult {
                success: false,
                cycle: None,
                error: Some(e.to_string()),
            }),
        }
    }

    /// Pauses one source, or every source for `None`.
    pub async fn pause_sync(&self, source_id: Option<&SourceId>) -> SyncResult<()> {
        match source_id {
            None => self.globally_paused.store(true, Ordering::SeqCst),
            Some(id) => {
                self.ensure_known(id)?;
                self.entries.write().await.entry(id.clone()).or_default().paused = true;
            }
        }
        info!(
            "Paused sync for {}",
            source_id.map_or("all sources".to_string(), ToString::to_string)
        );
        Ok(())
    }

    /// Resumes one source, or lifts the global pause for `None`.
    pub async fn resume_sync(&self, source_id: Option<&SourceId>) -> SyncResult<()> {
        match source_id {
            None => self.globally_paused.store(false, Ordering::SeqCst),
            Some(id) => {
                self.ensure_known(id)?;
                if let Some(entry) = self.entries.write().await.get_mut(id) {
                    entry.paused = false;
                }
            }
        }
        info!(
            "Resumed sync for {}",
            source_id.map_or("all sources".to_string(), ToString::to_string)
        );
        Ok(())
    }

    fn ensure_known(&self, id: &SourceId) -> SyncResult<()> {
        self.parts
            .sources
            .get(id)
            .map(|_| ())
            .ok_or_else(|| SyncError::NotFound(format!("source {id}")))
    }

    /// Per-source statuses plus the derived aggregate.
    pub async fn sync_status(&self) -> SyncStatusReport {
        let globally_paused = self.globally_paused.load(Ordering::SeqCst);
        let entries = self.entries.read().await.clone();
        let mut sources = BTreeMap::new();
        for source in self.parts.sources.all() {
            let entry = entries.get(source.id()).cloned().unwrap_or_default();
            let mut status = entry.status;
            if (entry.paused || globally_paused) && status.state != SyncState::Running {
                status.state = SyncState::Paused;
            }
            status.pending_changes_count = self.parts.ledger.pending_for_source(source.id()).await;
            sources.insert(source.id().clone(), status);
        }
        SyncStatusReport {
            aggregate: SyncStatus::aggregate(sources.values()),
            sources,
            globally_paused,
        }
    }

    /// Forgets statuses and pauses.
    pub async fn reset(&self) {
        self.entries.write().await.clear();
        self.globally_paused.store(false, Ordering::SeqCst);
        *self.last_cycle.write().await = None;
    }

    async fn participants(
        &self,
        filter: Option<&[SourceId]>,
        scope: SyncScope,
        honor_pause: bool,
    ) -> Vec<Arc<dyn DataSource>> {
        let entries = self.entries.read().await.clone();
        let mut selected = Vec::new();
        for source in self.parts.sources.route_among(RouteOp::Read, None, filter) {
            let entry = entries.get(source.id());
            if honor_pause && entry.is_some_and(|e| e.paused) {
                continue;
            }
            if scope == SyncScope::Selective && filter.is_none() {
                let settled = entry.is_some_and(|e| e.status.state == SyncState::Completed);
                let pending = self.parts.ledger.pending_for_source(source.id()).await;
                if settled && pending == 0 {
                    continue;
                }
            }
            selected.push(source);
        }
        selected
    }

    async fn set_states(&self, ids: &[SourceId], state: SyncState, progress: f64) {
        let mut entries = self.entries.write().await;
        for id in ids {
            let entry = entries.entry(id.clone()).or_default();
            entry.status.state = state;
            entry.status.progress = progress;
        }
    }

    async fn run_cycle(
        &self,
        filter: Option<&[SourceId]>,
        scope: SyncScope,
        direction: SyncDirection,
        since: Option<Timestamp>,
        honor_pause: bool,
    ) -> SyncResult<SyncCycleResult> {
        let _cycle_guard = self.cycle_lock.lock().await;
        let started_at = self.parts.clock.now();
        let mut cycle = Cycle {
            result: SyncCycleResult {
                started_at,
                completed_at: started_at,
                scope,
                direction,
                sources: Vec::new(),
                keys_examined: 0,
                changes: Vec::new(),
                conflicts_detected: 0,
                conflicts_resolved: 0,
                errors: Vec::new(),
                success: true,
                skipped: false,
            },
            source_errors: HashMap::new(),
        };

        let paused = honor_pause && self.globally_paused.load(Ordering::SeqCst);
        let participants = if paused {
            Vec::new()
        } else {
            self.participants(filter, scope, honor_pause).await
        };
        if participants.is_empty() {
            debug!("Sync cycle skipped ({})", if paused { "paused" } else { "no sources" });
            cycle.result.skipped = true;
            self.parts.events.publish_sync_completed(&cycle.result);
            return Ok(cycle.result);
        }

        let ids: Vec<SourceId> = participants.iter().map(|s| s.id().clone()).collect();
        cycle.result.sources = ids.clone();
        self.set_states(&ids, SyncState::Running, 0.0).await;

        let keys = self.collect_keys(&participants, since, &mut cycle).await?;
        cycle.result.keys_examined = keys.len();
        for (done, key) in keys.iter().enumerate() {
            if self.parts.cancel.is_cancelled() {
                cycle.result.errors.push("cycle cancelled".to_string());
                break;
            }
            if let Err(e) = self.reconcile_key(key, &participants, direction, &mut cycle).await {
                warn!("Reconciling {} failed: {}", key, e);
                cycle.result.errors.push(format!("{key}: {e}"));
            }
            let progress = (done + 1) as f64 / keys.len() as f64;
            self.set_states(&ids, SyncState::Running, progress).await;
        }

        let completed_at = self.parts.clock.now();
        {
            let mut entries = self.entries.write().await;
            for id in &ids {
                let entry = entries.entry(id.clone()).or_default();
                match cycle.source_errors.get(id) {
                    Some(message) => {
                        entry.status.state = SyncState::Error;
                        entry.status.error = Some(message.clone());
                    }
                    None => {
                        entry.status.state = SyncState::Completed;
                        entry.status.error = None;
                        entry.status.last_sync_time = Some(started_at);
                        entry.status.progress = 1.0;
                    }
                }
            }
        }
        *self.last_cycle.write().await = Some(started_at);

        for (id, message) in &cycle.source_errors {
            cycle.result.errors.push(format!("{id}: {message}"));
        }
        cycle.result.completed_at = completed_at;
        cycle.result.success = cycle.result.errors.is_empty();
        info!(
            "Sync cycle ({:?}/{:?}): {} keys, {} changes, {} conflicts resolved, {} errors",
            scope,
            direction,
            cycle.result.keys_examined,
            cycle.result.changes.len(),
            cycle.result.conflicts_resolved,
            cycle.result.errors.len()
        );
        self.parts.events.publish_sync_completed(&cycle.result);
        Ok(cycle.result)
    }

    /// Keys the cycle examines: source listings (or changes since `since`)
    /// plus keys with versions to push.
    async fn collect_keys(
        &self,
        participants: &[Arc<dyn DataSource>],
        since: Option<Timestamp>,
        cycle: &mut Cycle,
    ) -> SyncResult<Vec<ItemKey>> {
        let mut keys = BTreeSet::new();
        for source in participants {
            let listed = match since {
                Some(since) => source.changed_since(since).await,
                None => source.list_keys(None).await,
            };
            match listed {
                Ok(listed) => keys.extend(listed),
                Err(e) => {
                    cycle.source_errors.insert(source.id().clone(), e.to_string());
                }
            }
        }
        if cycle.result.direction != SyncDirection::Pull {
            for key in self.parts.versions.keys()? {
                if keys.contains(&key) {
                    continue;
                }
                let Some(current) = self.parts.versions.current_version(&key).await? else {
                    continue;
                };
                if since.is_none_or(|s| current.created_at >= s) {
                    keys.insert(key);
                }
            }
        }
        Ok(keys.into_iter().collect())
    }

    async fn read_records(
        &self,
        participants: &[Arc<dyn DataSource>],
        key: &ItemKey,
        cycle: &mut Cycle,
    ) -> Vec<(SourceId, SourceRecord)> {
        let mut records = Vec::new();
        for (id, read) in read_all(participants, key).await {
            match read {
                Ok(Some(record)) => records.push((id, record)),
                Ok(None) => {}
                Err(e) => {
                    cycle.source_errors.insert(id, e.to_string());
                }
            }
        }
        records
    }

    async fn reconcile_key(
        &self,
        key: &ItemKey,
        participants: &[Arc<dyn DataSource>],
        direction: SyncDirection,
        cycle: &mut Cycle,
    ) -> SyncResult<()> {
        let mut records = self.read_records(participants, key, cycle).await;
        let distinct = distinct_checksums(&records);
        let pulling = direction != SyncDirection::Push;

        // A pulled disagreement goes through detection, which records the
        // observation itself.
        if records.len() >= 2 && (!pulling || distinct == 1) {
            self.record_agreement(key, &records);
        }

        if pulling && distinct == 1 {
            if let Some((origin, record)) = records.first() {
                let description = format!("pulled from {origin}");
                self.pull(key, record, description, cycle).await?;
            }
        } else if pulling && distinct > 1 {
            let detected = self
                .parts
                .detector
                .detect_conflicts_for(
                    participants,
                    std::slice::from_ref(key),
                    self.settings.detection,
                )
                .await?;
            cycle.result.conflicts_detected += detected.len();

            match self.parts.registry.tracked_for_item(key).await {
                Some(tracked) if tracked.state == ConflictState::PendingManual => {
                    debug!(
                        "Conflict {} on {} awaits manual resolution",
                        tracked.conflict.conflict_id, key
                    );
                }
                Some(tracked) => {
                    let conflict_id = tracked.conflict.conflict_id;
                    let resolution = self
                        .parts
                        .resolver
                        .resolve_conflict(conflict_id, self.settings.resolution)
                        .await?;
                    if resolution.success {
                        cycle.result.conflicts_resolved += 1;
                        cycle.result.changes.push(SyncChange {
                            key: key.clone(),
                            kind: SyncChangeKind::ConflictResolved { conflict_id },
                        });
                        records = self.read_records(participants, key, cycle).await;
                    } else {
                        debug!(
                            "Conflict {} on {} left {:?}",
                            conflict_id, key, resolution.state
                        );
                    }
                }
                None => {
                    // Divergence below the detection threshold: keep the
                    // freshest source value rather than the stored one.
                    if let Some((origin, record)) =
                        records.iter().max_by_key(|(_, r)| r.updated_at)
                    {
                        let description = format!("adopted newest value from {origin}");
                        self.pull(key, record, description, cycle).await?;
                    }
                }
            }
        }

        if direction != SyncDirection::Pull {
            self.push(key, participants, &records, cycle).await?;
        }
        Ok(())
    }

    fn record_agreement(&self, key: &ItemKey, records: &[(SourceId, SourceRecord)]) {
        let ids: Vec<SourceId> = records.iter().map(|(id, _)| id.clone()).collect();
        let consistent = distinct_checksums(records) <= 1;
        self.parts.metrics.record_validation(key, &ids, consistent);
    }

    /// Records a source value as the current version if it differs.
    async fn pull(
        &self,
        key: &ItemKey,
        record: &SourceRecord,
        description: String,
        cycle: &mut Cycle,
    ) -> SyncResult<()> {
        let metadata = VersionMetadata::described(VersionType::Automatic, description);
        let recorded = self
            .parts
            .versions
            .record_if_changed(
                key,
                record.payload.clone(),
                &self.settings.created_by,
                Some(metadata),
            )
            .await?;
        if let Some(version) = recorded {
            cycle.result.changes.push(SyncChange {
                key: key.clone(),
                kind: SyncChangeKind::VersionRecorded {
                    version_number: version.version_number,
                },
            });
        }
        Ok(())
    }

    /// Writes the current version to writable sources that differ from it.
    ///
    /// Skipped entirely while `key` has an unresolved conflict. While the
    /// sources holding `key` disagree, only sources missing it are written.
    async fn push(
        &self,
        key: &ItemKey,
        participants: &[Arc<dyn DataSource>],
        records: &[(SourceId, SourceRecord)],
        cycle: &mut Cycle,
    ) -> SyncResult<()> {
        if let Some(conflict) = self.parts.registry.find_for_item(key).await {
            debug!(
                "Not pushing {} while conflict {} is open",
                key, conflict.conflict_id
            );
            return Ok(());
        }
        let Some(current) = self.parts.versions.current_version(key).await? else {
            return Ok(());
        };
        let sources_agree = distinct_checksums(records) <= 1;
        let writable = self.parts.sources.route(RouteOp::Write, Some(key));

        for source in participants {
            if !writable.iter().any(|w| w.id() == source.id())
                || cycle.source_errors.contains_key(source.id())
            {
                continue;
            }
            let held = records.iter().find(|(id, _)| id == source.id());
            let needs_write = match held {
                None => true,
                Some((_, record)) => {
                    sources_agree && checksum(&record.payload) != current.checksum
                }
            };
            if !needs_write {
                continue;
            }
            match source.write(key, current.payload.clone()).await {
                Ok(_) => cycle.result.changes.push(SyncChange {
                    key: key.clone(),
                    kind: SyncChangeKind::Pushed {
                        source_id: source.id().clone(),
                    },
                }),
                Err(e) => {
                    cycle.source_errors.insert(source.id().clone(), e.to_string());
                }
            }
        }
        Ok(())
    }
}

fn distinct_checksums(records: &[(SourceId, SourceRecord)]) -> usize {
    let mut checksums: Vec<String> = records.iter().map(|(_, r)| checksum(&r.payload)).collect();
    checksums.sort_unstable();
    checksums.dedup();
    checksums.len()
}
