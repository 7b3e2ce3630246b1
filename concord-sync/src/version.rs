//! Per-entity version chains.
//!
//! Each entity key owns an append-only list of [`DataVersion`]s plus a
//! pointer to the current one. Writers for the same key are serialised by a
//! per-key mutex so version numbers are never handed out twice; different
//! keys proceed in parallel.
//!
//! Histories are written through to the [`KvBackend`] under the `versions`
//! namespace and loaded lazily on first access.

use crate::error::{SyncError, SyncResult};
use crate::merge::{FieldConflict, MergeCandidate, MergeStrategy, diff_paths, leaf_count, value_at};
use concord_storage::{KvBackend, get_json, put_json};
use concord_types::{Clock, ItemKey, Timestamp, VersionId, checksum};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

/// Backend namespace for version histories.
pub const VERSIONS_NAMESPACE: &str = "versions";

/// How a version came to exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum VersionType {
    #[default]
    Automatic,
    Manual,
    Merge,
}

/// Descriptive metadata attached to a version.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionMetadata {
    pub tags: Vec<String>,
    pub description: Option<String>,
    pub version_type: VersionType,
    pub is_major: bool,
    /// Versions folded into a merge version.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub merged_from: Vec<VersionId>,
}

impl VersionMetadata {
    /// Metadata of the given type with a description.
    pub fn described(version_type: VersionType, description: impl Into<String>) -> Self {
        Self {
            description: Some(description.into()),
            version_type,
            ..Self::default()
        }
    }

    /// Adds a tag.
    #[must_use]
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }
}

/// An immutable entry in an entity's version chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataVersion {
    pub version_id: VersionId,
    #[serde(flatten)]
    pub key: ItemKey,
    pub version_number: u64,
    pub payload: Value,
    pub checksum: String,
    pub created_at: Timestamp,
    pub created_by: String,
    pub parent_version_id: Option<VersionId>,
    pub metadata: VersionMetadata,
}

/// Filters for [`VersionStore::version_history`].
#[derive(Debug, Clone, Copy, Default)]
pub struct HistoryQuery {
    pub limit: Option<usize>,
    /// Inclusive lower bound on `created_at`.
    pub start: Option<Timestamp>,
    /// Inclusive upper bound on `created_at`.
    pub end: Option<Timestamp>,
}

/// Outcome of a rollback. Rollbacks append a restoring version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RollbackResult {
    pub success: bool,
    pub target_version_id: VersionId,
    pub previous_version_id: Option<VersionId>,
    pub restored_version: DataVersion,
}

/// One differing path between two versions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDifference {
    pub path: String,
    pub left: Option<Value>,
    pub right: Option<Value>,
}

/// Field-level comparison of two versions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionComparison {
    pub left: VersionId,
    pub right: VersionId,
    pub differences: Vec<FieldDifference>,
    /// 1.0 for identical payloads, 0.0 when every field differs.
    pub similarity_score: f64,
}

/// Outcome of merging several versions into a new one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeResult {
    pub success: bool,
    pub strategy: MergeStrategy,
    pub merged_version: DataVersion,
    /// Fields left undecided by `keepConflicts`.
    pub conflicts: Vec<FieldConflict>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct KeyHistory {
    /// Oldest first.
    versions: Vec<DataVersion>,
    current: Option<VersionId>,
}

impl KeyHistory {
    fn current(&self) -> Option<&DataVersion> {
        let id = self.current?;
        self.versions.iter().rev().find(|v| v.version_id == id)
    }

    fn find(&self, id: VersionId) -> Option<&DataVersion> {
        self.versions.iter().find(|v| v.version_id == id)
    }

    fn evict(&mut self, max: usize) -> usize {
        if self.versions.len() <= max {
            return 0;
        }
        let target = self.versions.len() / 2;
        let current = self.current;
        let mut dropped = 0;
        self.versions.retain(|v| {
            if dropped < target && Some(v.version_id) != current {
                dropped += 1;
                false
            } else {
                true
            }
        });
        dropped
    }
}

/// Append-only version chains for every tracked entity.
pub struct VersionStore {
    backend: Arc<dyn KvBackend>,
    clock: Arc<dyn Clock>,
    max_history: usize,
    histories: RwLock<HashMap<ItemKey, Arc<Mutex<KeyHistory>>>>,
}

impl VersionStore {
    /// Creates a store that keeps at most `max_history` versions per key.
    pub fn new(backend: Arc<dyn KvBackend>, clock: Arc<dyn Clock>, max_history: usize) -> Self {
        Self {
            backend,
            clock,
            max_history: max_history.max(2),
            histories: RwLock::new(HashMap::new()),
        }
    }

    /// Returns the per-key slot, loading it from the backend on first use.
    async fn slot(&self, key: &ItemKey) -> SyncResult<Arc<Mutex<KeyHistory>>> {
        if let Some(slot) = self.histories.read().await.get(key) {
            return Ok(Arc::clone(slot));
        }
        let mut histories = self.histories.write().await;
        if let Some(slot) = histories.get(key) {
            return Ok(Arc::clone(slot));
        }
        let loaded: KeyHistory =
            get_json(self.backend.as_ref(), VERSIONS_NAMESPACE, &key.storage_key())?
                .unwrap_or_default();
        let slot = Arc::new(Mutex::new(loaded));
        histories.insert(key.clone(), Arc::clone(&slot));
        Ok(slot)
    }

    fn persist(&self, key: &ItemKey, history: &KeyHistory) -> SyncResult<()> {
        put_json(
            self.backend.as_ref(),
            VERSIONS_NAMESPACE,
            &key.storage_key(),
            history,
        )?;
        Ok(())
    }

    /// Appends under the key lock; the new history is only adopted once it
    /// has been persisted.
    fn append(
        &self,
        key: &ItemKey,
        history: &mut KeyHistory,
        payload: Value,
        created_by: &str,
        metadata: VersionMetadata,
    ) -> SyncResult<DataVersion> {
        let parent = history.current().cloned();
        let version = DataVersion {
            version_id: VersionId::new(),
            key: key.clone(),
            version_number: parent.as_ref().map_or(1, |p| p.version_number + 1),
            checksum: checksum(&payload),
            payload,
            created_at: self.clock.now(),
            created_by: created_by.to_string(),
            parent_version_id: parent.map(|p| p.version_id),
            metadata,
        };

        let mut next = history.clone();
        next.versions.push(version.clone());
        next.current = Some(version.version_id);
        let evicted = next.evict(self.max_history);
        self.persist(key, &next)?;
        *history = next;

        if evicted > 0 {
            debug!("Evicted {} old versions of {}", evicted, key);
        }
        debug!("Created version {} of {}", version.version_number, key);
        Ok(version)
    }

    /// Creates a new version and makes it current.
    pub async fn create_version(
        &self,
        key: &ItemKey,
        payload: Value,
        created_by: &str,
        metadata: Option<VersionMetadata>,
    ) -> SyncResult<DataVersion> {
        let slot = self.slot(key).await?;
        let mut history = slot.lock().await;
        self.append(key, &mut history, payload, created_by, metadata.unwrap_or_default())
    }

    /// Creates a version only if `payload` differs from the current one.
    pub async fn record_if_changed(
        &self,
        key: &ItemKey,
        payload: Value,
        created_by: &str,
        metadata: Option<VersionMetadata>,
    ) -> SyncResult<Option<DataVersion>> {
        let slot = self.slot(key).await?;
        let mut history = slot.lock().await;
        if history
            .current()
            .is_some_and(|c| c.checksum == checksum(&payload))
        {
            return Ok(None);
        }
        self.append(key, &mut history, payload, created_by, metadata.unwrap_or_default())
            .map(Some)
    }

    /// The current version, if any.
    pub async fn current_version(&self, key: &ItemKey) -> SyncResult<Option<DataVersion>> {
        let slot = self.slot(key).await?;
        let history = slot.lock().await;
        Ok(history.current().cloned())
    }

    /// Looks up one version.
    pub async fn get_version(
        &self,
        key: &ItemKey,
        version_id: VersionId,
    ) -> SyncResult<DataVersion> {
        let slot = self.slot(key).await?;
        let history = slot.lock().await;
        history
            .find(version_id)
            .cloned()
            .ok_or_else(|| SyncError::NotFound(format!("version {version_id} of {key}")))
    }

    /// Versions newest first, filtered by time range and limit.
    pub async fn version_history(
        &self,
        key: &ItemKey,
        query: HistoryQuery,
    ) -> SyncResult<Vec<DataVersion>> {
        let slot = self.slot(key).await?;
        let history = slot.lock().await;
        let matching = history
            .versions
            .iter()
            .rev()
            .filter(|v| query.start.is_none_or(|s| v.created_at >= s))
            .filter(|v| query.end.is_none_or(|e| v.created_at <= e))
            .cloned();
        Ok(match query.limit {
            Some(limit) => matching.take(limit).collect(),
            None => matching.collect(),
        })
    }

    /// Restores the payload of `version_id` by appending it as a new version.
    ///
    /// Intervening versions are kept.
    pub async fn rollback_to_version(
        &self,
        key: &ItemKey,
        version_id: VersionId,
        created_by: &str,
    ) -> SyncResult<RollbackResult> {
        let slot = self.slot(key).await?;
        let mut history = slot.lock().await;
        let target = history
            .find(version_id)
            .cloned()
            .ok_or_else(|| SyncError::NotFound(format!("version {version_id} of {key}")))?;
        let previous_version_id = history.current;

        let metadata = VersionMetadata::described(
            VersionType::Manual,
            format!("rollback to version {}", target.version_number),
        )
        .with_tag("rollback");
        let restored = self.append(key, &mut history, target.payload, created_by, metadata)?;

        info!(
            "Rolled back {} to version {} (now version {})",
            key, target.version_number, restored.version_number
        );
        Ok(RollbackResult {
            success: true,
            target_version_id: version_id,
            previous_version_id,
            restored_version: restored,
        })
    }

    /// Compares two versions field by field.
    pub async fn compare_versions(
        &self,
        key: &ItemKey,
        left: VersionId,
        right: VersionId,
    ) -> SyncResult<VersionComparison> {
        let slot = self.slot(key).await?;
        let history = slot.lock().await;
        let missing = |id: VersionId| SyncError::NotFound(format!("version {id} of {key}"));
        let a = history.find(left).ok_or_else(|| missing(left))?;
        let b = history.find(right).ok_or_else(|| missing(right))?;

        let mut paths = Vec::new();
        diff_paths(&a.payload, &b.payload, "", &mut paths);
        let differences: Vec<FieldDifference> = paths
            .into_iter()
            .map(|path| FieldDifference {
                left: value_at(&a.payload, &path).cloned(),
                right: value_at(&b.payload, &path).cloned(),
                path,
            })
            .collect();

        let total = leaf_count(&a.payload)
            .max(leaf_count(&b.payload))
            .max(differences.len());
        let similarity_score = if differences.is_empty() {
            1.0
        } else {
            (1.0 - differences.len() as f64 / total as f64).clamp(0.0, 1.0)
        };

        Ok(VersionComparison {
            left,
            right,
            differences,
            similarity_score,
        })
    }

    /// Merges several versions of one key into a new `Merge` version.
    pub async fn merge_versions(
        &self,
        key: &ItemKey,
        version_ids: &[VersionId],
        strategy: MergeStrategy,
        created_by: &str,
    ) -> SyncResult<MergeResult> {
        if version_ids.len() < 2 {
            return Err(SyncError::InvalidArgument(
                "merge needs at least two versions".into(),
            ));
        }
        let slot = self.slot(key).await?;
        let mut history = slot.lock().await;

        let mut sources = Vec::with_capacity(version_ids.len());
        for id in version_ids {
            let version = history
                .find(*id)
                .cloned()
                .ok_or_else(|| SyncError::NotFound(format!("version {id} of {key}")))?;
            sources.push(version);
        }
        let origins: Vec<String> = sources.iter().map(|v| v.version_id.to_string()).collect();
        let candidates: Vec<MergeCandidate<'_>> = sources
            .iter()
            .zip(&origins)
            .map(|(v, origin)| MergeCandidate {
                origin,
                timestamp: v.created_at,
                value: &v.payload,
            })
            .collect();
        let outcome = strategy.merger().merge(&candidates);

        let mut metadata = VersionMetadata::described(
            VersionType::Merge,
            format!("merge of {} versions ({strategy:?})", version_ids.len()),
        );
        metadata.merged_from = version_ids.to_vec();
        for conflict in &outcome.conflicts {
            metadata.tags.push(format!("conflict:{}", conflict.field));
        }
        let merged_version = self.append(key, &mut history, outcome.value, created_by, metadata)?;

        Ok(MergeResult {
            success: true,
            strategy,
            merged_version,
            conflicts: outcome.conflicts,
        })
    }

    /// Checks numbering and parent links of a key's retained chain.
    ///
    /// Returns a description of every problem found; empty means intact.
    pub async fn verify_chain(&self, key: &ItemKey) -> SyncResult<Vec<String>> {
        let slot = self.slot(key).await?;
        let history = slot.lock().await;
        let mut problems = Vec::new();
        for pair in history.versions.windows(2) {
            let (prev, next) = (&pair[0], &pair[1]);
            if next.version_number <= prev.version_number {
                problems.push(format!(
                    "version {} does not follow {}",
                    next.version_number, prev.version_number
                ));
            }
            if next.parent_version_id != Some(prev.version_id) {
                problems.push(format!(
                    "version {} has parent {:?}, expected {}",
                    next.version_number, next.parent_version_id, prev.version_id
                ));
            }
        }
        for version in &history.versions {
            if version.checksum != checksum(&version.payload) {
                problems.push(format!(
                    "version {} checksum does not match payload",
                    version.version_number
                ));
            }
        }
        match (history.current, history.versions.last()) {
            (Some(current), Some(last)) if current != last.version_id => {
                problems.push(format!("current pointer {current} is not the newest version"));
            }
            (None, Some(_)) => problems.push("missing current pointer".to_string()),
            _ => {}
        }
        Ok(problems)
    }

    /// Every key with at least one version. Appends are written through, so
    /// the backend listing is authoritative.
    pub fn keys(&self) -> SyncResult<Vec<ItemKey>> {
        Ok(self
            .backend
            .list(VERSIONS_NAMESPACE)?
            .into_iter()
            .filter_map(|(stored, _)| stored.parse::<ItemKey>().ok())
            .collect())
    }
}
