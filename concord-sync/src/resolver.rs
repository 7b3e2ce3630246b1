//! Conflict resolution.
//!
//! Each [`ResolutionStrategy`] maps to a [`ResolutionPolicy`] that turns a
//! conflict into a decision. The resolver applies the decision: writes the
//! winning value through the router, records a version, and drives the
//! conflict's state in the registry. Every attempt yields a
//! [`ConflictResolutionResult`], failures included.

use crate::conflict::{
    ConflictRegistry, ConflictResolutionResult, ConflictState, DataConflict, ResolutionAction,
    ResolvingGuard,
};
use crate::error::{SyncError, SyncResult};
use crate::integrity::IntegrityChecker;
use crate::merge::{MergeCandidate, MergeStrategy};
use crate::metrics::MetricsAggregator;
use crate::source::{RouteOp, SourceSet};
use crate::version::{DataVersion, VersionMetadata, VersionStore, VersionType};
use concord_types::{Clock, ConflictId, ItemKey, SourceId};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// How a conflict's winning value is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ResolutionStrategy {
    /// Prefer the most trusted source by integrity score, then the newest.
    Auto,
    LatestWins,
    EarliestWins,
    /// Field-level union of every competing value.
    Merge,
    /// Wait for a caller to supply the value.
    Manual,
    /// Wait for a user to pick the value.
    UserChoice,
}

impl ResolutionStrategy {
    /// The policy implementing this strategy.
    #[must_use]
    pub fn policy(self) -> &'static dyn ResolutionPolicy {
        match self {
            Self::Auto => &TrustPolicy,
            Self::LatestWins => &LatestWinsPolicy,
            Self::EarliestWins => &EarliestWinsPolicy,
            Self::Merge => &MergePolicy,
            Self::Manual | Self::UserChoice => &ManualPolicy,
        }
    }
}

/// What a policy decided.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Resolved {
        value: Value,
        /// The source whose value won, if one did outright.
        source: Option<SourceId>,
        /// Number of values merged, for merges.
        merged: usize,
    },
    NeedsManual,
    Failed(String),
}

impl Decision {
    fn picked(conflict: &DataConflict, index: Option<usize>) -> Self {
        match index.and_then(|i| conflict.competing_values.get(i)) {
            Some(winner) => Self::Resolved {
                value: winner.payload.clone(),
                source: Some(winner.source_id.clone()),
                merged: 0,
            },
            None => Self::Failed(format!(
                "conflict {} has no competing values",
                conflict.conflict_id
            )),
        }
    }
}

/// Uniform resolution contract.
pub trait ResolutionPolicy: Send + Sync {
    fn decide(&self, conflict: &DataConflict, trust: &HashMap<SourceId, f64>) -> Decision;
}

pub struct LatestWinsPolicy;

impl ResolutionPolicy for LatestWinsPolicy {
    fn decide(&self, conflict: &DataConflict, _trust: &HashMap<SourceId, f64>) -> Decision {
        let index = conflict
            .competing_values
            .iter()
            .enumerate()
            .max_by_key(|(_, v)| v.timestamp)
            .map(|(i, _)| i);
        Decision::picked(conflict, index)
    }
}

pub struct EarliestWinsPolicy;

impl ResolutionPolicy for EarliestWinsPolicy {
    fn decide(&self, conflict: &DataConflict, _trust: &HashMap<SourceId, f64>) -> Decision {
        let index = conflict
            .competing_values
            .iter()
            .enumerate()
            .min_by_key(|(_, v)| v.timestamp)
            .map(|(i, _)| i);
        Decision::picked(conflict, index)
    }
}

pub struct MergePolicy;

impl ResolutionPolicy for MergePolicy {
    fn decide(&self, conflict: &DataConflict, _trust: &HashMap<SourceId, f64>) -> Decision {
        if conflict.competing_values.is_empty() {
            return Decision::picked(conflict, None);
        }
        let candidates: Vec<MergeCandidate<'_>> = conflict
            .competing_values
            .iter()
            .map(|v| MergeCandidate {
                origin: v.source_id.as_str(),
                timestamp: v.timestamp,
                value: &v.payload,
            })
            .collect();
        let outcome = MergeStrategy::MergeAll.merger().merge(&candidates);
        Decision::Resolved {
            value: outcome.value,
            source: None,
            merged: candidates.len(),
        }
    }
}

/// Unknown sources score as fully trusted until an integrity run says
/// otherwise, so with no stats this degrades to latest wins.
pub struct TrustPolicy;

impl ResolutionPolicy for TrustPolicy {
    fn decide(&self, conflict: &DataConflict, trust: &HashMap<SourceId, f64>) -> Decision {
        let score = |id: &SourceId| trust.get(id).copied().unwrap_or(1.0);
        let index = conflict
            .competing_values
            .iter()
            .enumerate()
            .max_by(|(_, a), (_, b)| {
                score(&a.source_id)
                    .total_cmp(&score(&b.source_id))
                    .then(a.timestamp.cmp(&b.timestamp))
            })
            .map(|(i, _)| i);
        Decision::picked(conflict, index)
    }
}

pub struct ManualPolicy;

impl ResolutionPolicy for ManualPolicy {
    fn decide(&self, _conflict: &DataConflict, _trust: &HashMap<SourceId, f64>) -> Decision {
        Decision::NeedsManual
    }
}

/// Dry-run outcome of a strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolutionPreview {
    pub conflict_id: ConflictId,
    pub strategy: ResolutionStrategy,
    pub requires_manual: bool,
    pub value: Option<Value>,
    pub winning_source: Option<SourceId>,
    pub error: Option<String>,
}

/// Per-conflict results of a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchResolutionResult {
    pub results: Vec<ConflictResolutionResult>,
    pub succeeded: usize,
    pub failed: usize,
}

impl BatchResolutionResult {
    /// `PartialFailure` if any conflict was left unresolved.
    pub fn partial_failure(&self) -> Option<SyncError> {
        (self.failed > 0).then(|| SyncError::PartialFailure {
            failed: self.failed,
            total: self.results.len(),
        })
    }
}

/// Applies resolution strategies to registered conflicts.
pub struct ConflictResolver {
    registry: Arc<ConflictRegistry>,
    versions: Arc<VersionStore>,
    sources: Arc<SourceSet>,
    integrity: Arc<IntegrityChecker>,
    metrics: Arc<MetricsAggregator>,
    clock: Arc<dyn Clock>,
    created_by: String,
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

impl ConflictResolver {
    pub fn new(
        registry: Arc<ConflictRegistry>,
        versions: Arc<VersionStore>,
        sources: Arc<SourceSet>,
        integrity: Arc<IntegrityChecker>,
        metrics: Arc<MetricsAggregator>,
        clock: Arc<dyn Clock>,
        created_by: impl Into<String>,
    ) -> Self {
        Self {
            registry,
            versions,
            sources,
            integrity,
            metrics,
            clock,
            created_by: created_by.into(),
        }
    }

    fn result(
        &self,
        conflict_id: ConflictId,
        item: Option<&ItemKey>,
        strategy: ResolutionStrategy,
        started: Instant,
    ) -> ConflictResolutionResult {
        ConflictResolutionResult {
            conflict_id,
            item: item.cloned(),
            success: false,
            strategy_used: strategy,
            state: ConflictState::Failed,
            resolved_value: None,
            actions: Vec::new(),
            resolved_at: self.clock.now(),
            duration_ms: elapsed_ms(started),
            error: None,
        }
    }

    /// Writes `value` to every writable source, then records a version.
    async fn apply(
        &self,
        key: &ItemKey,
        value: &Value,
        description: String,
        version_type: VersionType,
        actions: &mut Vec<ResolutionAction>,
    ) -> SyncResult<DataVersion> {
        let targets = self.sources.route(RouteOp::Write, Some(key));
        if targets.is_empty() {
            return Err(SyncError::NotFound(format!("writable source for {key}")));
        }
        let writes = join_all(targets.iter().map(|source| async move {
            (source.id().clone(), source.write(key, value.clone()).await)
        }))
        .await;

        let mut failures = 0;
        for (source_id, write) in writes {
            match write {
                Ok(_) => actions.push(ResolutionAction::WroteSource { source_id }),
                Err(e) => {
                    warn!("Write-back of {} to {} failed: {}", key, source_id, e);
                    failures += 1;
                    actions.push(ResolutionAction::WriteFailed {
                        source_id,
                        error: e.to_string(),
                    });
                }
            }
        }
        if failures > 0 {
            return Err(SyncError::PartialFailure {
                failed: failures,
                total: targets.len(),
            });
        }

        let metadata = VersionMetadata::described(version_type, description)
            .with_tag("conflict-resolution");
        let version = self
            .versions
            .create_version(key, value.clone(), &self.created_by, Some(metadata))
            .await?;
        actions.push(ResolutionAction::CreatedVersion {
            version_id: version.version_id,
            version_number: version.version_number,
        });
        Ok(version)
    }

    async fn complete(
        &self,
        guard: ResolvingGuard<'_>,
        result: ConflictResolutionResult,
    ) -> ConflictResolutionResult {
        self.metrics.record_resolution(&result);
        guard.finish(result.clone()).await;
        if result.success {
            info!(
                "Resolved conflict {} via {:?} in {} ms",
                result.conflict_id, result.strategy_used, result.duration_ms
            );
        } else {
            debug!(
                "Conflict {} left {:?} via {:?}",
                result.conflict_id, result.state, result.strategy_used
            );
        }
        result
    }

    /// Resolves one active conflict with `strategy`.
    ///
    /// Always returns a result; `success` is only true once the value has
    /// been written to every writable source and versioned.
    pub async fn resolve_conflict(
        &self,
        conflict_id: ConflictId,
        strategy: ResolutionStrategy,
    ) -> SyncResult<ConflictResolutionResult> {
        let started = Instant::now();
        let guard = match self.registry.begin_resolving(conflict_id).await {
            Ok(guard) => guard,
            Err(e) => {
                let mut result = self.result(conflict_id, None, strategy, started);
                result.error = Some(e.to_string());
                self.registry.record_attempt(result.clone()).await;
                return Ok(result);
            }
        };
        let conflict = guard.conflict().clone();
        let mut result = self.result(conflict_id, Some(&conflict.item), strategy, started);

        match strategy.policy().decide(&conflict, &self.integrity.trust_scores()) {
            Decision::NeedsManual => {
                result.state = ConflictState::PendingManual;
                result.actions.push(ResolutionAction::AwaitingManualInput);
            }
            Decision::Failed(reason) => {
                result.error = Some(reason);
            }
            Decision::Resolved {
                value,
                source,
                merged,
            } => {
                let (version_type, description) = if merged > 0 {
                    result.actions.push(ResolutionAction::MergedValues { count: merged });
                    let description = format!("merged {merged} values of conflict {conflict_id}");
                    (VersionType::Merge, description)
                } else {
                    result.actions.push(ResolutionAction::SelectedValue { source_id: source });
                    let description = format!("resolved conflict {conflict_id} ({strategy:?})");
                    (VersionType::Automatic, description)
                };
                let applied = self
                    .apply(&conflict.item, &value, description, version_type, &mut result.actions)
                    .await;
                match applied {
                    Ok(_) => {
                        result.success = true;
                        result.state = ConflictState::Resolved;
                        result.resolved_value = Some(value);
                        result.actions.push(ResolutionAction::RemovedFromActiveSet);
                    }
                    Err(e) => result.error = Some(e.to_string()),
                }
            }
        }

        result.resolved_at = self.clock.now();
        result.duration_ms = elapsed_ms(started);
        Ok(self.complete(guard, result).await)
    }

    /// Resolves several conflicts concurrently; each stands on its own.
    pub async fn resolve_conflicts_batch(
        &self,
        conflict_ids: &[ConflictId],
        strategy: ResolutionStrategy,
    ) -> SyncResult<BatchResolutionResult> {
        let outcomes = join_all(
            conflict_ids
                .iter()
                .map(|id| self.resolve_conflict(*id, strategy)),
        )
        .await;
        let results = outcomes.into_iter().collect::<SyncResult<Vec<_>>>()?;
        let succeeded = results.iter().filter(|r| r.success).count();
        info!("Resolved {} of {} conflicts in batch", succeeded, results.len());
        Ok(BatchResolutionResult {
            failed: results.len() - succeeded,
            succeeded,
            results,
        })
    }

    /// Resolves a conflict with a caller-supplied value.
    pub async fn resolve_manually(
        &self,
        conflict_id: ConflictId,
        value: Value,
    ) -> SyncResult<ConflictResolutionResult> {
        let strategy = ResolutionStrategy::UserChoice;
        let started = Instant::now();
        let guard = match self.registry.begin_resolving(conflict_id).await {
            Ok(guard) => guard,
            Err(e) => {
                let mut result = self.result(conflict_id, None, strategy, started);
                result.error = Some(e.to_string());
                self.registry.record_attempt(result.clone()).await;
                return Ok(result);
            }
        };
        let conflict = guard.conflict().clone();
        let mut result = self.result(conflict_id, Some(&conflict.item), strategy, started);
        result.actions.push(ResolutionAction::SelectedValue { source_id: None });
        let applied = self
            .apply(
                &conflict.item,
                &value,
                format!("manual resolution of conflict {conflict_id}"),
                VersionType::Manual,
                &mut result.actions,
            )
            .await;
        match applied {
            Ok(_) => {
                result.success = true;
                result.state = ConflictState::Resolved;
                result.resolved_value = Some(value);
                result.actions.push(ResolutionAction::RemovedFromActiveSet);
            }
            Err(e) => result.error = Some(e.to_string()),
        }
        result.resolved_at = self.clock.now();
        result.duration_ms = elapsed_ms(started);
        Ok(self.complete(guard, result).await)
    }

    /// Computes what `strategy` would pick without writing anything.
    pub async fn preview_resolution(
        &self,
        conflict_id: ConflictId,
        strategy: ResolutionStrategy,
    ) -> SyncResult<ResolutionPreview> {
        let tracked = self
            .registry
            .get(conflict_id)
            .await
            .ok_or_else(|| SyncError::NotFound(format!("conflict {conflict_id}")))?;
        let mut preview = ResolutionPreview {
            conflict_id,
            strategy,
            requires_manual: false,
            value: None,
            winning_source: None,
            error: None,
        };
        match strategy
            .policy()
            .decide(&tracked.conflict, &self.integrity.trust_scores())
        {
            Decision::Resolved { value, source, .. } => {
                preview.value = Some(value);
                preview.winning_source = source;
            }
            Decision::NeedsManual => preview.requires_manual = true,
            Decision::Failed(reason) => preview.error = Some(reason),
        }
        Ok(preview)
    }
}
