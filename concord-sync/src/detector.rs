//! Conflict detection across sources.
//!
//! Detection reads each key from every participating source, turns the
//! results into [`CompetingValue`]s and hands them to the check selected by
//! [`DetectionStrategy`]. Only keys held by at least two sources can
//! conflict. New conflicts enter the [`ConflictRegistry`], are published on
//! the event bus and counted by the metrics aggregator.

use crate::conflict::{
    CompetingValue, ConflictRegistry, ConflictSeverity, ConflictType, DataConflict,
};
use crate::error::{SyncError, SyncResult};
use crate::events::EventBus;
use crate::metrics::MetricsAggregator;
use crate::rules::{ConsistencyRule, RuleActionType, prepare_rules};
use crate::source::{DataSource, read_all};
use crate::ticker::CancellationFlag;
use crate::version::{DataVersion, VersionStore};
use concord_types::{Clock, ConflictId, ItemKey, SourceId, Timestamp, checksum};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// How competing values are compared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DetectionStrategy {
    /// Timestamps spread wider than the tolerance while contents differ.
    TimestampBased,
    /// Sources moved away from the recorded version lineage.
    VersionBased,
    /// Content checksums differ.
    ContentHash,
    /// A configured consistency rule is violated.
    RuleBased,
}

impl DetectionStrategy {
    /// The check implementing this strategy.
    #[must_use]
    pub fn check(self) -> &'static dyn ConflictCheck {
        match self {
            Self::TimestampBased => &TimestampCheck,
            Self::VersionBased => &VersionCheck,
            Self::ContentHash => &ContentHashCheck,
            Self::RuleBased => &RuleCheck,
        }
    }
}

/// Everything a check may look at for one key.
pub struct DetectionContext<'a> {
    pub key: &'a ItemKey,
    pub values: &'a [CompetingValue],
    pub now: Timestamp,
    pub tolerance: Duration,
    pub rules: &'a [ConsistencyRule],
    /// Current version in the version store, if the key has one.
    pub recorded: Option<&'a DataVersion>,
}

impl DetectionContext<'_> {
    fn contents_differ(&self) -> bool {
        self.values
            .windows(2)
            .any(|pair| pair[0].checksum != pair[1].checksum)
    }

    fn timestamp_spread(&self) -> Duration {
        let min = self.values.iter().map(|v| v.timestamp).min();
        let max = self.values.iter().map(|v| v.timestamp).max();
        match (min, max) {
            (Some(min), Some(max)) => max.duration_since(min),
            _ => Duration::ZERO,
        }
    }
}

/// A check's verdict.
#[derive(Debug, Clone, PartialEq)]
pub struct Finding {
    pub conflict_type: ConflictType,
    pub severity: ConflictSeverity,
    pub description: String,
    pub rule_id: Option<String>,
}

/// Uniform detection contract.
pub trait ConflictCheck: Send + Sync {
    fn check(&self, ctx: &DetectionContext<'_>) -> SyncResult<Option<Finding>>;
}

pub struct TimestampCheck;

impl ConflictCheck for TimestampCheck {
    fn check(&self, ctx: &DetectionContext<'_>) -> SyncResult<Option<Finding>> {
        let spread = ctx.timestamp_spread();
        if spread <= ctx.tolerance || !ctx.contents_differ() {
            return Ok(None);
        }
        let severity = if spread > ctx.tolerance * 10 {
            ConflictSeverity::High
        } else {
            ConflictSeverity::Medium
        };
        Ok(Some(Finding {
            conflict_type: ConflictType::TimestampDivergence,
            severity,
            description: format!(
                "timestamps of {} spread {} ms (tolerance {} ms)",
                ctx.key,
                spread.as_millis(),
                ctx.tolerance.as_millis()
            ),
            rule_id: None,
        }))
    }
}

/// Compares every source against the recorded current version.
///
/// A source whose content no longer matches that version has moved away
/// from the lineage and is named in the finding. Keys that were never
/// versioned fall back to comparing the sources' own revision counters.
pub struct VersionCheck;

impl VersionCheck {
    fn against_lineage(ctx: &DetectionContext<'_>, recorded: &DataVersion) -> Option<Finding> {
        let moved: Vec<&str> = ctx
            .values
            .iter()
            .filter(|v| v.checksum != recorded.checksum)
            .map(|v| v.source_id.as_str())
            .collect();
        if moved.is_empty() {
            return None;
        }
        // Nobody holds the recorded version any more: the lineage forked.
        let severity = if moved.len() == ctx.values.len() {
            ConflictSeverity::High
        } else {
            ConflictSeverity::Medium
        };
        Some(Finding {
            conflict_type: ConflictType::VersionDivergence,
            severity,
            description: format!(
                "{} moved away from version {} of {}",
                moved.join(", "),
                recorded.version_number,
                ctx.key
            ),
            rule_id: None,
        })
    }

    fn against_revisions(ctx: &DetectionContext<'_>) -> Finding {
        let diverged = ctx
            .values
            .windows(2)
            .any(|pair| pair[0].version != pair[1].version);
        let (severity, description) = if diverged {
            (
                ConflictSeverity::Medium,
                format!("sources hold different revisions of {}", ctx.key),
            )
        } else {
            (
                ConflictSeverity::High,
                format!("sources hold forked copies of {}", ctx.key),
            )
        };
        Finding {
            conflict_type: ConflictType::VersionDivergence,
            severity,
            description,
            rule_id: None,
        }
    }
}

impl ConflictCheck for VersionCheck {
    fn check(&self, ctx: &DetectionContext<'_>) -> SyncResult<Option<Finding>> {
        if !ctx.contents_differ() {
            return Ok(None);
        }
        Ok(match ctx.recorded {
            Some(recorded) => Self::against_lineage(ctx, recorded),
            None => Some(Self::against_revisions(ctx)),
        })
    }
}

pub struct ContentHashCheck;

impl ConflictCheck for ContentHashCheck {
    fn check(&self, ctx: &DetectionContext<'_>) -> SyncResult<Option<Finding>> {
        if !ctx.contents_differ() {
            return Ok(None);
        }
        // Equal timestamps with different content is the silent kind.
        let severity = if ctx.timestamp_spread().is_zero() {
            ConflictSeverity::High
        } else {
            ConflictSeverity::Medium
        };
        Ok(Some(Finding {
            conflict_type: ConflictType::ContentMismatch,
            severity,
            description: format!("content checksums of {} differ", ctx.key),
            rule_id: None,
        }))
    }
}

pub struct RuleCheck;

impl ConflictCheck for RuleCheck {
    fn check(&self, ctx: &DetectionContext<'_>) -> SyncResult<Option<Finding>> {
        for rule in ctx.rules.iter().filter(|r| r.applies_to(ctx.key)) {
            let Some(violation) = rule.evaluate(ctx.values, ctx.now)? else {
                continue;
            };
            match rule.action.action_type {
                RuleActionType::Log => {
                    info!("Rule {} violated for {}: {}", rule.rule_id, ctx.key, violation);
                }
                RuleActionType::FlagConflict => {
                    return Ok(Some(Finding {
                        conflict_type: ConflictType::RuleViolation,
                        severity: rule.severity,
                        description: violation,
                        rule_id: Some(rule.rule_id.clone()),
                    }));
                }
            }
        }
        Ok(None)
    }
}

/// Outcome of a single item agreement check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemConsistency {
    pub key: ItemKey,
    pub consistent: bool,
    pub sources_checked: usize,
    pub distinct_values: usize,
    pub error: Option<String>,
}

/// Per-item results of a batch agreement check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsistencyBatchResult {
    pub results: Vec<ItemConsistency>,
    pub consistent: usize,
    pub inconsistent: usize,
    pub failed: usize,
}

impl ConsistencyBatchResult {
    /// `PartialFailure` if any item could not be checked.
    pub fn partial_failure(&self) -> Option<SyncError> {
        (self.failed > 0).then(|| SyncError::PartialFailure {
            failed: self.failed,
            total: self.results.len(),
        })
    }
}

/// Values for one key plus the sources that failed to answer.
struct Gathered {
    values: Vec<CompetingValue>,
    errors: Vec<String>,
}

/// Compares sources and records conflicts.
pub struct ConflictDetector {
    registry: Arc<ConflictRegistry>,
    versions: Arc<VersionStore>,
    events: Arc<EventBus>,
    metrics: Arc<MetricsAggregator>,
    clock: Arc<dyn Clock>,
    tolerance: Duration,
    rules: RwLock<Vec<ConsistencyRule>>,
    cancel: CancellationFlag,
}

impl ConflictDetector {
    pub fn new(
        registry: Arc<ConflictRegistry>,
        versions: Arc<VersionStore>,
        events: Arc<EventBus>,
        metrics: Arc<MetricsAggregator>,
        clock: Arc<dyn Clock>,
        tolerance: Duration,
        cancel: CancellationFlag,
    ) -> Self {
        Self {
            registry,
            versions,
            events,
            metrics,
            clock,
            tolerance,
            rules: RwLock::new(Vec::new()),
            cancel,
        }
    }

    /// Validates and installs a rule set, replacing the previous one.
    pub async fn configure_rules(&self, rules: Vec<ConsistencyRule>) -> SyncResult<usize> {
        let prepared = prepare_rules(rules)?;
        let count = prepared.len();
        *self.rules.write().await = prepared;
        info!("Configured {} consistency rules", count);
        Ok(count)
    }

    /// The installed rules, highest priority first.
    pub async fn rules(&self) -> Vec<ConsistencyRule> {
        self.rules.read().await.clone()
    }

    async fn gather(&self, sources: &[Arc<dyn DataSource>], key: &ItemKey) -> Gathered {
        let mut gathered = Gathered {
            values: Vec::new(),
            errors: Vec::new(),
        };
        for (source_id, read) in read_all(sources, key).await {
            match read {
                Ok(Some(record)) => gathered.values.push(CompetingValue {
                    // Recomputed: a source's own checksum may be stale.
                    checksum: checksum(&record.payload),
                    source_id,
                    payload: record.payload,
                    timestamp: record.updated_at,
                    version: record.version,
                }),
                Ok(None) => {}
                Err(e) => {
                    debug!("Read of {} from {} failed: {}", key, source_id, e);
                    gathered.errors.push(format!("{source_id}: {e}"));
                }
            }
        }
        gathered
    }

    /// Keys held by at least two of `sources`.
    async fn shared_keys(&self, sources: &[Arc<dyn DataSource>]) -> Vec<ItemKey> {
        let listings = join_all(sources.iter().map(|s| async move {
            (s.id().clone(), s.list_keys(None).await)
        }))
        .await;
        let mut counts: BTreeMap<ItemKey, usize> = BTreeMap::new();
        for (source_id, listing) in listings {
            match listing {
                Ok(keys) => {
                    for key in keys {
                        *counts.entry(key).or_insert(0) += 1;
                    }
                }
                Err(e) => warn!("Listing keys of {} failed: {}", source_id, e),
            }
        }
        counts
            .into_iter()
            .filter(|(_, n)| *n >= 2)
            .map(|(k, _)| k)
            .collect()
    }

    /// Runs detection over every key shared by `sources`.
    pub async fn detect_conflicts(
        &self,
        sources: &[Arc<dyn DataSource>],
        strategy: DetectionStrategy,
    ) -> SyncResult<Vec<DataConflict>> {
        let keys = self.shared_keys(sources).await;
        self.detect_conflicts_for(sources, &keys, strategy).await
    }

    /// Runs detection over the given keys.
    ///
    /// Every key held by two or more sources counts as one agreement
    /// observation for the metrics aggregator. Keys that already have an
    /// active conflict are skipped.
    pub async fn detect_conflicts_for(
        &self,
        sources: &[Arc<dyn DataSource>],
        keys: &[ItemKey],
        strategy: DetectionStrategy,
    ) -> SyncResult<Vec<DataConflict>> {
        let rules = self.rules.read().await.clone();
        let now = self.clock.now();
        let check = strategy.check();

        let evaluated = join_all(keys.iter().map(|key| {
            let rules = &rules;
            async move {
                if self.cancel.is_cancelled() {
                    return Ok(None);
                }
                let gathered = self.gather(sources, key).await;
                if gathered.values.len() < 2 {
                    return Ok(None);
                }
                let recorded = match strategy {
                    DetectionStrategy::VersionBased => self.versions.current_version(key).await?,
                    _ => None,
                };
                let ctx = DetectionContext {
                    key,
                    values: &gathered.values,
                    now,
                    tolerance: self.tolerance,
                    rules,
                    recorded: recorded.as_ref(),
                };
                if gathered.errors.is_empty() {
                    self.record_agreement(key, &gathered.values, !ctx.contents_differ());
                }
                check
                    .check(&ctx)
                    .map(|found| found.map(|finding| (key, gathered.values, finding)))
            }
        }))
        .await;

        let mut conflicts = Vec::new();
        for outcome in evaluated {
            let Some((key, values, finding)) = outcome? else {
                continue;
            };
            if let Some(existing) = self.registry.find_for_item(key).await {
                debug!("{} already has active conflict {}", key, existing.conflict_id);
                continue;
            }
            let conflict = DataConflict {
                conflict_id: ConflictId::new(),
                item: key.clone(),
                competing_values: values,
                detection_strategy: strategy,
                conflict_type: finding.conflict_type,
                severity: finding.severity,
                rule_id: finding.rule_id,
                description: finding.description,
                detected_at: now,
            };
            self.registry.insert(conflict.clone()).await;
            self.metrics.record_conflict(&conflict);
            self.events.publish_conflict(&conflict);
            conflicts.push(conflict);
        }
        self.cancel.check()?;

        if !conflicts.is_empty() {
            info!(
                "Detected {} conflicts across {} keys ({:?})",
                conflicts.len(),
                keys.len(),
                strategy
            );
        }
        Ok(conflicts)
    }

    fn record_agreement(&self, key: &ItemKey, values: &[CompetingValue], consistent: bool) {
        let source_ids: Vec<SourceId> = values.iter().map(|v| v.source_id.clone()).collect();
        self.metrics.record_validation(key, &source_ids, consistent);
    }

    /// Checks whether every source holding `key` agrees on its content.
    pub async fn check_item_consistency(
        &self,
        sources: &[Arc<dyn DataSource>],
        key: &ItemKey,
    ) -> ItemConsistency {
        let gathered = self.gather(sources, key).await;
        let mut checksums: Vec<&str> = gathered
            .values
            .iter()
            .map(|v| v.checksum.as_str())
            .collect();
        checksums.sort_unstable();
        checksums.dedup();
        let distinct_values = checksums.len();

        if !gathered.errors.is_empty() {
            return ItemConsistency {
                key: key.clone(),
                consistent: false,
                sources_checked: gathered.values.len(),
                distinct_values,
                error: Some(gathered.errors.join("; ")),
            };
        }

        let consistent = distinct_values <= 1;
        self.record_agreement(key, &gathered.values, consistent);
        ItemConsistency {
            key: key.clone(),
            consistent,
            sources_checked: gathered.values.len(),
            distinct_values,
            error: None,
        }
    }

    /// Checks many keys concurrently; one failing key never affects another.
    pub async fn validate_items_consistency_batch(
        &self,
        sources: &[Arc<dyn DataSource>],
        keys: &[ItemKey],
    ) -> ConsistencyBatchResult {
        let results = join_all(
            keys.iter()
                .map(|key| self.check_item_consistency(sources, key)),
        )
        .await;
        let failed = results.iter().filter(|r| r.error.is_some()).count();
        let consistent = results.iter().filter(|r| r.error.is_none() && r.consistent).count();
        let inconsistent = results.len() - failed - consistent;
        info!(
            "Validated {} items: {} consistent, {} inconsistent, {} failed",
            results.len(),
            consistent,
            inconsistent,
            failed
        );
        ConsistencyBatchResult {
            results,
            consistent,
            inconsistent,
            failed,
        }
    }
}
