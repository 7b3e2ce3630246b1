//! Per-source data integrity validation and repair.
//!
//! Integrity is about each source's own data (checksums, completeness,
//! version lineage), independent of whether sources agree with each other.
//! Each validation run updates per-source stats; the resolver's `auto`
//! strategy uses them as trust scores.

use crate::conflict::ConflictSeverity;
use crate::error::{SyncError, SyncResult};
use crate::source::{DataSource, SourceHealth, SourceRecord, SourceSet};
use crate::ticker::CancellationFlag;
use crate::version::VersionStore;
use concord_types::{Clock, IssueId, ItemKey, SourceId, Timestamp};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

const MAX_TREND_POINTS: usize = 500;
const OVERALL_RATE_THRESHOLD: f64 = 0.95;
const SOURCE_RATE_THRESHOLD: f64 = 0.9;

/// How thorough a validation run is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum IntegrityCheckType {
    /// Checksums and empty payloads of what each source holds.
    Quick,
    /// Quick, plus items missing from a source that others have.
    Comprehensive,
    /// Comprehensive, plus version lineage of every key.
    Deep,
    /// Comprehensive over an explicit key list only.
    Selective,
}

/// Restricts a run or report.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntegrityScope {
    pub source_ids: Option<Vec<SourceId>>,
    pub item_types: Option<Vec<String>>,
    pub keys: Option<Vec<ItemKey>>,
}

impl IntegrityScope {
    fn includes_source(&self, id: &SourceId) -> bool {
        self.source_ids.as_ref().is_none_or(|ids| ids.contains(id))
    }

    fn includes_key(&self, key: &ItemKey) -> bool {
        self.item_types
            .as_ref()
            .is_none_or(|types| types.contains(&key.item_type))
            && self.keys.as_ref().is_none_or(|keys| keys.contains(key))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum IssueType {
    ChecksumMismatch,
    EmptyPayload,
    MissingItem,
    BrokenVersionChain,
    SourceUnreachable,
    ReadFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RepairMethod {
    /// Copy the item from a healthy peer or the current version.
    Refetch,
    /// Rewrite the source's own payload so its checksum is recomputed.
    RecomputeChecksum,
    /// Write the current version's payload back.
    RestoreFromVersion,
    Unrepairable,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntegrityIssue {
    pub issue_id: IssueId,
    pub issue_type: IssueType,
    pub severity: ConflictSeverity,
    pub key: Option<ItemKey>,
    pub source_id: Option<SourceId>,
    pub description: String,
    pub detected_at: Timestamp,
    pub suggested_repair: RepairMethod,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntegrityValidation {
    pub check_type: IntegrityCheckType,
    pub is_valid: bool,
    pub total_checked: usize,
    pub intact_count: usize,
    pub issues: Vec<IntegrityIssue>,
    pub checked_at: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepairOutcome {
    pub issue_id: IssueId,
    pub method: RepairMethod,
    pub success: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepairSummary {
    pub repaired_count: usize,
    pub failed_count: usize,
    pub results: Vec<RepairOutcome>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceIntegrityStats {
    pub source_id: SourceId,
    pub reachable: bool,
    pub checked: usize,
    pub intact: usize,
    pub issues: usize,
    pub integrity_rate: f64,
    pub last_checked: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntegrityTrendPoint {
    pub at: Timestamp,
    pub check_type: IntegrityCheckType,
    pub integrity_rate: f64,
    pub issues: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntegrityReport {
    pub generated_at: Timestamp,
    pub overall_rate: f64,
    pub sources: Vec<SourceIntegrityStats>,
    pub trend: Vec<IntegrityTrendPoint>,
    pub recommendations: Vec<String>,
}

#[derive(Default)]
struct IntegrityState {
    stats: BTreeMap<SourceId, SourceIntegrityStats>,
    trend: Vec<IntegrityTrendPoint>,
}

/// Running tally for one source during a run.
#[derive(Default)]
struct Tally {
    unreachable: bool,
    checked: usize,
    intact: usize,
    issues: usize,
}

fn is_empty_payload(payload: &Value) -> bool {
    match payload {
        Value::Null => true,
        Value::Object(fields) => fields.is_empty(),
        _ => false,
    }
}

fn rate(intact: usize, checked: usize) -> f64 {
    if checked == 0 {
        1.0
    } else {
        intact as f64 / checked as f64
    }
}

/// Validates and repairs source data.
pub struct IntegrityChecker {
    sources: Arc<SourceSet>,
    versions: Arc<VersionStore>,
    clock: Arc<dyn Clock>,
    cancel: CancellationFlag,
    state: Mutex<IntegrityState>,
}

impl IntegrityChecker {
    pub fn new(
        sources: Arc<SourceSet>,
        versions: Arc<VersionStore>,
        clock: Arc<dyn Clock>,
        cancel: CancellationFlag,
    ) -> Self {
        Self {
            sources,
            versions,
            clock,
            cancel,
            state: Mutex::new(IntegrityState::default()),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, IntegrityState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn issue(
        &self,
        issue_type: IssueType,
        severity: ConflictSeverity,
        key: Option<&ItemKey>,
        source_id: Option<&SourceId>,
        description: String,
        suggested_repair: RepairMethod,
    ) -> IntegrityIssue {
        IntegrityIssue {
            issue_id: IssueId::new(),
            issue_type,
            severity,
            key: key.cloned(),
            source_id: source_id.cloned(),
            description,
            detected_at: self.clock.now(),
            suggested_repair,
        }
    }

    /// Keys the run covers: explicit keys for selective runs, otherwise
    /// everything any scoped source or the version store knows about.
    async fn expected_keys(
        &self,
        check_type: IntegrityCheckType,
        scope: &IntegrityScope,
        sources: &[Arc<dyn DataSource>],
    ) -> SyncResult<BTreeSet<ItemKey>> {
        if check_type == IntegrityCheckType::Selective {
            return match &scope.keys {
                Some(keys) if !keys.is_empty() => Ok(keys.iter().cloned().collect()),
                _ => Err(SyncError::InvalidArgument(
                    "selective integrity check needs explicit keys".into(),
                )),
            };
        }
        let mut keys = BTreeSet::new();
        for source in sources {
            if source.health() == SourceHealth::Unreachable {
                continue;
            }
            match source.list_keys(None).await {
                Ok(listed) => keys.extend(listed),
                Err(e) => warn!("Listing keys of {} failed: {}", source.id(), e),
            }
        }
        if check_type != IntegrityCheckType::Quick {
            keys.extend(self.versions.keys()?);
        }
        keys.retain(|k| scope.includes_key(k));
        Ok(keys)
    }

    /// Runs one validation pass.
    pub async fn validate_data_integrity(
        &self,
        check_type: IntegrityCheckType,
        scope: Option<IntegrityScope>,
    ) -> SyncResult<IntegrityValidation> {
        let scope = scope.unwrap_or_default();
        let sources: Vec<Arc<dyn DataSource>> = self
            .sources
            .all()
            .into_iter()
            .filter(|s| scope.includes_source(s.id()))
            .collect();
        let keys = self.expected_keys(check_type, &scope, &sources).await?;

        let mut issues = Vec::new();
        let mut tallies: BTreeMap<SourceId, Tally> = BTreeMap::new();

        for source in &sources {
            let tally = tallies.entry(source.id().clone()).or_default();
            if source.health() == SourceHealth::Unreachable {
                tally.unreachable = true;
                tally.checked += 1;
                tally.issues += 1;
                issues.push(self.issue(
                    IssueType::SourceUnreachable,
                    ConflictSeverity::High,
                    None,
                    Some(source.id()),
                    format!("source {} is unreachable", source.id()),
                    RepairMethod::Unrepairable,
                ));
                continue;
            }

            let source_keys: Vec<ItemKey> = if check_type == IntegrityCheckType::Quick {
                match source.list_keys(None).await {
                    Ok(listed) => listed.into_iter().filter(|k| keys.contains(k)).collect(),
                    Err(e) => {
                        warn!("Listing keys of {} failed: {}", source.id(), e);
                        Vec::new()
                    }
                }
            } else {
                keys.iter().cloned().collect()
            };

            for key in &source_keys {
                self.cancel.check()?;
                tally.checked += 1;
                let found = match source.read(key).await {
                    Ok(record) => self.inspect(check_type, source.id(), key, record),
                    Err(e) => Some(self.issue(
                        IssueType::ReadFailed,
                        ConflictSeverity::Medium,
                        Some(key),
                        Some(source.id()),
                        format!("read failed: {e}"),
                        RepairMethod::Unrepairable,
                    )),
                };
                match found {
                    Some(issue) => {
                        debug!(
                            "Integrity issue on {} at {}: {}",
                            key,
                            source.id(),
                            issue.description
                        );
                        tally.issues += 1;
                        issues.push(issue);
                    }
                    None => tally.intact += 1,
                }
            }
        }

        let mut chain_checked = 0;
        let mut chain_intact = 0;
        if check_type == IntegrityCheckType::Deep {
            for key in &keys {
                self.cancel.check()?;
                chain_checked += 1;
                let problems = self.versions.verify_chain(key).await?;
                if problems.is_empty() {
                    chain_intact += 1;
                } else {
                    issues.push(self.issue(
                        IssueType::BrokenVersionChain,
                        ConflictSeverity::Critical,
                        Some(key),
                        None,
                        problems.join("; "),
                        RepairMethod::Unrepairable,
                    ));
                }
            }
        }

        let total_checked = tallies.values().map(|t| t.checked).sum::<usize>() + chain_checked;
        let intact_count = tallies.values().map(|t| t.intact).sum::<usize>() + chain_intact;
        let now = self.clock.now();
        {
            let mut state = self.state();
            for (source_id, tally) in tallies {
                state.stats.insert(
                    source_id.clone(),
                    SourceIntegrityStats {
                        source_id,
                        reachable: !tally.unreachable,
                        checked: tally.checked,
                        intact: tally.intact,
                        issues: tally.issues,
                        integrity_rate: rate(tally.intact, tally.checked),
                        last_checked: now,
                    },
                );
            }
            state.trend.push(IntegrityTrendPoint {
                at: now,
                check_type,
                integrity_rate: rate(intact_count, total_checked),
                issues: issues.len(),
            });
            if state.trend.len() > MAX_TREND_POINTS {
                let excess = state.trend.len() - MAX_TREND_POINTS;
                state.trend.drain(..excess);
            }
        }

        info!(
            "Integrity check ({:?}): {}/{} intact, {} issues",
            check_type,
            intact_count,
            total_checked,
            issues.len()
        );
        Ok(IntegrityValidation {
            check_type,
            is_valid: issues.is_empty(),
            total_checked,
            intact_count,
            issues,
            checked_at: now,
        })
    }

    fn inspect(
        &self,
        check_type: IntegrityCheckType,
        source_id: &SourceId,
        key: &ItemKey,
        record: Option<SourceRecord>,
    ) -> Option<IntegrityIssue> {
        let Some(record) = record else {
            // Quick runs only look at what the source lists.
            return (check_type != IntegrityCheckType::Quick).then(|| {
                self.issue(
                    IssueType::MissingItem,
                    ConflictSeverity::Medium,
                    Some(key),
                    Some(source_id),
                    format!("{key} missing from {source_id}"),
                    RepairMethod::Refetch,
                )
            });
        };
        if is_empty_payload(&record.payload) {
            return Some(self.issue(
                IssueType::EmptyPayload,
                ConflictSeverity::Medium,
                Some(key),
                Some(source_id),
                format!("{key} is empty on {source_id}"),
                RepairMethod::RestoreFromVersion,
            ));
        }
        if !record.checksum_is_valid() {
            return Some(self.issue(
                IssueType::ChecksumMismatch,
                ConflictSeverity::High,
                Some(key),
                Some(source_id),
                format!("checksum of {key} on {source_id} does not match its payload"),
                RepairMethod::RecomputeChecksum,
            ));
        }
        None
    }

    /// Repairs each issue with its suggested method.
    pub async fn repair_integrity_issues(
        &self,
        issues: &[IntegrityIssue],
    ) -> SyncResult<RepairSummary> {
        let mut results = Vec::with_capacity(issues.len());
        for issue in issues {
            self.cancel.check()?;
            let outcome = self.repair(issue).await;
            if let Err(e) = &outcome {
                warn!("Repair of {} failed: {}", issue.issue_id, e);
            }
            results.push(RepairOutcome {
                issue_id: issue.issue_id,
                method: issue.suggested_repair,
                success: outcome.is_ok(),
                error: outcome.err().map(|e| e.to_string()),
            });
        }
        let repaired_count = results.iter().filter(|r| r.success).count();
        info!("Repaired {} of {} integrity issues", repaired_count, results.len());
        Ok(RepairSummary {
            repaired_count,
            failed_count: results.len() - repaired_count,
            results,
        })
    }

    async fn repair(&self, issue: &IntegrityIssue) -> SyncResult<()> {
        let (Some(key), Some(source_id)) = (&issue.key, &issue.source_id) else {
            return Err(SyncError::InvalidArgument(format!(
                "{:?} issues cannot be repaired",
                issue.issue_type
            )));
        };
        let source = self
            .sources
            .get(source_id)
            .ok_or_else(|| SyncError::NotFound(format!("source {source_id}")))?;

        match issue.suggested_repair {
            RepairMethod::RecomputeChecksum => {
                let record = source
                    .read(key)
                    .await?
                    .ok_or_else(|| SyncError::NotFound(format!("{key} on {source_id}")))?;
                source.write(key, record.payload).await?;
            }
            RepairMethod::RestoreFromVersion => {
                let current = self
                    .versions
                    .current_version(key)
                    .await?
                    .ok_or_else(|| SyncError::NotFound(format!("no version of {key}")))?;
                source.write(key, current.payload).await?;
            }
            RepairMethod::Refetch => {
                let payload = self.donor_payload(source_id, key).await?;
                source.write(key, payload).await?;
            }
            RepairMethod::Unrepairable => {
                return Err(SyncError::InvalidArgument(format!(
                    "{:?} issues cannot be repaired",
                    issue.issue_type
                )));
            }
        }
        debug!("Repaired {} on {} via {:?}", key, source_id, issue.suggested_repair);
        Ok(())
    }

    /// The payload to copy into a source missing `key`: the current version
    /// if there is one, else the newest intact copy on another source.
    async fn donor_payload(&self, target: &SourceId, key: &ItemKey) -> SyncResult<Value> {
        if let Some(current) = self.versions.current_version(key).await? {
            return Ok(current.payload);
        }
        let mut best: Option<SourceRecord> = None;
        for peer in self.sources.all() {
            if peer.id() == target || peer.health() == SourceHealth::Unreachable {
                continue;
            }
            if let Ok(Some(record)) = peer.read(key).await {
                let usable = record.checksum_is_valid() && !is_empty_payload(&record.payload);
                if usable && best.as_ref().is_none_or(|b| record.updated_at > b.updated_at) {
                    best = Some(record);
                }
            }
        }
        best.map(|r| r.payload)
            .ok_or_else(|| SyncError::NotFound(format!("no intact copy of {key}")))
    }

    /// Latest integrity rate per source, for trust-based resolution.
    pub fn trust_scores(&self) -> HashMap<SourceId, f64> {
        self.state()
            .stats
            .iter()
            .map(|(id, s)| (id.clone(), s.integrity_rate))
            .collect()
    }

    /// Aggregated stats, trend and recommendations.
    pub fn integrity_report(&self, scope: Option<IntegrityScope>) -> IntegrityReport {
        let scope = scope.unwrap_or_default();
        let state = self.state();
        let sources: Vec<SourceIntegrityStats> = state
            .stats
            .values()
            .filter(|s| scope.includes_source(&s.source_id))
            .cloned()
            .collect();
        let checked: usize = sources.iter().map(|s| s.checked).sum();
        let intact: usize = sources.iter().map(|s| s.intact).sum();
        let overall_rate = rate(intact, checked);

        let mut recommendations = Vec::new();
        if overall_rate < OVERALL_RATE_THRESHOLD {
            recommendations.push(format!(
                "Overall integrity is {:.1}%, below {:.0}%: run a comprehensive check \
                 and repair the reported issues",
                overall_rate * 100.0,
                OVERALL_RATE_THRESHOLD * 100.0
            ));
        }
        for stats in &sources {
            if !stats.reachable {
                recommendations.push(format!(
                    "Source {} could not be checked: verify its connectivity",
                    stats.source_id
                ));
            } else if stats.integrity_rate < SOURCE_RATE_THRESHOLD {
                recommendations.push(format!(
                    "Source {} is at {:.1}% integrity: refetch its data from a trusted peer",
                    stats.source_id,
                    stats.integrity_rate * 100.0
                ));
            }
        }
        if let [.., previous, latest] = state.trend.as_slice() {
            if latest.integrity_rate < previous.integrity_rate {
                recommendations.push(format!(
                    "Integrity dropped from {:.1}% to {:.1}% since the previous check",
                    previous.integrity_rate * 100.0,
                    latest.integrity_rate * 100.0
                ));
            }
        }
        if recommendations.is_empty() {
            recommendations.push("No action needed".to_string());
        }

        IntegrityReport {
            generated_at: self.clock.now(),
            overall_rate,
            sources,
            trend: state.trend.clone(),
            recommendations,
        }
    }

    /// Drops stats and trend.
    pub fn clear(&self) {
        *self.state() = IntegrityState::default();
    }
}
