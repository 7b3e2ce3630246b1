//! Consistency metrics, daily trend points and reports.
//!
//! The aggregator is fed by the detector (validations, conflicts) and the
//! resolver (resolution outcomes). Computed metrics are cached per period:
//! a cached entry is served for [`CACHE_TTL`], and the periodic sweep drops
//! entries older than [`CACHE_MAX_AGE`].

use crate::conflict::{
    ConflictResolutionResult, ConflictSeverity, ConflictState, ConflictType, DataConflict,
};
use chrono::NaiveDate;
use concord_types::{Clock, ItemKey, SourceId, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;

/// How long a computed snapshot is reused.
pub const CACHE_TTL: Duration = Duration::from_secs(5 * 60);
/// Cached snapshots older than this are evicted by [`MetricsAggregator::sweep`].
pub const CACHE_MAX_AGE: Duration = Duration::from_secs(60 * 60);
/// Raw observations older than this are discarded by the sweep.
pub const OBSERVATION_RETENTION: Duration = Duration::from_secs(90 * 24 * 60 * 60);

/// Per-day counters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsistencyTrendPoint {
    pub date: NaiveDate,
    pub checks: u64,
    pub consistent: u64,
    pub conflicts_detected: u64,
    pub conflicts_resolved: u64,
    pub resolution_failures: u64,
    pub total_resolution_ms: u64,
}

impl ConsistencyTrendPoint {
    fn empty(date: NaiveDate) -> Self {
        Self {
            date,
            checks: 0,
            consistent: 0,
            conflicts_detected: 0,
            conflicts_resolved: 0,
            resolution_failures: 0,
            total_resolution_ms: 0,
        }
    }

    /// Share of checks that found the sources in agreement; 1.0 with no checks.
    #[must_use]
    pub fn consistency_rate(&self) -> f64 {
        rate(self.consistent, self.checks)
    }
}

/// Closed time range `[start, end]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MetricsPeriod {
    pub start: Timestamp,
    pub end: Timestamp,
}

impl MetricsPeriod {
    /// The `window` ending at `now`.
    pub fn last(window: Duration, now: Timestamp) -> Self {
        Self {
            start: now.saturating_sub(window),
            end: now,
        }
    }

    #[must_use]
    pub fn contains(&self, ts: Timestamp) -> bool {
        ts >= self.start && ts <= self.end
    }
}

/// Snapshot of consistency for one period.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsistencyMetrics {
    pub period: MetricsPeriod,
    pub total_checks: u64,
    pub overall_consistency_rate: f64,
    pub per_source: BTreeMap<SourceId, f64>,
    pub per_item_type: BTreeMap<String, f64>,
    pub conflicts_detected: u64,
    pub conflicts_resolved: u64,
    pub resolution_failures: u64,
    pub pending_manual: u64,
    pub average_resolution_ms: f64,
    pub computed_at: Timestamp,
}

/// Human-readable summary plus the data behind it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsistencyReport {
    pub summary: String,
    pub metrics: ConsistencyMetrics,
    pub conflict_types: BTreeMap<ConflictType, u64>,
    pub severities: BTreeMap<ConflictSeverity, u64>,
    pub trend: Vec<ConsistencyTrendPoint>,
    pub generated_at: Timestamp,
}

#[derive(Debug, Clone)]
enum Observation {
    Validation {
        at: Timestamp,
        item_type: String,
        sources: Vec<SourceId>,
        consistent: bool,
    },
    Conflict {
        at: Timestamp,
        conflict_type: ConflictType,
        severity: ConflictSeverity,
    },
    Resolution {
        at: Timestamp,
        success: bool,
        state: ConflictState,
        duration_ms: u64,
    },
}

impl Observation {
    fn at(&self) -> Timestamp {
        match self {
            Self::Validation { at, .. }
            | Self::Conflict { at, .. }
            | Self::Resolution { at, .. } => *at,
        }
    }
}

#[derive(Default)]
struct MetricsState {
    observations: Vec<Observation>,
    trend: BTreeMap<NaiveDate, ConsistencyTrendPoint>,
    cache: HashMap<MetricsPeriod, ConsistencyMetrics>,
}

impl MetricsState {
    fn day(&mut self, at: Timestamp) -> &mut ConsistencyTrendPoint {
        let date = at.day();
        self.trend
            .entry(date)
            .or_insert_with(|| ConsistencyTrendPoint::empty(date))
    }
}

/// Aggregates observations into metrics, trends and reports.
pub struct MetricsAggregator {
    clock: Arc<dyn Clock>,
    state: Mutex<MetricsState>,
}

impl MetricsAggregator {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            state: Mutex::new(MetricsState::default()),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MetricsState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Records one cross-source agreement check.
    pub fn record_validation(&self, key: &ItemKey, sources: &[SourceId], consistent: bool) {
        let at = self.clock.now();
        let mut state = self.state();
        let point = state.day(at);
        point.checks += 1;
        if consistent {
            point.consistent += 1;
        }
        state.observations.push(Observation::Validation {
            at,
            item_type: key.item_type.clone(),
            sources: sources.to_vec(),
            consistent,
        });
    }

    pub fn record_conflict(&self, conflict: &DataConflict) {
        let at = self.clock.now();
        let mut state = self.state();
        state.day(at).conflicts_detected += 1;
        state.observations.push(Observation::Conflict {
            at,
            conflict_type: conflict.conflict_type,
            severity: conflict.severity,
        });
    }

    pub fn record_resolution(&self, result: &ConflictResolutionResult) {
        let at = self.clock.now();
        let mut state = self.state();
        let point = state.day(at);
        if result.success {
            point.conflicts_resolved += 1;
            point.total_resolution_ms += result.duration_ms;
        } else if result.state == ConflictState::Failed {
            point.resolution_failures += 1;
        }
        state.observations.push(Observation::Resolution {
            at,
            success: result.success,
            state: result.state,
            duration_ms: result.duration_ms,
        });
    }

    /// Metrics for `period`, served from cache while fresh.
    pub fn metrics(&self, period: MetricsPeriod) -> ConsistencyMetrics {
        let now = self.clock.now();
        let mut state = self.state();
        if let Some(cached) = state.cache.get(&period) {
            if now.duration_since(cached.computed_at) < CACHE_TTL {
                return cached.clone();
            }
        }
        let metrics = compute(&state.observations, period, now);
        state.cache.insert(period, metrics.clone());
        metrics
    }

    /// Daily points between two dates, inclusive, oldest first.
    pub fn trend(&self, from: NaiveDate, to: NaiveDate) -> Vec<ConsistencyTrendPoint> {
        self.state()
            .trend
            .range(from..=to)
            .map(|(_, p)| p.clone())
            .collect()
    }

    /// Summary, snapshot, distributions and trend for `period`.
    pub fn generate_consistency_report(&self, period: MetricsPeriod) -> ConsistencyReport {
        let metrics = self.metrics(period);
        let mut conflict_types = BTreeMap::new();
        let mut severities = BTreeMap::new();
        {
            let state = self.state();
            for obs in state.observations.iter().filter(|o| period.contains(o.at())) {
                if let Observation::Conflict {
                    conflict_type,
                    severity,
                    ..
                } = obs
                {
                    *conflict_types.entry(*conflict_type).or_insert(0) += 1;
                    *severities.entry(*severity).or_insert(0) += 1;
                }
            }
        }
        let trend = self.trend(period.start.day(), period.end.day());

        let summary = format!(
            "{} consistency checks, {:.1}% consistent; {} conflicts detected, {} resolved, \
             {} failed, {} awaiting manual input",
            metrics.total_checks,
            metrics.overall_consistency_rate * 100.0,
            metrics.conflicts_detected,
            metrics.conflicts_resolved,
            metrics.resolution_failures,
            metrics.pending_manual,
        );

        ConsistencyReport {
            summary,
            metrics,
            conflict_types,
            severities,
            trend,
            generated_at: self.clock.now(),
        }
    }

    /// Evicts stale cache entries and expired observations.
    ///
    /// Returns how many cache entries were evicted.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now();
        let mut state = self.state();
        let before = state.cache.len();
        state
            .cache
            .retain(|_, m| now.duration_since(m.computed_at) < CACHE_MAX_AGE);
        let cutoff = now.saturating_sub(OBSERVATION_RETENTION);
        state.observations.retain(|o| o.at() >= cutoff);
        let cutoff_day = cutoff.day();
        state.trend.retain(|day, _| *day >= cutoff_day);
        let evicted = before - state.cache.len();
        if evicted > 0 {
            debug!("Evicted {} cached metrics snapshots", evicted);
        }
        evicted
    }

    /// Number of cached snapshots.
    pub fn cached_len(&self) -> usize {
        self.state().cache.len()
    }

    /// Drops everything.
    pub fn clear(&self) {
        *self.state() = MetricsState::default();
    }
}

fn rate(hits: u64, total: u64) -> f64 {
    if total == 0 {
        1.0
    } else {
        hits as f64 / total as f64
    }
}

fn compute(
    observations: &[Observation],
    period: MetricsPeriod,
    now: Timestamp,
) -> ConsistencyMetrics {
    let mut checks = 0u64;
    let mut consistent = 0u64;
    let mut per_source: BTreeMap<SourceId, (u64, u64)> = BTreeMap::new();
    let mut per_type: BTreeMap<String, (u64, u64)> = BTreeMap::new();
    let mut detected = 0u64;
    let mut resolved = 0u64;
    let mut failures = 0u64;
    let mut pending = 0u64;
    let mut resolution_ms = 0u64;

    for obs in observations.iter().filter(|o| period.contains(o.at())) {
        match obs {
            Observation::Validation {
                item_type,
                sources,
                consistent: ok,
                ..
            } => {
                checks += 1;
                let hit = u64::from(*ok);
                consistent += hit;
                for source in sources {
                    let entry = per_source.entry(source.clone()).or_default();
                    entry.0 += hit;
                    entry.1 += 1;
                }
                let entry = per_type.entry(item_type.clone()).or_default();
                entry.0 += hit;
                entry.1 += 1;
            }
            Observation::Conflict { .. } => detected += 1,
            Observation::Resolution {
                success,
                state,
                duration_ms,
                ..
            } => {
                if *success {
                    resolved += 1;
                    resolution_ms += duration_ms;
                } else if *state == ConflictState::PendingManual {
                    pending += 1;
                } else {
                    failures += 1;
                }
            }
        }
    }

    ConsistencyMetrics {
        period,
        total_checks: checks,
        overall_consistency_rate: rate(consistent, checks),
        per_source: per_source
            .into_iter()
            .map(|(k, (hit, total))| (k, rate(hit, total)))
            .collect(),
        per_item_type: per_type
            .into_iter()
            .map(|(k, (hit, total))| (k, rate(hit, total)))
            .collect(),
        conflicts_detected: detected,
        conflicts_resolved: resolved,
        resolution_failures: failures,
        pending_manual: pending,
        average_resolution_ms: if resolved == 0 {
            0.0
        } else {
            resolution_ms as f64 / resolved as f64
        },
        computed_at: now,
    }
}
