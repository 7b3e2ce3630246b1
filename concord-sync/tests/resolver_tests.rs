//! Tests for conflict resolution strategies and the conflict lifecycle.

use concord_storage::MemoryBackend;
use concord_sync::source::mock::MemorySource;
use concord_sync::{
    CancellationFlag, ConflictDetector, ConflictId, ConflictRegistry, ConflictResolver,
    ConflictState, DataConflict, DetectionStrategy, EventBus, HealthyRouter, HistoryQuery,
    IntegrityCheckType, IntegrityChecker, MetricsAggregator, MetricsPeriod, ResolutionAction,
    ResolutionStrategy, SourceRecord, SourceSet, SyncError, VersionStore, VersionType,
};
use concord_types::{Clock, ItemKey, ManualClock, Timestamp};
use pretty_assertions::assert_eq;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;

struct Fixture {
    clock: Arc<ManualClock>,
    sources: Arc<SourceSet>,
    registry: Arc<ConflictRegistry>,
    versions: Arc<VersionStore>,
    integrity: Arc<IntegrityChecker>,
    metrics: Arc<MetricsAggregator>,
    detector: ConflictDetector,
    resolver: ConflictResolver,
    local: Arc<MemorySource>,
    remote: Arc<MemorySource>,
}

impl Fixture {
    fn new() -> Self {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
        let clock = Arc::new(ManualClock::new(Timestamp::from_millis(50_000)));
        let dyn_clock: Arc<dyn Clock> = clock.clone();
        let sources = Arc::new(SourceSet::new(Arc::new(HealthyRouter)));
        let local = Arc::new(MemorySource::with_clock("local", dyn_clock.clone()));
        let remote = Arc::new(MemorySource::with_clock("remote", dyn_clock.clone()));
        sources.register(local.clone());
        sources.register(remote.clone());

        let cancel = CancellationFlag::new();
        let registry = Arc::new(ConflictRegistry::new(100));
        let metrics = Arc::new(MetricsAggregator::new(dyn_clock.clone()));
        let versions = Arc::new(VersionStore::new(
            Arc::new(MemoryBackend::new()),
            dyn_clock.clone(),
            100,
        ));
        let integrity = Arc::new(IntegrityChecker::new(
            sources.clone(),
            versions.clone(),
            dyn_clock.clone(),
            cancel.clone(),
        ));
        let detector = ConflictDetector::new(
            registry.clone(),
            versions.clone(),
            Arc::new(EventBus::new()),
            metrics.clone(),
            dyn_clock.clone(),
            Duration::from_millis(4),
            cancel,
        );
        let resolver = ConflictResolver::new(
            registry.clone(),
            versions.clone(),
            sources.clone(),
            integrity.clone(),
            metrics.clone(),
            dyn_clock,
            "resolver-test",
        );
        Self {
            clock,
            sources,
            registry,
            versions,
            integrity,
            metrics,
            detector,
            resolver,
            local,
            remote,
        }
    }

    fn seed(&self, key: &ItemKey, local: (Value, u64), remote: (Value, u64)) {
        self.local.insert(key.clone(), local.0, Timestamp::from_millis(local.1), 1);
        self.remote.insert(key.clone(), remote.0, Timestamp::from_millis(remote.1), 1);
    }

    async fn detect(&self) -> Vec<DataConflict> {
        self.detector
            .detect_conflicts(&self.sources.all(), DetectionStrategy::ContentHash)
            .await
            .unwrap()
    }

    async fn nav_conflict(&self) -> DataConflict {
        self.seed(&nav_key(), (json!({"nav": 1.2345}), 100), (json!({"nav": 1.2399}), 105));
        self.detect().await.remove(0)
    }
}

fn nav_key() -> ItemKey {
    ItemKey::new("fund", "NAV-1").unwrap()
}

// ── Strategies ───────────────────────────────────────────────────

#[tokio::test]
async fn latest_wins_writes_back_and_versions() {
    let fx = Fixture::new();
    let before = fx
        .versions
        .create_version(&nav_key(), json!({"nav": 1.2345}), "seed", None)
        .await
        .unwrap();
    let conflict = fx.nav_conflict().await;

    let result = fx
        .resolver
        .resolve_conflict(conflict.conflict_id, ResolutionStrategy::LatestWins)
        .await
        .unwrap();

    assert!(result.success);
    assert_eq!(result.state, ConflictState::Resolved);
    assert_eq!(result.resolved_value, Some(json!({"nav": 1.2399})));
    assert_eq!(result.item, Some(nav_key()));
    assert_eq!(fx.local.record(&nav_key()).unwrap().payload, json!({"nav": 1.2399}));
    assert_eq!(fx.remote.record(&nav_key()).unwrap().payload, json!({"nav": 1.2399}));

    let current = fx.versions.current_version(&nav_key()).await.unwrap().unwrap();
    assert_eq!(current.version_number, before.version_number + 1);
    assert_eq!(current.payload, json!({"nav": 1.2399}));
    assert!(current.metadata.tags.contains(&"conflict-resolution".to_string()));
    assert!(result.actions.contains(&ResolutionAction::CreatedVersion {
        version_id: current.version_id,
        version_number: current.version_number,
    }));
    assert_eq!(result.actions.last(), Some(&ResolutionAction::RemovedFromActiveSet));
}

#[tokio::test]
async fn resolved_conflict_leaves_active_set_and_is_recorded_once() {
    let fx = Fixture::new();
    let conflict = fx.nav_conflict().await;
    assert!(fx.registry.is_active(conflict.conflict_id).await);

    fx.resolver
        .resolve_conflict(conflict.conflict_id, ResolutionStrategy::LatestWins)
        .await
        .unwrap();

    assert!(!fx.registry.is_active(conflict.conflict_id).await);
    let history = fx.registry.history_for(conflict.conflict_id).await;
    assert_eq!(history.len(), 1);
    assert!(history[0].success);
}

#[tokio::test]
async fn earliest_wins_picks_oldest_value() {
    let fx = Fixture::new();
    let conflict = fx.nav_conflict().await;

    let result = fx
        .resolver
        .resolve_conflict(conflict.conflict_id, ResolutionStrategy::EarliestWins)
        .await
        .unwrap();

    assert_eq!(result.resolved_value, Some(json!({"nav": 1.2345})));
    assert!(result.actions.contains(&ResolutionAction::SelectedValue {
        source_id: Some("local".into())
    }));
}

#[tokio::test]
async fn merge_unions_fields_with_newest_leaf_winning() {
    let fx = Fixture::new();
    fx.seed(
        &nav_key(),
        (json!({"nav": 1.2345, "ccy": "EUR", "meta": {"a": 1}}), 100),
        (json!({"nav": 1.2399, "isin": "LU1", "meta": {"b": 2}}), 105),
    );
    let conflict = fx.detect().await.remove(0);

    let result = fx
        .resolver
        .resolve_conflict(conflict.conflict_id, ResolutionStrategy::Merge)
        .await
        .unwrap();

    assert_eq!(
        result.resolved_value,
        Some(json!({"nav": 1.2399, "ccy": "EUR", "isin": "LU1", "meta": {"a": 1, "b": 2}}))
    );
    assert!(result.actions.contains(&ResolutionAction::MergedValues { count: 2 }));
    let current = fx.versions.current_version(&nav_key()).await.unwrap().unwrap();
    assert_eq!(current.metadata.version_type, VersionType::Merge);
}

#[tokio::test]
async fn auto_prefers_the_more_trusted_source() {
    let fx = Fixture::new();
    let conflict = fx.nav_conflict().await;
    let mut corrupt = SourceRecord::new(json!({"x": 1}), Timestamp::from_millis(1), 1);
    corrupt.checksum = "corrupt".into();
    fx.remote.insert_raw(ItemKey::new("fund", "other").unwrap(), corrupt);
    fx.integrity
        .validate_data_integrity(IntegrityCheckType::Quick, None)
        .await
        .unwrap();

    let result = fx
        .resolver
        .resolve_conflict(conflict.conflict_id, ResolutionStrategy::Auto)
        .await
        .unwrap();

    // Remote is newer but only half intact.
    assert!(result.success);
    assert_eq!(result.resolved_value, Some(json!({"nav": 1.2345})));
}

#[tokio::test]
async fn auto_without_integrity_data_behaves_like_latest_wins() {
    let fx = Fixture::new();
    let conflict = fx.nav_conflict().await;

    let result = fx
        .resolver
        .resolve_conflict(conflict.conflict_id, ResolutionStrategy::Auto)
        .await
        .unwrap();
    assert_eq!(result.resolved_value, Some(json!({"nav": 1.2399})));
}

// ── Manual ───────────────────────────────────────────────────────

#[tokio::test]
async fn manual_strategies_leave_conflict_pending() {
    for strategy in [ResolutionStrategy::Manual, ResolutionStrategy::UserChoice] {
        let fx = Fixture::new();
        let conflict = fx.nav_conflict().await;
        let writes_before = fx.local.write_count() + fx.remote.write_count();

        let result = fx
            .resolver
            .resolve_conflict(conflict.conflict_id, strategy)
            .await
            .unwrap();

        assert!(!result.success, "{strategy:?}");
        assert_eq!(result.state, ConflictState::PendingManual);
        assert_eq!(result.resolved_value, None);
        assert_eq!(result.actions, vec![ResolutionAction::AwaitingManualInput]);
        assert_eq!(fx.local.write_count() + fx.remote.write_count(), writes_before);

        let tracked = fx.registry.get(conflict.conflict_id).await.unwrap();
        assert_eq!(tracked.state, ConflictState::PendingManual);
        assert_eq!(fx.registry.history_for(conflict.conflict_id).await.len(), 1);
    }
}

#[tokio::test]
async fn manual_value_completes_pending_conflict() {
    let fx = Fixture::new();
    let conflict = fx.nav_conflict().await;
    fx.resolver
        .resolve_conflict(conflict.conflict_id, ResolutionStrategy::Manual)
        .await
        .unwrap();

    let result = fx
        .resolver
        .resolve_manually(conflict.conflict_id, json!({"nav": 1.2370}))
        .await
        .unwrap();

    assert!(result.success);
    assert_eq!(result.strategy_used, ResolutionStrategy::UserChoice);
    assert_eq!(fx.remote.record(&nav_key()).unwrap().payload, json!({"nav": 1.2370}));
    assert!(!fx.registry.is_active(conflict.conflict_id).await);
    let current = fx.versions.current_version(&nav_key()).await.unwrap().unwrap();
    assert_eq!(current.metadata.version_type, VersionType::Manual);
    assert_eq!(fx.registry.history_for(conflict.conflict_id).await.len(), 2);
}

// ── Failures ─────────────────────────────────────────────────────

#[tokio::test]
async fn failed_write_keeps_conflict_active_and_allows_retry() {
    let fx = Fixture::new();
    let conflict = fx.nav_conflict().await;
    fx.remote.fail_next_writes(1);

    let failed = fx
        .resolver
        .resolve_conflict(conflict.conflict_id, ResolutionStrategy::LatestWins)
        .await
        .unwrap();

    assert!(!failed.success);
    assert_eq!(failed.state, ConflictState::Failed);
    assert!(failed.error.is_some());
    assert!(failed.actions.iter().any(|a| matches!(a, ResolutionAction::WriteFailed { .. })));
    assert!(fx.registry.is_active(conflict.conflict_id).await);
    assert_eq!(fx.versions.current_version(&nav_key()).await.unwrap(), None);

    let retried = fx
        .resolver
        .resolve_conflict(conflict.conflict_id, ResolutionStrategy::LatestWins)
        .await
        .unwrap();
    assert!(retried.success);
    assert_eq!(fx.registry.get(conflict.conflict_id).await, None);
}

#[tokio::test]
async fn abandoned_resolution_returns_the_conflict_to_its_previous_state() {
    let fx = Fixture::new();
    let conflict = fx.nav_conflict().await;
    let id = conflict.conflict_id;

    let guard = fx.registry.begin_resolving(id).await.unwrap();
    assert_eq!(fx.registry.get(id).await.unwrap().state, ConflictState::Resolving);
    assert!(matches!(
        fx.registry.begin_resolving(id).await,
        Err(SyncError::AlreadyInProgress(_))
    ));

    // Dropping the guard stands in for a cancelled resolve future.
    drop(guard);
    assert_eq!(fx.registry.get(id).await.unwrap().state, ConflictState::Detected);
    assert!(fx.registry.history_for(id).await.is_empty());

    let resolved = fx
        .resolver
        .resolve_conflict(id, ResolutionStrategy::LatestWins)
        .await
        .unwrap();
    assert!(resolved.success);
    assert!(!fx.registry.is_active(id).await);
}

#[tokio::test]
async fn unknown_conflict_yields_failed_result() {
    let fx = Fixture::new();
    let id = ConflictId::new();

    let result = fx
        .resolver
        .resolve_conflict(id, ResolutionStrategy::LatestWins)
        .await
        .unwrap();

    assert!(!result.success);
    assert!(result.error.unwrap().contains("not found"));
    assert_eq!(fx.registry.history_for(id).await.len(), 1);
}

// ── Batch ────────────────────────────────────────────────────────

#[tokio::test]
async fn batch_entries_are_independent() {
    let fx = Fixture::new();
    let a = ItemKey::new("fund", "A").unwrap();
    let b = ItemKey::new("fund", "B").unwrap();
    fx.seed(&a, (json!(1), 100), (json!(2), 200));
    fx.seed(&b, (json!(3), 100), (json!(4), 200));
    let ids: Vec<ConflictId> = fx.detect().await.iter().map(|c| c.conflict_id).collect();
    assert_eq!(ids.len(), 2);
    let bogus = ConflictId::new();

    let batch = fx
        .resolver
        .resolve_conflicts_batch(&[ids[0], bogus, ids[1]], ResolutionStrategy::LatestWins)
        .await
        .unwrap();

    assert_eq!(batch.succeeded, 2);
    assert_eq!(batch.failed, 1);
    assert!(matches!(
        batch.partial_failure(),
        Some(SyncError::PartialFailure { failed: 1, total: 3 })
    ));
    assert_eq!(fx.registry.active_count().await, 0);
}

#[tokio::test]
async fn resolutions_feed_metrics() {
    let fx = Fixture::new();
    let conflict = fx.nav_conflict().await;
    fx.resolver
        .resolve_conflict(conflict.conflict_id, ResolutionStrategy::LatestWins)
        .await
        .unwrap();

    fx.clock.advance(Duration::from_millis(1));
    let now = fx.clock.now();
    let metrics = fx.metrics.metrics(MetricsPeriod::last(Duration::from_secs(60), now));
    assert_eq!(metrics.conflicts_detected, 1);
    assert_eq!(metrics.conflicts_resolved, 1);
    assert_eq!(metrics.resolution_failures, 0);
}

// ── Preview ──────────────────────────────────────────────────────

#[tokio::test]
async fn preview_computes_without_writing() {
    let fx = Fixture::new();
    let conflict = fx.nav_conflict().await;
    let writes_before = fx.local.write_count() + fx.remote.write_count();

    let latest = fx
        .resolver
        .preview_resolution(conflict.conflict_id, ResolutionStrategy::LatestWins)
        .await
        .unwrap();
    let manual = fx
        .resolver
        .preview_resolution(conflict.conflict_id, ResolutionStrategy::Manual)
        .await
        .unwrap();

    assert_eq!(latest.value, Some(json!({"nav": 1.2399})));
    assert_eq!(latest.winning_source, Some("remote".into()));
    assert!(manual.requires_manual);
    assert_eq!(fx.local.write_count() + fx.remote.write_count(), writes_before);
    assert!(fx.registry.is_active(conflict.conflict_id).await);
}

#[tokio::test]
async fn preview_of_unknown_conflict_is_not_found() {
    let fx = Fixture::new();
    let err = fx
        .resolver
        .preview_resolution(ConflictId::new(), ResolutionStrategy::LatestWins)
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::NotFound(_)));
}

#[tokio::test]
async fn history_of_resolved_key_has_resolution_version() {
    let fx = Fixture::new();
    let conflict = fx.nav_conflict().await;
    fx.resolver
        .resolve_conflict(conflict.conflict_id, ResolutionStrategy::LatestWins)
        .await
        .unwrap();

    let history = fx.versions.version_history(&nav_key(), HistoryQuery::default()).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].created_by, "resolver-test");
}
