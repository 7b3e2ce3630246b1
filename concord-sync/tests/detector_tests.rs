//! Tests for conflict detection strategies, rules and item agreement checks.

use concord_storage::MemoryBackend;
use concord_sync::source::mock::MemorySource;
use concord_sync::{
    CancellationFlag, ConflictDetector, ConflictRegistry, ConflictSeverity, ConflictType,
    ConsistencyRule, DataSource, DetectionStrategy, EventBus, MetricsAggregator, MetricsPeriod,
    RuleActionType, SyncError, VersionStore,
};
use concord_types::{Clock, ItemKey, ManualClock, SourceId, Timestamp};
use pretty_assertions::assert_eq;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;

struct Fixture {
    detector: ConflictDetector,
    registry: Arc<ConflictRegistry>,
    versions: Arc<VersionStore>,
    events: Arc<EventBus>,
    metrics: Arc<MetricsAggregator>,
    local: Arc<MemorySource>,
    remote: Arc<MemorySource>,
    cancel: CancellationFlag,
}

impl Fixture {
    fn new(tolerance_ms: u64) -> Self {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(Timestamp::from_millis(10_000)));
        let registry = Arc::new(ConflictRegistry::new(100));
        let backend = Arc::new(MemoryBackend::new());
        let versions = Arc::new(VersionStore::new(backend, clock.clone(), 100));
        let events = Arc::new(EventBus::new());
        let metrics = Arc::new(MetricsAggregator::new(clock.clone()));
        let cancel = CancellationFlag::new();
        let detector = ConflictDetector::new(
            registry.clone(),
            versions.clone(),
            events.clone(),
            metrics.clone(),
            clock.clone(),
            Duration::from_millis(tolerance_ms),
            cancel.clone(),
        );
        Self {
            detector,
            registry,
            versions,
            events,
            metrics,
            local: Arc::new(MemorySource::with_clock("local", clock.clone())),
            remote: Arc::new(MemorySource::with_clock("remote", clock)),
            cancel,
        }
    }

    fn sources(&self) -> Vec<Arc<dyn DataSource>> {
        vec![self.local.clone(), self.remote.clone()]
    }

    fn seed(&self, key: &ItemKey, local: (Value, u64, u64), remote: (Value, u64, u64)) {
        self.local
            .insert(key.clone(), local.0, Timestamp::from_millis(local.1), local.2);
        self.remote
            .insert(key.clone(), remote.0, Timestamp::from_millis(remote.1), remote.2);
    }
}

fn nav_key() -> ItemKey {
    ItemKey::new("fund", "NAV-1").unwrap()
}

fn seed_nav(fx: &Fixture) {
    fx.seed(
        &nav_key(),
        (json!({"nav": 1.2345}), 100, 1),
        (json!({"nav": 1.2399}), 105, 1),
    );
}

// ── Strategies ───────────────────────────────────────────────────

#[tokio::test]
async fn timestamp_divergence_beyond_tolerance_is_flagged() {
    let fx = Fixture::new(4);
    seed_nav(&fx);

    let conflicts = fx
        .detector
        .detect_conflicts(&fx.sources(), DetectionStrategy::TimestampBased)
        .await
        .unwrap();

    assert_eq!(conflicts.len(), 1);
    let conflict = &conflicts[0];
    assert_eq!(conflict.item, nav_key());
    assert_eq!(conflict.conflict_type, ConflictType::TimestampDivergence);
    assert_eq!(conflict.severity, ConflictSeverity::Medium);
    assert_eq!(conflict.detection_strategy, DetectionStrategy::TimestampBased);
    assert_eq!(conflict.competing_values.len(), 2);

    let sources: Vec<&str> = conflict
        .competing_values
        .iter()
        .map(|v| v.source_id.as_str())
        .collect();
    assert!(sources.contains(&"local") && sources.contains(&"remote"));
    assert!(fx.registry.is_active(conflict.conflict_id).await);
}

#[tokio::test]
async fn timestamp_spread_within_tolerance_is_ignored() {
    let fx = Fixture::new(10);
    seed_nav(&fx);

    let conflicts = fx
        .detector
        .detect_conflicts(&fx.sources(), DetectionStrategy::TimestampBased)
        .await
        .unwrap();
    assert!(conflicts.is_empty());
}

#[tokio::test]
async fn far_apart_timestamps_are_high_severity() {
    let fx = Fixture::new(4);
    fx.seed(&nav_key(), (json!(1), 100, 1), (json!(2), 200, 1));

    let conflicts = fx
        .detector
        .detect_conflicts(&fx.sources(), DetectionStrategy::TimestampBased)
        .await
        .unwrap();
    assert_eq!(conflicts[0].severity, ConflictSeverity::High);
}

#[tokio::test]
async fn equal_content_never_conflicts() {
    let fx = Fixture::new(0);
    fx.seed(&nav_key(), (json!({"nav": 1}), 100, 1), (json!({"nav": 1}), 900, 7));

    for strategy in [
        DetectionStrategy::TimestampBased,
        DetectionStrategy::VersionBased,
        DetectionStrategy::ContentHash,
    ] {
        let conflicts = fx.detector.detect_conflicts(&fx.sources(), strategy).await.unwrap();
        assert!(conflicts.is_empty(), "{strategy:?}");
    }
}

#[tokio::test]
async fn version_based_distinguishes_forks_from_lag() {
    let fx = Fixture::new(0);
    let lagging = ItemKey::new("fund", "lag").unwrap();
    let forked = ItemKey::new("fund", "fork").unwrap();
    fx.seed(&lagging, (json!(1), 100, 1), (json!(2), 100, 2));
    fx.seed(&forked, (json!(1), 100, 3), (json!(2), 100, 3));

    let conflicts = fx
        .detector
        .detect_conflicts(&fx.sources(), DetectionStrategy::VersionBased)
        .await
        .unwrap();

    assert_eq!(conflicts.len(), 2);
    let severity_of = |key: &ItemKey| {
        conflicts
            .iter()
            .find(|c| &c.item == key)
            .map(|c| c.severity)
            .unwrap()
    };
    assert_eq!(severity_of(&lagging), ConflictSeverity::Medium);
    assert_eq!(severity_of(&forked), ConflictSeverity::High);
    assert!(conflicts.iter().all(|c| c.conflict_type == ConflictType::VersionDivergence));
}

#[tokio::test]
async fn version_based_blames_the_source_that_left_the_recorded_version() {
    let fx = Fixture::new(0);
    fx.versions
        .create_version(&nav_key(), json!({"nav": 1}), "test", None)
        .await
        .unwrap();
    // Same revision counter on both sides, so only the lineage tells them apart.
    fx.seed(&nav_key(), (json!({"nav": 1}), 100, 4), (json!({"nav": 2}), 100, 4));

    let conflicts = fx
        .detector
        .detect_conflicts(&fx.sources(), DetectionStrategy::VersionBased)
        .await
        .unwrap();

    assert_eq!(conflicts.len(), 1);
    let conflict = &conflicts[0];
    assert_eq!(conflict.conflict_type, ConflictType::VersionDivergence);
    assert_eq!(conflict.severity, ConflictSeverity::Medium);
    assert!(conflict.description.contains("remote"), "{}", conflict.description);
    assert!(!conflict.description.contains("local"), "{}", conflict.description);
}

#[tokio::test]
async fn version_based_treats_all_sources_leaving_the_lineage_as_a_fork() {
    let fx = Fixture::new(0);
    fx.versions
        .create_version(&nav_key(), json!({"nav": 1}), "test", None)
        .await
        .unwrap();
    fx.seed(&nav_key(), (json!({"nav": 2}), 100, 1), (json!({"nav": 3}), 100, 2));

    let conflicts = fx
        .detector
        .detect_conflicts(&fx.sources(), DetectionStrategy::VersionBased)
        .await
        .unwrap();

    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].severity, ConflictSeverity::High);
}

#[tokio::test]
async fn content_hash_catches_silent_divergence() {
    let fx = Fixture::new(1_000);
    fx.seed(&nav_key(), (json!({"nav": 1.0}), 500, 1), (json!({"nav": 1.1}), 500, 1));

    let conflicts = fx
        .detector
        .detect_conflicts(&fx.sources(), DetectionStrategy::ContentHash)
        .await
        .unwrap();

    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].conflict_type, ConflictType::ContentMismatch);
    assert_eq!(conflicts[0].severity, ConflictSeverity::High);
}

#[tokio::test]
async fn stale_reported_checksums_are_recomputed() {
    let fx = Fixture::new(0);
    let mut record =
        concord_sync::SourceRecord::new(json!({"nav": 2}), Timestamp::from_millis(1), 1);
    record.checksum = "bogus".into();
    fx.local.insert_raw(nav_key(), record);
    fx.remote.insert(nav_key(), json!({"nav": 2}), Timestamp::from_millis(1), 1);

    let conflicts = fx
        .detector
        .detect_conflicts(&fx.sources(), DetectionStrategy::ContentHash)
        .await
        .unwrap();
    assert!(conflicts.is_empty());
}

#[tokio::test]
async fn keys_on_a_single_source_are_not_compared() {
    let fx = Fixture::new(0);
    fx.local.insert(nav_key(), json!(1), Timestamp::from_millis(1), 1);

    let conflicts = fx
        .detector
        .detect_conflicts(&fx.sources(), DetectionStrategy::ContentHash)
        .await
        .unwrap();
    assert!(conflicts.is_empty());
}

// ── Registry and events ──────────────────────────────────────────

#[tokio::test]
async fn detection_publishes_and_records() {
    let fx = Fixture::new(4);
    seed_nav(&fx);
    let mut rx = fx.events.subscribe_conflicts().unwrap();

    let conflicts = fx
        .detector
        .detect_conflicts(&fx.sources(), DetectionStrategy::ContentHash)
        .await
        .unwrap();

    let received = rx.recv().await.unwrap();
    assert_eq!(received, conflicts[0]);

    let metrics = fx
        .metrics
        .metrics(MetricsPeriod::last(Duration::from_secs(3600), Timestamp::from_millis(10_000)));
    assert_eq!(metrics.conflicts_detected, 1);
}

#[tokio::test]
async fn detection_records_a_check_for_every_compared_key() {
    let fx = Fixture::new(0);
    seed_nav(&fx);
    let agreeing = ItemKey::new("fund", "same").unwrap();
    fx.seed(&agreeing, (json!(1), 100, 1), (json!(1), 100, 1));

    fx.detector
        .detect_conflicts(&fx.sources(), DetectionStrategy::ContentHash)
        .await
        .unwrap();

    let metrics = fx
        .metrics
        .metrics(MetricsPeriod::last(Duration::from_secs(3600), Timestamp::from_millis(10_000)));
    assert_eq!(metrics.total_checks, 2);
    assert_eq!(metrics.overall_consistency_rate, 0.5);
}

#[tokio::test]
async fn existing_active_conflict_is_not_duplicated() {
    let fx = Fixture::new(4);
    seed_nav(&fx);

    let first = fx
        .detector
        .detect_conflicts(&fx.sources(), DetectionStrategy::ContentHash)
        .await
        .unwrap();
    let second = fx
        .detector
        .detect_conflicts(&fx.sources(), DetectionStrategy::TimestampBased)
        .await
        .unwrap();

    assert_eq!(first.len(), 1);
    assert!(second.is_empty());
    assert_eq!(fx.registry.active_count().await, 1);
}

#[tokio::test]
async fn every_subscriber_sees_each_conflict() {
    let fx = Fixture::new(4);
    seed_nav(&fx);
    let mut a = fx.events.subscribe_conflicts().unwrap();
    let mut b = fx.events.subscribe_conflicts().unwrap();

    fx.detector
        .detect_conflicts(&fx.sources(), DetectionStrategy::ContentHash)
        .await
        .unwrap();

    assert_eq!(a.recv().await.unwrap().item, nav_key());
    assert_eq!(b.recv().await.unwrap().item, nav_key());
}

#[tokio::test]
async fn cancelled_detection_reports_cancellation() {
    let fx = Fixture::new(4);
    seed_nav(&fx);
    fx.cancel.cancel();

    let err = fx
        .detector
        .detect_conflicts(&fx.sources(), DetectionStrategy::ContentHash)
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::Cancelled));
    assert_eq!(fx.registry.active_count().await, 0);
}

// ── Rules ────────────────────────────────────────────────────────

#[tokio::test]
async fn field_equals_rule_flags_critical_field() {
    let fx = Fixture::new(0);
    fx.seed(
        &nav_key(),
        (json!({"nav": 1.2345, "note": "a"}), 1, 1),
        (json!({"nav": 1.2399, "note": "b"}), 1, 1),
    );
    fx.detector
        .configure_rules(vec![
            ConsistencyRule::field_equals("nav-equal", "nav").for_item_type("fund"),
        ])
        .await
        .unwrap();

    let conflicts = fx
        .detector
        .detect_conflicts(&fx.sources(), DetectionStrategy::RuleBased)
        .await
        .unwrap();

    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].conflict_type, ConflictType::RuleViolation);
    assert_eq!(conflicts[0].rule_id.as_deref(), Some("nav-equal"));
    assert_eq!(conflicts[0].severity, ConflictSeverity::High);
}

#[tokio::test]
async fn tolerance_and_item_type_limit_rules() {
    let fx = Fixture::new(0);
    let other = ItemKey::new("holding", "H-1").unwrap();
    fx.seed(&nav_key(), (json!({"nav": 1.2345}), 1, 1), (json!({"nav": 1.2399}), 1, 1));
    fx.seed(&other, (json!({"nav": 1}), 1, 1), (json!({"nav": 2}), 1, 1));

    let mut rule = ConsistencyRule::field_equals("nav-close", "nav").for_item_type("fund");
    rule.condition.parameters.insert("tolerance".into(), json!(0.01));
    fx.detector.configure_rules(vec![rule]).await.unwrap();

    let conflicts = fx
        .detector
        .detect_conflicts(&fx.sources(), DetectionStrategy::RuleBased)
        .await
        .unwrap();
    assert!(conflicts.is_empty());
}

#[tokio::test]
async fn log_rules_never_raise_conflicts() {
    let fx = Fixture::new(0);
    seed_nav(&fx);
    let mut rule = ConsistencyRule::field_equals("nav-log", "nav");
    rule.action.action_type = RuleActionType::Log;
    fx.detector.configure_rules(vec![rule]).await.unwrap();

    let conflicts = fx
        .detector
        .detect_conflicts(&fx.sources(), DetectionStrategy::RuleBased)
        .await
        .unwrap();
    assert!(conflicts.is_empty());
}

#[tokio::test]
async fn invalid_rule_sets_are_rejected_whole() {
    let fx = Fixture::new(0);
    fx.detector
        .configure_rules(vec![ConsistencyRule::field_equals("keep", "nav")])
        .await
        .unwrap();

    let mut bad = ConsistencyRule::field_equals("bad", "nav");
    bad.condition.expression = "sql".into();
    let err = fx
        .detector
        .configure_rules(vec![ConsistencyRule::field_equals("new", "nav"), bad])
        .await
        .unwrap_err();

    assert!(matches!(err, SyncError::InvalidArgument(_)));
    let ids: Vec<String> = fx.detector.rules().await.into_iter().map(|r| r.rule_id).collect();
    assert_eq!(ids, vec!["keep".to_string()]);
}

// ── Item agreement ───────────────────────────────────────────────

#[tokio::test]
async fn batch_consistency_isolates_failures() {
    let fx = Fixture::new(0);
    let agreeing = ItemKey::new("fund", "same").unwrap();
    fx.seed(&agreeing, (json!(1), 1, 1), (json!(1), 2, 1));
    seed_nav(&fx);

    let result = fx
        .detector
        .validate_items_consistency_batch(&fx.sources(), &[agreeing.clone(), nav_key()])
        .await;
    assert_eq!(result.consistent, 1);
    assert_eq!(result.inconsistent, 1);
    assert_eq!(result.failed, 0);
    assert!(result.partial_failure().is_none());

    fx.remote.set_read_failure(true);
    let result = fx
        .detector
        .validate_items_consistency_batch(&fx.sources(), &[agreeing])
        .await;
    assert_eq!(result.failed, 1);
    assert!(matches!(
        result.partial_failure(),
        Some(SyncError::PartialFailure { failed: 1, total: 1 })
    ));
}

#[tokio::test]
async fn item_consistency_counts_sources() {
    let fx = Fixture::new(0);
    seed_nav(&fx);

    let report = fx.detector.check_item_consistency(&fx.sources(), &nav_key()).await;
    assert!(!report.consistent);
    assert_eq!(report.sources_checked, 2);
    assert_eq!(report.distinct_values, 2);

    let per_source = fx
        .metrics
        .metrics(MetricsPeriod::last(Duration::from_secs(60), Timestamp::from_millis(10_000)))
        .per_source;
    assert_eq!(per_source.get(&SourceId::new("local")), Some(&0.0));
}
