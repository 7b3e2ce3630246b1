//! Tests for integrity validation, repair and reporting.

use concord_storage::MemoryBackend;
use concord_sync::source::mock::MemorySource;
use concord_sync::{
    CancellationFlag, HealthyRouter, IntegrityCheckType, IntegrityChecker, IntegrityScope,
    IssueType, RepairMethod, SourceHealth, SourceRecord, SourceSet, SyncError, VersionStore,
};
use concord_types::{Clock, ItemKey, ManualClock, SourceId, Timestamp};
use pretty_assertions::assert_eq;
use serde_json::{Value, json};
use std::sync::Arc;

struct Fixture {
    versions: Arc<VersionStore>,
    checker: IntegrityChecker,
    cancel: CancellationFlag,
    primary: Arc<MemorySource>,
    replica: Arc<MemorySource>,
}

impl Fixture {
    fn new() -> Self {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(Timestamp::from_millis(1_000)));
        let sources = Arc::new(SourceSet::new(Arc::new(HealthyRouter)));
        let primary = Arc::new(MemorySource::with_clock("primary", clock.clone()));
        let replica = Arc::new(MemorySource::with_clock("replica", clock.clone()));
        sources.register(primary.clone());
        sources.register(replica.clone());
        let backend = Arc::new(MemoryBackend::new());
        let versions = Arc::new(VersionStore::new(backend, clock.clone(), 20));
        let cancel = CancellationFlag::new();
        let checker = IntegrityChecker::new(sources, versions.clone(), clock, cancel.clone());
        Self {
            versions,
            checker,
            cancel,
            primary,
            replica,
        }
    }

    fn put(&self, source: &MemorySource, id: &str, payload: Value) {
        source.insert(key(id), payload, Timestamp::from_millis(500), 1);
    }

    fn corrupt(&self, source: &MemorySource, id: &str, payload: Value) {
        source.insert_raw(
            key(id),
            SourceRecord {
                payload,
                updated_at: Timestamp::from_millis(500),
                version: 1,
                checksum: "0000".to_string(),
            },
        );
    }
}

fn key(id: &str) -> ItemKey {
    ItemKey::new("holding", id).unwrap()
}

fn only(ids: &[&str]) -> IntegrityScope {
    IntegrityScope {
        source_ids: Some(ids.iter().map(|id| SourceId::from(*id)).collect()),
        ..IntegrityScope::default()
    }
}

#[tokio::test]
async fn intact_sources_validate_cleanly() {
    let fx = Fixture::new();
    for id in ["h1", "h2"] {
        fx.put(&fx.primary, id, json!({ "qty": 10 }));
        fx.put(&fx.replica, id, json!({ "qty": 10 }));
    }

    let validation = fx
        .checker
        .validate_data_integrity(IntegrityCheckType::Comprehensive, None)
        .await
        .unwrap();

    assert!(validation.is_valid);
    assert_eq!(validation.total_checked, 4);
    assert_eq!(validation.intact_count, 4);
    assert!(validation.issues.is_empty());
}

#[tokio::test]
async fn quick_check_flags_bad_checksums_and_empty_payloads() {
    let fx = Fixture::new();
    fx.put(&fx.primary, "ok", json!({ "qty": 1 }));
    fx.corrupt(&fx.primary, "bad", json!({ "qty": 2 }));
    fx.put(&fx.primary, "empty", json!({}));
    // Missing items are not a quick-check concern.
    fx.put(&fx.replica, "only-here", json!({ "qty": 3 }));

    let validation = fx
        .checker
        .validate_data_integrity(IntegrityCheckType::Quick, None)
        .await
        .unwrap();

    assert!(!validation.is_valid);
    assert_eq!(validation.total_checked, 4);
    let mut found: Vec<(IssueType, RepairMethod)> = validation
        .issues
        .iter()
        .map(|i| (i.issue_type, i.suggested_repair))
        .collect();
    found.sort_by_key(|(t, _)| format!("{t:?}"));
    assert_eq!(
        found,
        vec![
            (IssueType::ChecksumMismatch, RepairMethod::RecomputeChecksum),
            (IssueType::EmptyPayload, RepairMethod::RestoreFromVersion),
        ]
    );
}

#[tokio::test]
async fn comprehensive_check_finds_missing_items() {
    let fx = Fixture::new();
    fx.put(&fx.primary, "h1", json!({ "qty": 1 }));
    fx.versions
        .create_version(&key("h2"), json!({ "qty": 2 }), "test", None)
        .await
        .unwrap();

    let validation = fx
        .checker
        .validate_data_integrity(IntegrityCheckType::Comprehensive, None)
        .await
        .unwrap();

    // h1 missing from the replica, h2 missing from both.
    let missing: Vec<_> = validation
        .issues
        .iter()
        .filter(|i| i.issue_type == IssueType::MissingItem)
        .collect();
    assert_eq!(missing.len(), 3);
    assert!(missing.iter().all(|i| i.suggested_repair == RepairMethod::Refetch));
    assert_eq!(validation.total_checked, 4);
    assert_eq!(validation.intact_count, 1);
}

#[tokio::test]
async fn deep_check_verifies_version_chains() {
    let fx = Fixture::new();
    for n in 1..=3 {
        fx.versions
            .create_version(&key("h1"), json!({ "qty": n }), "test", None)
            .await
            .unwrap();
    }
    fx.put(&fx.primary, "h1", json!({ "qty": 3 }));
    fx.put(&fx.replica, "h1", json!({ "qty": 3 }));

    let validation = fx
        .checker
        .validate_data_integrity(IntegrityCheckType::Deep, None)
        .await
        .unwrap();

    assert!(validation.is_valid);
    // Two source reads plus one chain.
    assert_eq!(validation.total_checked, 3);
    assert_eq!(validation.check_type, IntegrityCheckType::Deep);
}

#[tokio::test]
async fn selective_check_needs_and_honours_explicit_keys() {
    let fx = Fixture::new();
    fx.corrupt(&fx.primary, "bad", json!(1));
    fx.put(&fx.primary, "good", json!(2));
    fx.put(&fx.replica, "good", json!(2));

    let missing_keys = fx
        .checker
        .validate_data_integrity(IntegrityCheckType::Selective, None)
        .await;
    assert!(matches!(missing_keys, Err(SyncError::InvalidArgument(_))));

    let scope = IntegrityScope {
        keys: Some(vec![key("good")]),
        ..IntegrityScope::default()
    };
    let validation = fx
        .checker
        .validate_data_integrity(IntegrityCheckType::Selective, Some(scope))
        .await
        .unwrap();
    assert!(validation.is_valid);
    assert_eq!(validation.total_checked, 2);
}

#[tokio::test]
async fn scope_limits_sources_and_item_types() {
    let fx = Fixture::new();
    fx.corrupt(&fx.replica, "bad", json!(1));
    fx.primary
        .insert(ItemKey::new("trade", "t1").unwrap(), json!(1), Timestamp::from_millis(1), 1);

    let primary_only = fx
        .checker
        .validate_data_integrity(IntegrityCheckType::Quick, Some(only(&["primary"])))
        .await
        .unwrap();
    assert!(primary_only.is_valid);

    let holdings = IntegrityScope {
        item_types: Some(vec!["holding".to_string()]),
        ..IntegrityScope::default()
    };
    let validation = fx
        .checker
        .validate_data_integrity(IntegrityCheckType::Quick, Some(holdings))
        .await
        .unwrap();
    assert_eq!(validation.total_checked, 1);
    assert_eq!(validation.issues.len(), 1);
}

#[tokio::test]
async fn unreachable_source_is_reported_not_fatal() {
    let fx = Fixture::new();
    fx.put(&fx.primary, "h1", json!(1));
    fx.replica.set_health(SourceHealth::Unreachable);

    let validation = fx
        .checker
        .validate_data_integrity(IntegrityCheckType::Comprehensive, None)
        .await
        .unwrap();

    let issue = validation
        .issues
        .iter()
        .find(|i| i.issue_type == IssueType::SourceUnreachable)
        .unwrap();
    assert_eq!(issue.source_id, Some(SourceId::from("replica")));
    assert_eq!(issue.suggested_repair, RepairMethod::Unrepairable);

    let report = fx.checker.integrity_report(None);
    let replica = report.sources.iter().find(|s| s.source_id == SourceId::from("replica")).unwrap();
    assert!(!replica.reachable);
    assert!(report.recommendations.iter().any(|r| r.contains("connectivity")));
}

#[tokio::test]
async fn read_failures_become_issues() {
    let fx = Fixture::new();
    fx.put(&fx.primary, "h1", json!(1));
    fx.primary.set_read_failure(true);

    let validation = fx
        .checker
        .validate_data_integrity(IntegrityCheckType::Quick, Some(only(&["primary"])))
        .await
        .unwrap();

    assert_eq!(validation.issues.len(), 1);
    assert_eq!(validation.issues[0].issue_type, IssueType::ReadFailed);
}

#[tokio::test]
async fn cancelled_validation_stops() {
    let fx = Fixture::new();
    fx.put(&fx.primary, "h1", json!(1));
    fx.cancel.cancel();

    let result = fx
        .checker
        .validate_data_integrity(IntegrityCheckType::Quick, None)
        .await;
    assert!(matches!(result, Err(SyncError::Cancelled)));
}

// ── Repair ───────────────────────────────────────────────────────

#[tokio::test]
async fn repairs_use_the_suggested_method() {
    let fx = Fixture::new();
    fx.corrupt(&fx.primary, "bad", json!({ "qty": 7 }));
    fx.put(&fx.primary, "empty", Value::Null);
    fx.versions
        .create_version(&key("empty"), json!({ "qty": 5 }), "test", None)
        .await
        .unwrap();
    fx.put(&fx.primary, "lonely", json!({ "qty": 9 }));

    let validation = fx
        .checker
        .validate_data_integrity(IntegrityCheckType::Comprehensive, None)
        .await
        .unwrap();
    let summary = fx.checker.repair_integrity_issues(&validation.issues).await.unwrap();

    assert_eq!(summary.failed_count, 0, "{:?}", summary.results);
    assert_eq!(summary.repaired_count, validation.issues.len());

    assert!(fx.primary.record(&key("bad")).unwrap().checksum_is_valid());
    assert_eq!(fx.primary.record(&key("empty")).unwrap().payload, json!({ "qty": 5 }));
    assert_eq!(fx.replica.record(&key("lonely")).unwrap().payload, json!({ "qty": 9 }));
    assert_eq!(fx.replica.record(&key("empty")).unwrap().payload, json!({ "qty": 5 }));

    let recheck = fx
        .checker
        .validate_data_integrity(IntegrityCheckType::Comprehensive, None)
        .await
        .unwrap();
    assert!(recheck.is_valid, "{:?}", recheck.issues);
}

#[tokio::test]
async fn refetch_skips_corrupt_donors() {
    let fx = Fixture::new();
    fx.corrupt(&fx.primary, "h1", json!({ "qty": 1 }));

    let scope = IntegrityScope {
        keys: Some(vec![key("h1")]),
        ..only(&["replica"])
    };
    let validation = fx
        .checker
        .validate_data_integrity(IntegrityCheckType::Selective, Some(scope))
        .await
        .unwrap();
    assert_eq!(validation.issues[0].issue_type, IssueType::MissingItem);
    let summary = fx.checker.repair_integrity_issues(&validation.issues).await.unwrap();

    assert_eq!(summary.repaired_count, 0);
    assert_eq!(summary.failed_count, 1);
    assert!(summary.results[0].error.as_deref().unwrap().contains("no intact copy"));
    assert!(fx.replica.is_empty());
}

#[tokio::test]
async fn unrepairable_issues_fail_individually() {
    let fx = Fixture::new();
    fx.put(&fx.primary, "h1", json!(1));
    fx.replica.set_health(SourceHealth::Unreachable);
    let validation = fx
        .checker
        .validate_data_integrity(IntegrityCheckType::Quick, None)
        .await
        .unwrap();

    let summary = fx.checker.repair_integrity_issues(&validation.issues).await.unwrap();

    assert_eq!(summary.failed_count, 1);
    assert_eq!(summary.results[0].method, RepairMethod::Unrepairable);
    assert!(!summary.results[0].success);
}

// ── Reporting ────────────────────────────────────────────────────

#[tokio::test]
async fn trust_scores_follow_integrity_rates() {
    let fx = Fixture::new();
    fx.put(&fx.primary, "h1", json!(1));
    fx.put(&fx.primary, "h2", json!(2));
    fx.put(&fx.replica, "h1", json!(1));
    fx.corrupt(&fx.replica, "h2", json!(2));

    fx.checker
        .validate_data_integrity(IntegrityCheckType::Quick, None)
        .await
        .unwrap();
    let scores = fx.checker.trust_scores();

    assert_eq!(scores[&SourceId::from("primary")], 1.0);
    assert_eq!(scores[&SourceId::from("replica")], 0.5);
}

#[tokio::test]
async fn report_recommends_action_for_low_integrity() {
    let fx = Fixture::new();
    fx.put(&fx.primary, "h1", json!(1));
    fx.put(&fx.replica, "h1", json!(1));
    fx.checker
        .validate_data_integrity(IntegrityCheckType::Quick, None)
        .await
        .unwrap();

    let healthy = fx.checker.integrity_report(None);
    assert_eq!(healthy.overall_rate, 1.0);
    assert_eq!(healthy.recommendations, vec!["No action needed".to_string()]);

    fx.corrupt(&fx.replica, "h1", json!(1));
    fx.checker
        .validate_data_integrity(IntegrityCheckType::Quick, None)
        .await
        .unwrap();

    let degraded = fx.checker.integrity_report(None);
    assert_eq!(degraded.overall_rate, 0.5);
    assert_eq!(degraded.trend.len(), 2);
    assert!(degraded.recommendations.iter().any(|r| r.contains("Overall integrity")));
    assert!(degraded.recommendations.iter().any(|r| r.contains("Source replica")));
    assert!(degraded.recommendations.iter().any(|r| r.contains("dropped")));

    let scoped = fx.checker.integrity_report(Some(only(&["primary"])));
    assert_eq!(scoped.sources.len(), 1);
    assert_eq!(scoped.overall_rate, 1.0);
}

#[tokio::test]
async fn clear_drops_stats_and_trend() {
    let fx = Fixture::new();
    fx.put(&fx.primary, "h1", json!(1));
    fx.checker
        .validate_data_integrity(IntegrityCheckType::Quick, None)
        .await
        .unwrap();

    fx.checker.clear();

    assert!(fx.checker.trust_scores().is_empty());
    let report = fx.checker.integrity_report(None);
    assert!(report.sources.is_empty());
    assert!(report.trend.is_empty());
}
