//! Multi-source data consistency engine for Concord.
//!
//! Keeps one logical view of entities that live in several independent data
//! sources (a local database, a remote API, a cache) and repairs it when the
//! sources drift apart.
//!
//! # Components
//!
//! - **VersionStore**: append-only per-entity version chain with a current
//!   pointer, rollback, comparison and multi-version merge
//! - **ConflictDetector**: timestamp, version, content-hash and rule-based
//!   detection across sources
//! - **ConflictResolver**: latest/earliest wins, field merge, trust-scored
//!   auto resolution and manual hand-off
//! - **IntegrityChecker**: per-source validation, repair and trust scores
//! - **OfflineChangeLedger**: local changes recorded while disconnected and
//!   replayed against sources on reconnection
//! - **SyncScheduler**: push/pull reconciliation cycles with pause/resume
//! - **MetricsAggregator**: consistency rates, trends and reports
//!
//! [`ConsistencyEngine`] wires these together and runs the periodic loops.
//!
//! # Example
//!
//! ```no_run
//! use concord_sync::{ConsistencyEngine, DetectionStrategy, EngineConfig, ResolutionStrategy};
//! use concord_sync::source::mock::MemorySource;
//! use std::sync::Arc;
//!
//! # async fn run() -> concord_sync::SyncResult<()> {
//! let engine = ConsistencyEngine::new(EngineConfig::development());
//! engine.register_source(Arc::new(MemorySource::new("local")));
//! engine.register_source(Arc::new(MemorySource::new("remote")));
//! engine.initialize().await?;
//!
//! for conflict in engine.detect_conflicts(DetectionStrategy::ContentHash).await? {
//!     engine
//!         .resolve_conflict(conflict.conflict_id, ResolutionStrategy::LatestWins)
//!         .await?;
//! }
//! engine.dispose().await;
//! # Ok(())
//! # }
//! ```

mod config;
mod conflict;
mod detector;
mod engine;
mod error;
mod events;
mod integrity;
mod ledger;
mod merge;
mod metrics;
mod resolver;
mod rules;
mod scheduler;
pub mod source;
mod state;
mod ticker;
mod version;

pub use config::EngineConfig;
pub use conflict::{
    CompetingValue, ConflictRegistry, ConflictResolutionResult, ConflictSeverity, ConflictState,
    ConflictType, DataConflict, ResolutionAction, ResolvingGuard, TrackedConflict,
};
pub use detector::{
    ConflictCheck, ConflictDetector, ConsistencyBatchResult, DetectionContext, DetectionStrategy,
    Finding, ItemConsistency,
};
pub use engine::{ConsistencyEngine, EngineTickers};
pub use error::{SyncError, SyncResult};
pub use events::EventBus;
pub use integrity::{
    IntegrityCheckType, IntegrityChecker, IntegrityIssue, IntegrityReport, IntegrityScope,
    IntegrityTrendPoint, IntegrityValidation, IssueType, RepairMethod, RepairOutcome,
    RepairSummary, SourceIntegrityStats,
};
pub use ledger::{
    CacheStats, ChangeFailure, ChangeType, CleanupResult, NewDataChange, OFFLINE_CHANGES_NAMESPACE,
    OfflineChangeLedger, OfflineDataChange, OfflineSyncResult, OfflineSyncStatus,
};
pub use merge::{
    FieldConflict, FieldMerger, FieldValue, MergeCandidate, MergeOutcome, MergeStrategy,
};
pub use metrics::{
    ConsistencyMetrics, ConsistencyReport, ConsistencyTrendPoint, MetricsAggregator, MetricsPeriod,
};
pub use resolver::{
    BatchResolutionResult, ConflictResolver, Decision, ResolutionPolicy, ResolutionPreview,
    ResolutionStrategy,
};
pub use rules::{
    ConsistencyRule, RuleAction, RuleActionType, RuleCondition, RuleType, prepare_rules,
};
pub use scheduler::{
    ForceSyncResult, SchedulerParts, SchedulerSettings, SyncChange, SyncChangeKind,
    SyncCycleResult, SyncDirection, SyncScheduler, SyncScope,
};
pub use source::{
    DataSource, HealthyRouter, RouteOp, SourceHealth, SourceRecord, SourceRouter, SourceSet,
    read_all,
};
pub use state::{SyncState, SyncStatus, SyncStatusReport};
pub use ticker::{CancellationFlag, IntervalTicker, ManualTicker, ManualTickerHandle, Ticker};
pub use version::{
    DataVersion, FieldDifference, HistoryQuery, MergeResult, RollbackResult, VERSIONS_NAMESPACE,
    VersionComparison, VersionMetadata, VersionStore, VersionType,
};

pub use concord_types::{ChangeId, ConflictId, ItemKey, SourceId, Timestamp, VersionId};
