//! The consistency engine facade.
//!
//! [`ConsistencyEngine`] owns every component, wires them to the shared
//! sources, clock and backend, and runs the three periodic loops
//! (consistency check, metrics refresh, sync). All operations fail with
//! [`SyncError::NotInitialized`] until [`ConsistencyEngine::initialize`] has
//! run, and again after [`ConsistencyEngine::dispose`].

use crate::config::EngineConfig;
use crate::conflict::{ConflictRegistry, ConflictResolutionResult, DataConflict};
use crate::detector::{ConflictDetector, ConsistencyBatchResult, DetectionStrategy, ItemConsistency};
use crate::error::{SyncError, SyncResult};
use crate::events::EventBus;
use crate::integrity::{
    IntegrityCheckType, IntegrityChecker, IntegrityIssue, IntegrityReport, IntegrityScope,
    IntegrityValidation, RepairSummary,
};
use crate::ledger::{
    CacheStats, CleanupResult, NewDataChange, OfflineChangeLedger, OfflineDataChange,
    OfflineSyncResult, OfflineSyncStatus,
};
use crate::merge::MergeStrategy;
use crate::metrics::{ConsistencyMetrics, ConsistencyReport, MetricsAggregator, MetricsPeriod};
use crate::resolver::{
    BatchResolutionResult, ConflictResolver, ResolutionPreview, ResolutionStrategy,
};
use crate::rules::ConsistencyRule;
use crate::scheduler::{
    ForceSyncResult, SchedulerParts, SchedulerSettings, SyncCycleResult, SyncDirection,
    SyncScheduler, SyncScope,
};
use crate::source::{DataSource, HealthyRouter, RouteOp, SourceRouter, SourceSet};
use crate::state::SyncStatusReport;
use crate::ticker::{CancellationFlag, IntervalTicker, Ticker};
use crate::version::{
    DataVersion, HistoryQuery, MergeResult, RollbackResult, VersionComparison, VersionMetadata,
    VersionStore,
};
use concord_storage::{KvBackend, MemoryBackend};
use concord_types::{ChangeId, Clock, ConflictId, ItemKey, SourceId, SystemClock, VersionId};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{RwLock, broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Tickers for the three periodic loops.
pub struct EngineTickers {
    pub consistency_check: Box<dyn Ticker>,
    pub metrics_update: Box<dyn Ticker>,
    pub sync: Box<dyn Ticker>,
}

impl EngineTickers {
    /// Wall-clock tickers at the configured intervals.
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            consistency_check: Box::new(IntervalTicker::new(config.consistency_check_interval())),
            metrics_update: Box::new(IntervalTicker::new(config.metrics_update_interval())),
            sync: Box::new(IntervalTicker::new(config.sync_interval())),
        }
    }
}

/// Components that exist between `initialize` and `dispose`.
struct Runtime {
    versions: Arc<VersionStore>,
    registry: Arc<ConflictRegistry>,
    detector: Arc<ConflictDetector>,
    resolver: Arc<ConflictResolver>,
    integrity: Arc<IntegrityChecker>,
    ledger: Arc<OfflineChangeLedger>,
    scheduler: Arc<SyncScheduler>,
    metrics: Arc<MetricsAggregator>,
    events: Arc<EventBus>,
    shutdown: watch::Sender<bool>,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

/// Multi-source data consistency engine.
pub struct ConsistencyEngine {
    config: EngineConfig,
    backend: Arc<dyn KvBackend>,
    clock: Arc<dyn Clock>,
    sources: Arc<SourceSet>,
    cancel: CancellationFlag,
    runtime: RwLock<Option<Arc<Runtime>>>,
}

impl ConsistencyEngine {
    /// Engine with an in-memory backend, the system clock and the
    /// health-based router. The backend outlives `dispose`.
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            backend: Arc::new(MemoryBackend::new()),
            clock: Arc::new(SystemClock),
            sources: Arc::new(SourceSet::new(Arc::new(HealthyRouter))),
            cancel: CancellationFlag::new(),
            runtime: RwLock::new(None),
        }
    }

    #[must_use]
    pub fn with_backend(mut self, backend: Arc<dyn KvBackend>) -> Self {
        self.backend = backend;
        self
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replaces the router. Sources registered so far are kept.
    #[must_use]
    pub fn with_router(mut self, router: Arc<dyn SourceRouter>) -> Self {
        let sources = SourceSet::new(router);
        for source in self.sources.all() {
            sources.register(source);
        }
        self.sources = Arc::new(sources);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Adds a source, replacing any with the same id. Registrations survive
    /// `dispose`.
    pub fn register_source(&self, source: Arc<dyn DataSource>) {
        info!("Registered source {}", source.id());
        self.sources.register(source);
    }

    pub fn sources(&self) -> Vec<Arc<dyn DataSource>> {
        self.sources.all()
    }

    pub async fn is_initialized(&self) -> bool {
        self.runtime.read().await.is_some()
    }

    /// Builds the components and starts the periodic loops on wall-clock
    /// tickers. Calling it again while initialized is a no-op.
    pub async fn initialize(&self) -> SyncResult<()> {
        self.initialize_with_tickers(EngineTickers::from_config(&self.config))
            .await
    }

    /// Same as [`initialize`](Self::initialize) with caller-supplied
    /// tickers.
    pub async fn initialize_with_tickers(&self, tickers: EngineTickers) -> SyncResult<()> {
        let mut slot = self.runtime.write().await;
        if slot.is_some() {
            debug!("Engine already initialized");
            return Ok(());
        }
        self.config.validate()?;
        self.cancel.reset();

        let runtime = Arc::new(self.build_runtime());
        let loaded = runtime.ledger.load().await?;
        self.spawn_loops(&runtime, tickers);
        *slot = Some(runtime);

        info!(
            "Consistency engine '{}' initialized ({} sources, {} offline changes loaded)",
            self.config.instance_name,
            self.sources.all().len(),
            loaded
        );
        Ok(())
    }

    fn build_runtime(&self) -> Runtime {
        let config = &self.config;
        let events = Arc::new(EventBus::new());
        let metrics = Arc::new(MetricsAggregator::new(self.clock.clone()));
        let registry = Arc::new(ConflictRegistry::new(config.max_active_conflicts));
        let versions = Arc::new(VersionStore::new(
            self.backend.clone(),
            self.clock.clone(),
            config.max_version_history,
        ));
        let detector = Arc::new(ConflictDetector::new(
            registry.clone(),
            versions.clone(),
            events.clone(),
            metrics.clone(),
            self.clock.clone(),
            config.timestamp_tolerance(),
            self.cancel.clone(),
        ));
        let integrity = Arc::new(IntegrityChecker::new(
            self.sources.clone(),
            versions.clone(),
            self.clock.clone(),
            self.cancel.clone(),
        ));
        let resolver = Arc::new(ConflictResolver::new(
            registry.clone(),
            versions.clone(),
            self.sources.clone(),
            integrity.clone(),
            metrics.clone(),
            self.clock.clone(),
            config.instance_name.clone(),
        ));
        let ledger = Arc::new(OfflineChangeLedger::new(
            self.backend.clone(),
            self.sources.clone(),
            self.clock.clone(),
            self.cancel.clone(),
            config.offline_resolution_strategy,
            config.offline_replay_delay(),
            config.offline_retention(),
        ));
        let scheduler = Arc::new(SyncScheduler::new(
            SchedulerParts {
                sources: self.sources.clone(),
                versions: versions.clone(),
                registry: registry.clone(),
                detector: detector.clone(),
                resolver: resolver.clone(),
                ledger: ledger.clone(),
                metrics: metrics.clone(),
                events: events.clone(),
                clock: self.clock.clone(),
                cancel: self.cancel.clone(),
            },
            SchedulerSettings {
                detection: config.default_detection_strategy,
                resolution: config.default_resolution_strategy,
                incremental_window: config.incremental_check_window(),
                created_by: config.instance_name.clone(),
            },
        ));
        let (shutdown, _) = watch::channel(false);

        Runtime {
            versions,
            registry,
            detector,
            resolver,
            integrity,
            ledger,
            scheduler,
            metrics,
            events,
            shutdown,
            tasks: std::sync::Mutex::new(Vec::new()),
        }
    }

    fn spawn_loops(&self, runtime: &Runtime, tickers: EngineTickers) {
        let mut tasks = Vec::with_capacity(3);

        let detector = runtime.detector.clone();
        let sources = self.sources.clone();
        let strategy = self.config.default_detection_strategy;
        tasks.push(spawn_loop(
            "consistency check",
            tickers.consistency_check,
            runtime.shutdown.subscribe(),
            move || {
                let detector = detector.clone();
                let sources = sources.clone();
                async move {
                    let readable = sources.route(RouteOp::Read, None);
                    let found = detector.detect_conflicts(&readable, strategy).await?;
                    if !found.is_empty() {
                        info!("Consistency check found {} new conflicts", found.len());
                    }
                    Ok::<(), SyncError>(())
                }
            },
        ));

        let metrics = runtime.metrics.clone();
        tasks.push(spawn_loop(
            "metrics update",
            tickers.metrics_update,
            runtime.shutdown.subscribe(),
            move || {
                let metrics = metrics.clone();
                async move {
                    let swept = metrics.sweep();
                    debug!("Metrics sweep evicted {} cached entries", swept);
                    Ok::<(), SyncError>(())
                }
            },
        ));

        let scheduler = runtime.scheduler.clone();
        tasks.push(spawn_loop(
            "sync",
            tickers.sync,
            runtime.shutdown.subscribe(),
            move || {
                let scheduler = scheduler.clone();
                async move { scheduler.run_scheduled().await.map(|_| ()) }
            },
        ));

        *runtime.tasks.lock().unwrap_or_else(|e| e.into_inner()) = tasks;
    }

    /// Stops the loops, closes event channels and drops in-memory state.
    ///
    /// In-memory state is what the runtime holds: active conflicts and their
    /// history, metrics observations, pauses, sync status and the caches in
    /// front of the backend. The backend is storage, even a
    /// [`MemoryBackend`], so persisted versions and offline changes stay in
    /// it and the next `initialize` reloads them. Disposing an uninitialized
    /// engine is a no-op.
    pub async fn dispose(&self) {
        let Some(runtime) = self.runtime.write().await.take() else {
            return;
        };
        self.cancel.cancel();
        let _ = runtime.shutdown.send(true);
        let tasks = std::mem::take(&mut *runtime.tasks.lock().unwrap_or_else(|e| e.into_inner()));
        for task in tasks {
            task.abort();
            let _ = task.await;
        }
        runtime.events.close();
        runtime.scheduler.reset().await;
        runtime.ledger.clear().await;
        runtime.integrity.clear();
        runtime.metrics.clear();
        info!("Consistency engine '{}' disposed", self.config.instance_name);
    }

    async fn runtime(&self) -> SyncResult<Arc<Runtime>> {
        self.runtime
            .read()
            .await
            .clone()
            .ok_or(SyncError::NotInitialized)
    }

    fn readable_sources(&self) -> Vec<Arc<dyn DataSource>> {
        self.sources.route(RouteOp::Read, None)
    }

    // ---- events ----

    pub async fn subscribe_conflicts(&self) -> SyncResult<broadcast::Receiver<DataConflict>> {
        self.runtime().await?.events.subscribe_conflicts()
    }

    pub async fn subscribe_sync_completed(
        &self,
    ) -> SyncResult<broadcast::Receiver<SyncCycleResult>> {
        self.runtime().await?.events.subscribe_sync_completed()
    }

    // ---- versions ----

    pub async fn create_version(
        &self,
        key: &ItemKey,
        payload: Value,
        metadata: Option<VersionMetadata>,
    ) -> SyncResult<DataVersion> {
        self.runtime()
            .await?
            .versions
            .create_version(key, payload, &self.config.instance_name, metadata)
            .await
    }

    pub async fn current_version(&self, key: &ItemKey) -> SyncResult<Option<DataVersion>> {
        self.runtime().await?.versions.current_version(key).await
    }

    pub async fn get_version(
        &self,
        key: &ItemKey,
        version_id: VersionId,
    ) -> SyncResult<DataVersion> {
        self.runtime().await?.versions.get_version(key, version_id).await
    }

    pub async fn version_history(
        &self,
        key: &ItemKey,
        query: HistoryQuery,
    ) -> SyncResult<Vec<DataVersion>> {
        self.runtime().await?.versions.version_history(key, query).await
    }

    pub async fn rollback_to_version(
        &self,
        key: &ItemKey,
        version_id: VersionId,
    ) -> SyncResult<RollbackResult> {
        self.runtime()
            .await?
            .versions
            .rollback_to_version(key, version_id, &self.config.instance_name)
            .await
    }

    pub async fn compare_versions(
        &self,
        key: &ItemKey,
        left: VersionId,
        right: VersionId,
    ) -> SyncResult<VersionComparison> {
        self.runtime().await?.versions.compare_versions(key, left, right).await
    }

    pub async fn merge_versions(
        &self,
        key: &ItemKey,
        version_ids: &[VersionId],
        strategy: MergeStrategy,
    ) -> SyncResult<MergeResult> {
        self.runtime()
            .await?
            .versions
            .merge_versions(key, version_ids, strategy, &self.config.instance_name)
            .await
    }

    // ---- detection ----

    /// Runs detection across all readable sources.
    pub async fn detect_conflicts(
        &self,
        strategy: DetectionStrategy,
    ) -> SyncResult<Vec<DataConflict>> {
        let runtime = self.runtime().await?;
        runtime
            .detector
            .detect_conflicts(&self.readable_sources(), strategy)
            .await
    }

    /// Runs detection for specific keys across all readable sources.
    pub async fn detect_conflicts_for(
        &self,
        keys: &[ItemKey],
        strategy: DetectionStrategy,
    ) -> SyncResult<Vec<DataConflict>> {
        let runtime = self.runtime().await?;
        runtime
            .detector
            .detect_conflicts_for(&self.readable_sources(), keys, strategy)
            .await
    }

    pub async fn check_item_consistency(&self, key: &ItemKey) -> SyncResult<ItemConsistency> {
        let runtime = self.runtime().await?;
        Ok(runtime
            .detector
            .check_item_consistency(&self.readable_sources(), key)
            .await)
    }

    pub async fn validate_items_consistency_batch(
        &self,
        keys: &[ItemKey],
    ) -> SyncResult<ConsistencyBatchResult> {
        let runtime = self.runtime().await?;
        Ok(runtime
            .detector
            .validate_items_consistency_batch(&self.readable_sources(), keys)
            .await)
    }

    /// Replaces the rule set. Returns the number of installed rules.
    pub async fn configure_consistency_rules(
        &self,
        rules: Vec<ConsistencyRule>,
    ) -> SyncResult<usize> {
        self.runtime().await?.detector.configure_rules(rules).await
    }

    pub async fn consistency_rules(&self) -> SyncResult<Vec<ConsistencyRule>> {
        Ok(self.runtime().await?.detector.rules().await)
    }

    pub async fn active_conflicts(&self) -> SyncResult<Vec<DataConflict>> {
        Ok(self.runtime().await?.registry.active().await)
    }

    pub async fn resolution_history(&self) -> SyncResult<Vec<ConflictResolutionResult>> {
        Ok(self.runtime().await?.registry.history().await)
    }

    // ---- resolution ----

    pub async fn resolve_conflict(
        &self,
        conflict_id: ConflictId,
        strategy: ResolutionStrategy,
    ) -> SyncResult<ConflictResolutionResult> {
        self.runtime()
            .await?
            .resolver
            .resolve_conflict(conflict_id, strategy)
            .await
    }

    pub async fn resolve_conflicts_batch(
        &self,
        conflict_ids: &[ConflictId],
        strategy: ResolutionStrategy,
    ) -> SyncResult<BatchResolutionResult> {
        self.runtime()
            .await?
            .resolver
            .resolve_conflicts_batch(conflict_ids, strategy)
            .await
    }

    pub async fn resolve_manually(
        &self,
        conflict_id: ConflictId,
        value: Value,
    ) -> SyncResult<ConflictResolutionResult> {
        self.runtime()
            .await?
            .resolver
            .resolve_manually(conflict_id, value)
            .await
    }

    pub async fn preview_resolution(
        &self,
        conflict_id: ConflictId,
        strategy: ResolutionStrategy,
    ) -> SyncResult<ResolutionPreview> {
        self.runtime()
            .await?
            .resolver
            .preview_resolution(conflict_id, strategy)
            .await
    }

    // ---- integrity ----

    pub async fn validate_data_integrity(
        &self,
        check_type: IntegrityCheckType,
        scope: Option<IntegrityScope>,
    ) -> SyncResult<IntegrityValidation> {
        self.runtime()
            .await?
            .integrity
            .validate_data_integrity(check_type, scope)
            .await
    }

    pub async fn repair_integrity_issues(
        &self,
        issues: &[IntegrityIssue],
    ) -> SyncResult<RepairSummary> {
        self.runtime()
            .await?
            .integrity
            .repair_integrity_issues(issues)
            .await
    }

    pub async fn integrity_report(
        &self,
        scope: Option<IntegrityScope>,
    ) -> SyncResult<IntegrityReport> {
        Ok(self.runtime().await?.integrity.integrity_report(scope))
    }

    // ---- offline ledger ----

    pub async fn record_data_change(&self, change: NewDataChange) -> SyncResult<OfflineDataChange> {
        self.runtime().await?.ledger.record_data_change(change).await
    }

    pub async fn detect_data_conflict(
        &self,
        key: &ItemKey,
        local: &Value,
        remote: &Value,
        remote_checksum: Option<&str>,
    ) -> SyncResult<bool> {
        Ok(self
            .runtime()
            .await?
            .ledger
            .detect_data_conflict(key, local, remote, remote_checksum))
    }

    pub async fn sync_cached_changes(
        &self,
        source_id: Option<&SourceId>,
        change_ids: Option<&[ChangeId]>,
    ) -> SyncResult<OfflineSyncResult> {
        // Clone the handle so a long pass does not hold the runtime lock.
        let ledger = self.runtime().await?.ledger.clone();
        ledger.sync_cached_changes(source_id, change_ids).await
    }

    pub async fn cleanup_expired_cache(
        &self,
        older_than: Option<std::time::Duration>,
    ) -> SyncResult<CleanupResult> {
        self.runtime()
            .await?
            .ledger
            .cleanup_expired_cache(older_than)
            .await
    }

    pub async fn cache_stats(&self) -> SyncResult<CacheStats> {
        Ok(self.runtime().await?.ledger.cache_stats().await)
    }

    pub async fn offline_sync_status(&self) -> SyncResult<OfflineSyncStatus> {
        Ok(self.runtime().await?.ledger.offline_sync_status().await)
    }

    pub async fn offline_change(
        &self,
        change_id: ChangeId,
    ) -> SyncResult<Option<OfflineDataChange>> {
        Ok(self.runtime().await?.ledger.get_change(change_id).await)
    }

    // ---- scheduling ----

    pub async fn perform_incremental_sync(
        &self,
        scope: SyncScope,
        direction: SyncDirection,
        last_sync_time: Option<concord_types::Timestamp>,
    ) -> SyncResult<SyncCycleResult> {
        self.runtime()
            .await?
            .scheduler
            .perform_incremental_sync(scope, direction, last_sync_time)
            .await
    }

    pub async fn force_sync(
        &self,
        source_ids: Option<&[SourceId]>,
        scope: SyncScope,
    ) -> SyncResult<ForceSyncResult> {
        self.runtime().await?.scheduler.force_sync(source_ids, scope).await
    }

    pub async fn pause_sync(&self, source_id: Option<&SourceId>) -> SyncResult<()> {
        self.runtime().await?.scheduler.pause_sync(source_id).await
    }

    pub async fn resume_sync(&self, source_id: Option<&SourceId>) -> SyncResult<()> {
        self.runtime().await?.scheduler.resume_sync(source_id).await
    }

    pub async fn sync_status(&self) -> SyncResult<SyncStatusReport> {
        Ok(self.runtime().await?.scheduler.sync_status().await)
    }

    // ---- metrics ----

    pub async fn consistency_metrics(
        &self,
        period: MetricsPeriod,
    ) -> SyncResult<ConsistencyMetrics> {
        Ok(self.runtime().await?.metrics.metrics(period))
    }

    pub async fn generate_consistency_report(
        &self,
        period: MetricsPeriod,
    ) -> SyncResult<ConsistencyReport> {
        Ok(self.runtime().await?.metrics.generate_consistency_report(period))
    }
}

/// Runs `job` on every tick until shutdown or until the ticker ends.
/// Failures are logged and the loop keeps going.
fn spawn_loop<F, Fut>(
    name: &'static str,
    mut ticker: Box<dyn Ticker>,
    mut shutdown: watch::Receiver<bool>,
    job: F,
) -> JoinHandle<()>
where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = SyncResult<()>> + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                ticked = ticker.tick() => {
                    if !ticked {
                        break;
                    }
                    if let Err(e) = job().await {
                        warn!("{} loop failed: {}", name, e);
                    }
                }
            }
        }
        debug!("{} loop stopped", name);
    })
}
