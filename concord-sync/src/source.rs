//! Data source and router contracts.
//!
//! The engine never owns authoritative data. Live feeds, local caches and
//! remote mirrors plug in through [`DataSource`]; a [`SourceRouter`] decides
//! which of them take part in a given read or write.

use crate::error::SyncResult;
use async_trait::async_trait;
use concord_types::{ItemKey, SourceId, Timestamp, checksum};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::{Arc, RwLock};

/// Reported health of a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SourceHealth {
    Healthy,
    Degraded,
    Unreachable,
}

/// An item as held by one source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRecord {
    /// The payload.
    pub payload: Value,
    /// When the source last changed this item.
    pub updated_at: Timestamp,
    /// The source's own revision counter for the item.
    pub version: u64,
    /// Checksum as reported by the source.
    pub checksum: String,
}

impl SourceRecord {
    /// Creates a record whose checksum is computed from the payload.
    pub fn new(payload: Value, updated_at: Timestamp, version: u64) -> Self {
        let checksum = checksum(&payload);
        Self {
            payload,
            updated_at,
            version,
            checksum,
        }
    }

    /// Whether the reported checksum matches the payload.
    #[must_use]
    pub fn checksum_is_valid(&self) -> bool {
        checksum(&self.payload) == self.checksum
    }
}

/// A data source collaborator.
#[async_trait]
pub trait DataSource: Send + Sync {
    /// Stable identifier.
    fn id(&self) -> &SourceId;

    /// Current health.
    fn health(&self) -> SourceHealth;

    /// Reads one item. `Ok(None)` means the source does not have it.
    async fn read(&self, key: &ItemKey) -> SyncResult<Option<SourceRecord>>;

    /// Writes one item and returns the record as stored.
    async fn write(&self, key: &ItemKey, payload: Value) -> SyncResult<SourceRecord>;

    /// Deletes one item. Returns whether it existed.
    async fn delete(&self, key: &ItemKey) -> SyncResult<bool>;

    /// Lists known keys, optionally restricted to one item type.
    async fn list_keys(&self, item_type: Option<&str>) -> SyncResult<Vec<ItemKey>>;

    /// Keys changed at or after `since`.
    async fn changed_since(&self, since: Timestamp) -> SyncResult<Vec<ItemKey>>;
}

/// Kind of access being routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOp {
    Read,
    Write,
}

/// Picks the sources eligible for an access. Treated as an opaque filter.
pub trait SourceRouter: Send + Sync {
    fn route(
        &self,
        op: RouteOp,
        key: Option<&ItemKey>,
        candidates: &[Arc<dyn DataSource>],
    ) -> Vec<Arc<dyn DataSource>>;
}

/// Default router: every source that is not unreachable.
#[derive(Debug, Clone, Copy, Default)]
pub struct HealthyRouter;

impl SourceRouter for HealthyRouter {
    fn route(
        &self,
        _op: RouteOp,
        _key: Option<&ItemKey>,
        candidates: &[Arc<dyn DataSource>],
    ) -> Vec<Arc<dyn DataSource>> {
        candidates
            .iter()
            .filter(|s| s.health() != SourceHealth::Unreachable)
            .cloned()
            .collect()
    }
}

/// The registered sources plus the router that filters them.
///
/// Shared by every engine component. Registration survives engine
/// restarts.
pub struct SourceSet {
    sources: RwLock<Vec<Arc<dyn DataSource>>>,
    router: Arc<dyn SourceRouter>,
}

impl SourceSet {
    pub fn new(router: Arc<dyn SourceRouter>) -> Self {
        Self {
            sources: RwLock::new(Vec::new()),
            router,
        }
    }

    /// Adds a source, replacing any previous source with the same id.
    pub fn register(&self, source: Arc<dyn DataSource>) {
        let mut sources = self.sources.write().unwrap_or_else(|e| e.into_inner());
        sources.retain(|s| s.id() != source.id());
        sources.push(source);
    }

    /// Every registered source, in registration order.
    pub fn all(&self) -> Vec<Arc<dyn DataSource>> {
        self.sources
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Looks up a source by id.
    pub fn get(&self, id: &SourceId) -> Option<Arc<dyn DataSource>> {
        self.sources
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .find(|s| s.id() == id)
            .cloned()
    }

    /// Sources the router allows for this access.
    pub fn route(&self, op: RouteOp, key: Option<&ItemKey>) -> Vec<Arc<dyn DataSource>> {
        self.router.route(op, key, &self.all())
    }

    /// Routed sources restricted to `ids`, or all routed sources for `None`.
    pub fn route_among(
        &self,
        op: RouteOp,
        key: Option<&ItemKey>,
        ids: Option<&[SourceId]>,
    ) -> Vec<Arc<dyn DataSource>> {
        let routed = self.route(op, key);
        match ids {
            Some(ids) => routed.into_iter().filter(|s| ids.contains(s.id())).collect(),
            None => routed,
        }
    }
}

/// Reads `key` from every source concurrently.
pub async fn read_all(
    sources: &[Arc<dyn DataSource>],
    key: &ItemKey,
) -> Vec<(SourceId, SyncResult<Option<SourceRecord>>)> {
    join_all(sources.iter().map(|source| async move {
        (source.id().clone(), source.read(key).await)
    }))
    .await
}

/// An in-memory source for testing.
pub mod mock {
    use super::*;
    use crate::error::SyncError;
    use concord_types::{Clock, SystemClock};
    use std::collections::BTreeMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// A source backed by a map, with failure injection.
    pub struct MemorySource {
        id: SourceId,
        clock: Arc<dyn Clock>,
        health: Mutex<SourceHealth>,
        records: Mutex<BTreeMap<ItemKey, SourceRecord>>,
        failing_writes: AtomicUsize,
        failing_reads: AtomicBool,
        writes: AtomicUsize,
    }

    impl MemorySource {
        /// Creates a healthy, empty source on the system clock.
        pub fn new(id: impl Into<SourceId>) -> Self {
            Self::with_clock(id, Arc::new(SystemClock))
        }

        /// Creates a healthy, empty source on the given clock.
        pub fn with_clock(id: impl Into<SourceId>, clock: Arc<dyn Clock>) -> Self {
            Self {
                id: id.into(),
                clock,
                health: Mutex::new(SourceHealth::Healthy),
                records: Mutex::new(BTreeMap::new()),
                failing_writes: AtomicUsize::new(0),
                failing_reads: AtomicBool::new(false),
                writes: AtomicUsize::new(0),
            }
        }

        /// Seeds an item with an explicit timestamp and revision.
        pub fn insert(&self, key: ItemKey, payload: Value, updated_at: Timestamp, version: u64) {
            self.insert_raw(key, SourceRecord::new(payload, updated_at, version));
        }

        /// Seeds a record verbatim, including a possibly wrong checksum.
        pub fn insert_raw(&self, key: ItemKey, record: SourceRecord) {
            self.records
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(key, record);
        }

        /// Returns the stored record without going through the async API.
        pub fn record(&self, key: &ItemKey) -> Option<SourceRecord> {
            self.records
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .get(key)
                .cloned()
        }

        /// Number of stored items.
        pub fn len(&self) -> usize {
            self.records.lock().unwrap_or_else(|e| e.into_inner()).len()
        }

        /// Whether the source holds no items.
        pub fn is_empty(&self) -> bool {
            self.len() == 0
        }

        /// Sets the reported health.
        pub fn set_health(&self, health: SourceHealth) {
            *self.health.lock().unwrap_or_else(|e| e.into_inner()) = health;
        }

        /// Makes the next `n` writes fail with a transient error.
        pub fn fail_next_writes(&self, n: usize) {
            self.failing_writes.store(n, Ordering::SeqCst);
        }

        /// Makes every read fail until turned off.
        pub fn set_read_failure(&self, failing: bool) {
            self.failing_reads.store(failing, Ordering::SeqCst);
        }

        /// Number of successful writes and deletes so far.
        pub fn write_count(&self) -> usize {
            self.writes.load(Ordering::SeqCst)
        }

        fn ensure_reachable(&self) -> SyncResult<()> {
            if self.health() == SourceHealth::Unreachable {
                return Err(SyncError::transient(&self.id, "source unreachable"));
            }
            Ok(())
        }

        fn take_write_failure(&self) -> bool {
            self.failing_writes
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        }
    }

    #[async_trait]
    impl DataSource for MemorySource {
        fn id(&self) -> &SourceId {
            &self.id
        }

        fn health(&self) -> SourceHealth {
            *self.health.lock().unwrap_or_else(|e| e.into_inner())
        }

        async fn read(&self, key: &ItemKey) -> SyncResult<Option<SourceRecord>> {
            self.ensure_reachable()?;
            if self.failing_reads.load(Ordering::SeqCst) {
                return Err(SyncError::transient(&self.id, "injected read failure"));
            }
            Ok(self.record(key))
        }

        async fn write(&self, key: &ItemKey, payload: Value) -> SyncResult<SourceRecord> {
            self.ensure_reachable()?;
            if self.take_write_failure() {
                return Err(SyncError::transient(&self.id, "injected write failure"));
            }
            let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
            let version = records.get(key).map_or(1, |r| r.version + 1);
            let record = SourceRecord::new(payload, self.clock.now(), version);
            records.insert(key.clone(), record.clone());
            self.writes.fetch_add(1, Ordering::SeqCst);
            Ok(record)
        }

        async fn delete(&self, key: &ItemKey) -> SyncResult<bool> {
            self.ensure_reachable()?;
            if self.take_write_failure() {
                return Err(SyncError::transient(&self.id, "injected write failure"));
            }
            let existed = self
                .records
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(key)
                .is_some();
            if existed {
                self.writes.fetch_add(1, Ordering::SeqCst);
            }
            Ok(existed)
        }

        async fn list_keys(&self, item_type: Option<&str>) -> SyncResult<Vec<ItemKey>> {
            self.ensure_reachable()?;
            let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
            Ok(records
                .keys()
                .filter(|k| item_type.is_none_or(|t| k.item_type == t))
                .cloned()
                .collect())
        }

        async fn changed_since(&self, since: Timestamp) -> SyncResult<Vec<ItemKey>> {
            self.ensure_reachable()?;
            let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
            Ok(records
                .iter()
                .filter(|(_, r)| r.updated_at >= since)
                .map(|(k, _)| k.clone())
                .collect())
        }
    }
}
