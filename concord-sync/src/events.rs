//! Broadcast channels for conflict and sync notifications.
//!
//! Each subscriber gets its own queue, so a slow observer lags (and may miss
//! events) without ever blocking the publisher. Missed events are not
//! replayed.

use crate::conflict::DataConflict;
use crate::error::{SyncError, SyncResult};
use crate::scheduler::SyncCycleResult;
use std::sync::Mutex;
use tokio::sync::broadcast;
use tracing::debug;

const CHANNEL_CAPACITY: usize = 256;

/// Publish/subscribe hub owned by one engine instance.
pub struct EventBus {
    conflicts: Mutex<Option<broadcast::Sender<DataConflict>>>,
    sync_completed: Mutex<Option<broadcast::Sender<SyncCycleResult>>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (conflicts, _) = broadcast::channel(CHANNEL_CAPACITY);
        let (sync_completed, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            conflicts: Mutex::new(Some(conflicts)),
            sync_completed: Mutex::new(Some(sync_completed)),
        }
    }

    /// Subscribes to newly detected conflicts.
    pub fn subscribe_conflicts(&self) -> SyncResult<broadcast::Receiver<DataConflict>> {
        self.conflicts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(broadcast::Sender::subscribe)
            .ok_or(SyncError::ChannelClosed)
    }

    /// Subscribes to completed sync cycles.
    pub fn subscribe_sync_completed(&self) -> SyncResult<broadcast::Receiver<SyncCycleResult>> {
        self.sync_completed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(broadcast::Sender::subscribe)
            .ok_or(SyncError::ChannelClosed)
    }

    pub fn publish_conflict(&self, conflict: &DataConflict) {
        if let Some(tx) = self.conflicts.lock().unwrap_or_else(|e| e.into_inner()).as_ref() {
            // No subscribers is fine.
            let delivered = tx.send(conflict.clone()).unwrap_or(0);
            debug!("Conflict {} delivered to {} observers", conflict.conflict_id, delivered);
        }
    }

    pub fn publish_sync_completed(&self, result: &SyncCycleResult) {
        if let Some(tx) = self
            .sync_completed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
        {
            let _ = tx.send(result.clone());
        }
    }

    /// Drops both senders; subscribers see `RecvError::Closed` once drained.
    pub fn close(&self) {
        self.conflicts.lock().unwrap_or_else(|e| e.into_inner()).take();
        self.sync_completed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
    }
}
