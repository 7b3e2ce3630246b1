//! Tick sources for the engine's periodic loops, plus cooperative
//! cancellation.
//!
//! Production loops run on [`IntervalTicker`]; tests drive them one tick at
//! a time through a [`ManualTicker`].

use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Interval, MissedTickBehavior};

/// Yields once per period.
#[async_trait]
pub trait Ticker: Send {
    /// Waits for the next tick. Returns `false` once the ticker can never
    /// fire again.
    async fn tick(&mut self) -> bool;
}

/// Wall-clock ticker backed by `tokio::time::interval`.
///
/// The first tick fires one period after creation, not immediately.
pub struct IntervalTicker {
    interval: Interval,
}

impl IntervalTicker {
    pub fn new(period: Duration) -> Self {
        let period = period.max(Duration::from_millis(1));
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        Self { interval }
    }
}

#[async_trait]
impl Ticker for IntervalTicker {
    async fn tick(&mut self) -> bool {
        self.interval.tick().await;
        true
    }
}

/// Ticker that only fires when its handle says so.
pub struct ManualTicker {
    rx: mpsc::UnboundedReceiver<()>,
}

/// Fires a [`ManualTicker`]. Dropping every handle ends the ticker.
#[derive(Clone)]
pub struct ManualTickerHandle {
    tx: mpsc::UnboundedSender<()>,
}

impl ManualTicker {
    /// Creates a ticker and the handle that fires it.
    pub fn channel() -> (Self, ManualTickerHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { rx }, ManualTickerHandle { tx })
    }
}

impl ManualTickerHandle {
    /// Queues one tick. Returns `false` if the ticker is gone.
    pub fn tick(&self) -> bool {
        self.tx.send(()).is_ok()
    }
}

#[async_trait]
impl Ticker for ManualTicker {
    async fn tick(&mut self) -> bool {
        self.rx.recv().await.is_some()
    }
}

/// Shared flag checked between per-item iterations of long operations.
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// `Err(Cancelled)` once the flag is set.
    pub fn check(&self) -> SyncResult<()> {
        if self.is_cancelled() {
            return Err(SyncError::Cancelled);
        }
        Ok(())
    }
}
