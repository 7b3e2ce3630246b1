//! Engine configuration.
//!
//! Durations are stored as integer seconds/milliseconds so the struct maps
//! directly onto JSON or environment-driven settings files.

use crate::detector::DetectionStrategy;
use crate::error::{SyncError, SyncResult};
use crate::resolver::ResolutionStrategy;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for the consistency engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Name recorded as `created_by` on engine-authored versions.
    pub instance_name: String,
    /// How often the periodic consistency check runs.
    pub consistency_check_interval_secs: u64,
    /// How often metrics caches are refreshed and swept.
    pub metrics_update_interval_secs: u64,
    /// How often a reconciliation cycle runs.
    pub sync_interval_secs: u64,
    /// Look-back window for incremental checks with no known last sync.
    pub incremental_check_window_secs: u64,
    /// Versions kept per entity before the oldest half is evicted.
    pub max_version_history: usize,
    /// Upper bound on tracked, unresolved conflicts.
    pub max_active_conflicts: usize,
    /// Timestamp spread tolerated by timestamp-based detection.
    pub timestamp_tolerance_ms: u64,
    /// Strategy used by scheduled detection.
    pub default_detection_strategy: DetectionStrategy,
    /// Strategy used by scheduled resolution.
    pub default_resolution_strategy: ResolutionStrategy,
    /// Strategy used when replaying offline changes hits a remote conflict.
    pub offline_resolution_strategy: ResolutionStrategy,
    /// Simulated network delay per replayed offline change.
    pub offline_replay_delay_ms: u64,
    /// Offline changes older than this are purged by cleanup.
    pub offline_retention_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            instance_name: "concord".to_string(),
            consistency_check_interval_secs: 15 * 60,
            metrics_update_interval_secs: 5 * 60,
            sync_interval_secs: 30 * 60,
            incremental_check_window_secs: 60 * 60,
            max_version_history: 100,
            max_active_conflicts: 1000,
            timestamp_tolerance_ms: 1000,
            default_detection_strategy: DetectionStrategy::ContentHash,
            default_resolution_strategy: ResolutionStrategy::LatestWins,
            offline_resolution_strategy: ResolutionStrategy::LatestWins,
            offline_replay_delay_ms: 50,
            offline_retention_secs: 7 * 24 * 60 * 60,
        }
    }
}

impl EngineConfig {
    /// Short intervals and small caps for local development.
    #[must_use]
    pub fn development() -> Self {
        Self {
            consistency_check_interval_secs: 60,
            metrics_update_interval_secs: 30,
            sync_interval_secs: 120,
            incremental_check_window_secs: 10 * 60,
            max_version_history: 20,
            max_active_conflicts: 100,
            offline_replay_delay_ms: 0,
            offline_retention_secs: 24 * 60 * 60,
            ..Self::default()
        }
    }

    /// Default cadence with room for long histories.
    #[must_use]
    pub fn production() -> Self {
        Self {
            max_version_history: 500,
            max_active_conflicts: 5000,
            offline_retention_secs: 30 * 24 * 60 * 60,
            ..Self::default()
        }
    }

    /// Looks up a named preset.
    pub fn preset(name: &str) -> SyncResult<Self> {
        match name {
            "development" | "dev" => Ok(Self::development()),
            "production" | "prod" => Ok(Self::production()),
            "default" => Ok(Self::default()),
            other => Err(SyncError::InvalidArgument(format!("unknown preset '{other}'"))),
        }
    }

    /// Parses a JSON document; missing fields take their defaults.
    pub fn from_json(json: &str) -> SyncResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects settings the engine cannot run with.
    pub fn validate(&self) -> SyncResult<()> {
        let intervals = [
            ("consistency_check_interval_secs", self.consistency_check_interval_secs),
            ("metrics_update_interval_secs", self.metrics_update_interval_secs),
            ("sync_interval_secs", self.sync_interval_secs),
        ];
        for (name, value) in intervals {
            if value == 0 {
                return Err(SyncError::InvalidArgument(format!("{name} must be positive")));
            }
        }
        if self.max_version_history < 2 {
            return Err(SyncError::InvalidArgument(
                "max_version_history must be at least 2".into(),
            ));
        }
        if self.max_active_conflicts == 0 {
            return Err(SyncError::InvalidArgument(
                "max_active_conflicts must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn consistency_check_interval(&self) -> Duration {
        Duration::from_secs(self.consistency_check_interval_secs)
    }

    pub fn metrics_update_interval(&self) -> Duration {
        Duration::from_secs(self.metrics_update_interval_secs)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }

    pub fn incremental_check_window(&self) -> Duration {
        Duration::from_secs(self.incremental_check_window_secs)
    }

    pub fn timestamp_tolerance(&self) -> Duration {
        Duration::from_millis(self.timestamp_tolerance_ms)
    }

    pub fn offline_replay_delay(&self) -> Duration {
        Duration::from_millis(self.offline_replay_delay_ms)
    }

    pub fn offline_retention(&self) -> Duration {
        Duration::from_secs(self.offline_retention_secs)
    }
}
