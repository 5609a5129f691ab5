//! Recovery configuration for crash recovery on startup.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Recovery configuration for crash recovery on startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryConfig {
    /// Downtime at or above which recovery liquidates instead of reconciling.
    #[serde(default = "default_downtime_threshold_ms")]
    pub downtime_threshold_ms: u64,
    /// Deadline for the reconcile, reattach and resume sequence.
    #[serde(default = "default_operation_deadline_secs")]
    pub operation_deadline_secs: u64,
    /// Deadline for a single broker call made during recovery.
    #[serde(default = "default_broker_call_timeout_ms")]
    pub broker_call_timeout_ms: u64,
    /// Strategy id assigned to positions adopted from the broker.
    #[serde(default = "default_adopted_strategy_id")]
    pub adopted_strategy_id: String,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            downtime_threshold_ms: default_downtime_threshold_ms(),
            operation_deadline_secs: default_operation_deadline_secs(),
            broker_call_timeout_ms: default_broker_call_timeout_ms(),
            adopted_strategy_id: default_adopted_strategy_id(),
        }
    }
}

impl RecoveryConfig {
    /// Downtime threshold.
    #[must_use]
    pub const fn downtime_threshold(&self) -> Duration {
        Duration::from_millis(self.downtime_threshold_ms)
    }

    /// Deadline for the resume sequence.
    #[must_use]
    pub const fn operation_deadline(&self) -> Duration {
        Duration::from_secs(self.operation_deadline_secs)
    }

    /// Per-call broker timeout.
    #[must_use]
    pub const fn broker_call_timeout(&self) -> Duration {
        Duration::from_millis(self.broker_call_timeout_ms)
    }
}

const fn default_downtime_threshold_ms() -> u64 {
    60_000
}

const fn default_operation_deadline_secs() -> u64 {
    30
}

const fn default_broker_call_timeout_ms() -> u64 {
    5_000
}

fn default_adopted_strategy_id() -> String {
    "recovered".to_string()
}
