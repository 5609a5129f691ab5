//! Heartbeat monitor configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Heartbeat monitor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Enable the heartbeat monitor.
    #[serde(default = "default_heartbeat_enabled")]
    pub enabled: bool,
    /// Check interval in milliseconds.
    #[serde(default = "default_check_interval_ms")]
    pub check_interval_ms: u64,
    /// Heartbeat age after which mitigation starts.
    #[serde(default = "default_stale_after_ms")]
    pub stale_after_ms: u64,
    /// How long mitigation is given before escalation is considered.
    #[serde(default = "default_grace_period_ms")]
    pub grace_period_ms: u64,
    /// Heartbeat age after which an unresolved freeze escalates.
    #[serde(default = "default_escalate_after_ms")]
    pub escalate_after_ms: u64,
    /// Resident memory above which a reclamation hint is issued.
    #[serde(default = "default_memory_ceiling_mb")]
    pub memory_ceiling_mb: u64,
    /// Initial size of the shared worker pool.
    #[serde(default = "default_worker_floor")]
    pub worker_floor: usize,
    /// Permits added when worker starvation is detected.
    #[serde(default = "default_worker_floor_step")]
    pub worker_floor_step: usize,
    /// Upper bound for the worker pool.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            enabled: default_heartbeat_enabled(),
            check_interval_ms: default_check_interval_ms(),
            stale_after_ms: default_stale_after_ms(),
            grace_period_ms: default_grace_period_ms(),
            escalate_after_ms: default_escalate_after_ms(),
            memory_ceiling_mb: default_memory_ceiling_mb(),
            worker_floor: default_worker_floor(),
            worker_floor_step: default_worker_floor_step(),
            max_workers: default_max_workers(),
        }
    }
}

impl HeartbeatConfig {
    /// Check interval.
    #[must_use]
    pub const fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }

    /// Staleness threshold.
    #[must_use]
    pub const fn stale_after(&self) -> Duration {
        Duration::from_millis(self.stale_after_ms)
    }

    /// Mitigation grace period.
    #[must_use]
    pub const fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    /// Escalation threshold.
    #[must_use]
    pub const fn escalate_after(&self) -> Duration {
        Duration::from_millis(self.escalate_after_ms)
    }

    /// Memory ceiling in bytes.
    #[must_use]
    pub const fn memory_ceiling_bytes(&self) -> u64 {
        self.memory_ceiling_mb.saturating_mul(1024 * 1024)
    }
}

const fn default_heartbeat_enabled() -> bool {
    true
}

const fn default_check_interval_ms() -> u64 {
    5_000
}

const fn default_stale_after_ms() -> u64 {
    10_000
}

const fn default_grace_period_ms() -> u64 {
    5_000
}

const fn default_escalate_after_ms() -> u64 {
    35_000
}

const fn default_memory_ceiling_mb() -> u64 {
    2_048
}

const fn default_worker_floor() -> usize {
    4
}

const fn default_worker_floor_step() -> usize {
    2
}

const fn default_max_workers() -> usize {
    32
}
