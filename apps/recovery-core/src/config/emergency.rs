//! Emergency liquidation and fault-handling configuration.

use std::path::PathBuf;
use std::time::Duration;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::recovery::BackupRetryPolicy;

/// Emergency liquidation and fault-handling configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmergencyConfig {
    /// Append-only plain-text alert log.
    #[serde(default = "default_alert_log_path")]
    pub alert_log_path: String,
    /// Durable emergency-mode flag file.
    #[serde(default = "default_flag_path")]
    pub flag_path: String,
    /// Directory for crash dump documents.
    #[serde(default = "default_crash_dump_dir")]
    pub crash_dump_dir: String,
    /// Overall deadline for one liquidation run.
    #[serde(default = "default_liquidation_deadline_secs")]
    pub liquidation_deadline_secs: u64,
    /// Deadline for each individual broker call during liquidation.
    #[serde(default = "default_order_timeout_ms")]
    pub order_timeout_ms: u64,
    /// Budget for the strategy-disable and alert steps after the deadline.
    #[serde(default = "default_control_step_timeout_ms")]
    pub control_step_timeout_ms: u64,
    /// How long the fault handler blocks process exit waiting for protection.
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
    /// Backup path: attempts of the marketable limit order.
    #[serde(default = "default_backup_max_attempts")]
    pub backup_max_attempts: u32,
    /// Backup path: first retry delay.
    #[serde(default = "default_backup_initial_backoff_ms")]
    pub backup_initial_backoff_ms: u64,
    /// Backup path: how far through the last price the limit is placed (fraction).
    #[serde(default = "default_backup_limit_offset_pct")]
    pub backup_limit_offset_pct: f64,
}

impl Default for EmergencyConfig {
    fn default() -> Self {
        Self {
            alert_log_path: default_alert_log_path(),
            flag_path: default_flag_path(),
            crash_dump_dir: default_crash_dump_dir(),
            liquidation_deadline_secs: default_liquidation_deadline_secs(),
            order_timeout_ms: default_order_timeout_ms(),
            control_step_timeout_ms: default_control_step_timeout_ms(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
            backup_max_attempts: default_backup_max_attempts(),
            backup_initial_backoff_ms: default_backup_initial_backoff_ms(),
            backup_limit_offset_pct: default_backup_limit_offset_pct(),
        }
    }
}

impl EmergencyConfig {
    /// Alert log path.
    #[must_use]
    pub fn alert_log_path(&self) -> PathBuf {
        PathBuf::from(&self.alert_log_path)
    }

    /// Emergency flag path.
    #[must_use]
    pub fn flag_path(&self) -> PathBuf {
        PathBuf::from(&self.flag_path)
    }

    /// Crash dump directory.
    #[must_use]
    pub fn crash_dump_dir(&self) -> PathBuf {
        PathBuf::from(&self.crash_dump_dir)
    }

    /// Overall liquidation deadline.
    #[must_use]
    pub const fn liquidation_deadline(&self) -> Duration {
        Duration::from_secs(self.liquidation_deadline_secs)
    }

    /// Per-call broker deadline.
    #[must_use]
    pub const fn order_timeout(&self) -> Duration {
        Duration::from_millis(self.order_timeout_ms)
    }

    /// Budget for the non-broker steps.
    #[must_use]
    pub const fn control_step_timeout(&self) -> Duration {
        Duration::from_millis(self.control_step_timeout_ms)
    }

    /// Fault-handler shutdown wait.
    #[must_use]
    pub const fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    /// Limit offset as a decimal fraction.
    #[must_use]
    pub fn backup_limit_offset(&self) -> Decimal {
        Decimal::try_from(self.backup_limit_offset_pct).unwrap_or_else(|_| Decimal::new(5, 3))
    }

    /// Convert to the backoff policy used by the liquidator's backup path.
    #[must_use]
    pub const fn to_backup_retry_policy(&self) -> BackupRetryPolicy {
        BackupRetryPolicy {
            max_attempts: self.backup_max_attempts,
            initial_backoff: Duration::from_millis(self.backup_initial_backoff_ms),
            max_backoff: Duration::from_secs(2),
            backoff_multiplier: 2.0,
            jitter_factor: 0.2,
        }
    }
}

fn default_alert_log_path() -> String {
    "./data/alerts/emergency_alerts.log".to_string()
}

fn default_flag_path() -> String {
    "./data/state/EMERGENCY_MODE".to_string()
}

fn default_crash_dump_dir() -> String {
    "./data/crash".to_string()
}

const fn default_liquidation_deadline_secs() -> u64 {
    20
}

const fn default_order_timeout_ms() -> u64 {
    3_000
}

const fn default_control_step_timeout_ms() -> u64 {
    2_000
}

const fn default_shutdown_timeout_secs() -> u64 {
    15
}

const fn default_backup_max_attempts() -> u32 {
    3
}

const fn default_backup_initial_backoff_ms() -> u64 {
    200
}

const fn default_backup_limit_offset_pct() -> f64 {
    0.005 // 0.5% through the last price
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_emergency_config_defaults() {
        let config = EmergencyConfig::default();
        assert_eq!(config.liquidation_deadline(), Duration::from_secs(20));
        assert_eq!(config.shutdown_timeout(), Duration::from_secs(15));
        assert_eq!(config.backup_limit_offset(), dec!(0.005));
        assert_eq!(config.to_backup_retry_policy().max_attempts, 3);
    }
}
