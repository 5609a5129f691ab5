//! Stuck-position escalation configuration.

use std::collections::BTreeMap;
use std::time::Duration;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Bounds for one automated rung of the ladder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LevelPolicy {
    /// Attempts before moving to the next level.
    pub max_attempts: u32,
    /// Time spent at this level before moving on, regardless of attempts.
    pub window_secs: u64,
    /// Minimum spacing between attempts at this level.
    pub retry_interval_secs: u64,
}

impl LevelPolicy {
    /// Time window.
    #[must_use]
    pub const fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    /// Attempt spacing.
    #[must_use]
    pub const fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_secs)
    }
}

/// Stuck-position escalation configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationConfig {
    /// Enable the escalator.
    #[serde(default = "default_escalation_enabled")]
    pub enabled: bool,
    /// Evaluation cadence in milliseconds.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// An exit order working longer than this is stuck.
    #[serde(default = "default_exit_fill_timeout_secs")]
    pub exit_fill_timeout_secs: u64,
    /// Maximum hold time for strategies without an override.
    #[serde(default = "default_max_hold_minutes")]
    pub default_max_hold_minutes: u64,
    /// Per-strategy maximum hold time.
    #[serde(default)]
    pub strategy_max_hold_minutes: BTreeMap<String, u64>,
    /// Unrealized loss (positive number) at which a position is a runaway.
    #[serde(default = "default_runaway_loss_threshold")]
    pub runaway_loss_threshold: f64,
    /// Smart-retry price adjustment per attempt (fraction of price).
    #[serde(default = "default_smart_retry_price_step_pct")]
    pub smart_retry_price_step_pct: f64,
    /// SmartRetry bounds.
    #[serde(default = "default_smart_retry")]
    pub smart_retry: LevelPolicy,
    /// FreshStart bounds.
    #[serde(default = "default_fresh_start")]
    pub fresh_start: LevelPolicy,
    /// MarketOrder bounds.
    #[serde(default = "default_market_order")]
    pub market_order: LevelPolicy,
    /// How long an operator has before the system shuts trading down.
    #[serde(default = "default_human_escalation_window_secs")]
    pub human_escalation_window_secs: u64,
    /// Deadline for each broker call made by the escalator.
    #[serde(default = "default_broker_call_timeout_ms")]
    pub broker_call_timeout_ms: u64,
    /// File name of the incident archive, inside the persistence state dir.
    #[serde(default = "default_incident_log_file")]
    pub incident_log_file: String,
}

impl Default for EscalationConfig {
    fn default() -> Self {
        Self {
            enabled: default_escalation_enabled(),
            poll_interval_ms: default_poll_interval_ms(),
            exit_fill_timeout_secs: default_exit_fill_timeout_secs(),
            default_max_hold_minutes: default_max_hold_minutes(),
            strategy_max_hold_minutes: BTreeMap::new(),
            runaway_loss_threshold: default_runaway_loss_threshold(),
            smart_retry_price_step_pct: default_smart_retry_price_step_pct(),
            smart_retry: default_smart_retry(),
            fresh_start: default_fresh_start(),
            market_order: default_market_order(),
            human_escalation_window_secs: default_human_escalation_window_secs(),
            broker_call_timeout_ms: default_broker_call_timeout_ms(),
            incident_log_file: default_incident_log_file(),
        }
    }
}

impl EscalationConfig {
    /// Evaluation cadence.
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Stuck-exit threshold.
    #[must_use]
    pub const fn exit_fill_timeout(&self) -> Duration {
        Duration::from_secs(self.exit_fill_timeout_secs)
    }

    /// Maximum hold time for a strategy.
    #[must_use]
    pub fn max_hold_for(&self, strategy_id: &str) -> Duration {
        let minutes = self
            .strategy_max_hold_minutes
            .get(strategy_id)
            .copied()
            .unwrap_or(self.default_max_hold_minutes);
        Duration::from_secs(minutes.saturating_mul(60))
    }

    /// Runaway loss threshold as a positive amount.
    #[must_use]
    pub fn runaway_loss(&self) -> Decimal {
        Decimal::try_from(self.runaway_loss_threshold)
            .map(|d| d.abs())
            .unwrap_or_else(|_| Decimal::new(1_000, 0))
    }

    /// Smart-retry step as a fraction.
    #[must_use]
    pub fn smart_retry_price_step(&self) -> Decimal {
        Decimal::try_from(self.smart_retry_price_step_pct).unwrap_or_else(|_| Decimal::new(1, 3))
    }

    /// Operator window.
    #[must_use]
    pub const fn human_escalation_window(&self) -> Duration {
        Duration::from_secs(self.human_escalation_window_secs)
    }

    /// Per-call broker deadline.
    #[must_use]
    pub const fn broker_call_timeout(&self) -> Duration {
        Duration::from_millis(self.broker_call_timeout_ms)
    }
}

const fn default_escalation_enabled() -> bool {
    true
}

const fn default_poll_interval_ms() -> u64 {
    1_000
}

const fn default_exit_fill_timeout_secs() -> u64 {
    30
}

const fn default_max_hold_minutes() -> u64 {
    240
}

const fn default_runaway_loss_threshold() -> f64 {
    1_000.0
}

const fn default_smart_retry_price_step_pct() -> f64 {
    0.001 // 0.1% per attempt
}

const fn default_smart_retry() -> LevelPolicy {
    LevelPolicy {
        max_attempts: 3,
        window_secs: 30,
        retry_interval_secs: 5,
    }
}

const fn default_fresh_start() -> LevelPolicy {
    LevelPolicy {
        max_attempts: 2,
        window_secs: 30,
        retry_interval_secs: 10,
    }
}

const fn default_market_order() -> LevelPolicy {
    LevelPolicy {
        max_attempts: 2,
        window_secs: 15,
        retry_interval_secs: 5,
    }
}

const fn default_human_escalation_window_secs() -> u64 {
    300
}

const fn default_broker_call_timeout_ms() -> u64 {
    5_000
}

fn default_incident_log_file() -> String {
    "recovery_incidents.jsonl".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_max_hold_override() {
        let mut config = EscalationConfig::default();
        config
            .strategy_max_hold_minutes
            .insert("scalper".to_string(), 15);

        assert_eq!(config.max_hold_for("scalper"), Duration::from_secs(15 * 60));
        assert_eq!(config.max_hold_for("swing"), Duration::from_secs(240 * 60));
    }

    #[test]
    fn test_runaway_loss_is_positive() {
        let config = EscalationConfig {
            runaway_loss_threshold: -500.0,
            ..Default::default()
        };
        assert_eq!(config.runaway_loss(), dec!(500));
    }

    #[test]
    fn test_ladder_defaults() {
        let config = EscalationConfig::default();
        assert_eq!(config.smart_retry.max_attempts, 3);
        assert_eq!(config.fresh_start.window(), Duration::from_secs(30));
        assert_eq!(config.human_escalation_window(), Duration::from_secs(300));
    }
}
