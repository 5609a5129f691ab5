//! Position health classification.
//!
//! Priority when several conditions hold:
//! `GhostPosition > RunawayLoss > StuckExit > AgedOut`.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use super::types::{ExitAttempt, PositionClassification};
use crate::clock::elapsed_between;
use crate::config::EscalationConfig;
use crate::models::{BrokerPosition, OrderType, PendingOrder, Position};

/// Verdict plus a reason for the alert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    /// Health class.
    pub class: PositionClassification,
    /// Human-readable reason.
    pub reason: String,
}

impl Classification {
    fn healthy() -> Self {
        Self {
            class: PositionClassification::Healthy,
            reason: String::new(),
        }
    }

    /// Whether the position needs recovery.
    #[must_use]
    pub fn is_unhealthy(&self) -> bool {
        self.class != PositionClassification::Healthy
    }
}

/// Stateless health rules.
#[derive(Debug, Clone)]
pub struct PositionClassifier {
    config: EscalationConfig,
}

impl PositionClassifier {
    /// Create a classifier.
    #[must_use]
    pub const fn new(config: EscalationConfig) -> Self {
        Self { config }
    }

    /// Classify a locally tracked position.
    ///
    /// `exit_orders` are the working orders on the position's closing side;
    /// `attempts` are exit orders the trading loop reported.
    #[must_use]
    pub fn classify(
        &self,
        position: &Position,
        exit_orders: &[PendingOrder],
        attempts: &[ExitAttempt],
        now: DateTime<Utc>,
    ) -> Classification {
        if !position.is_open() {
            return Classification::healthy();
        }

        let threshold = self.config.runaway_loss();
        if position.unrealized_pnl <= -threshold {
            return Classification {
                class: PositionClassification::RunawayLoss,
                reason: format!(
                    "unrealized loss {} beyond threshold {}",
                    position.unrealized_pnl, threshold
                ),
            };
        }

        if let Some(reason) = self.stuck_exit_reason(position, exit_orders, attempts, now) {
            return Classification {
                class: PositionClassification::StuckExit,
                reason,
            };
        }

        let max_hold = self.config.max_hold_for(&position.strategy_id);
        let held = elapsed_between(position.entry_time, now);
        if held > max_hold {
            return Classification {
                class: PositionClassification::AgedOut,
                reason: format!(
                    "held {}s, strategy {} allows {}s",
                    held.as_secs(),
                    position.strategy_id,
                    max_hold.as_secs()
                ),
            };
        }

        Classification::healthy()
    }

    /// Classify a broker position with no local record.
    #[must_use]
    pub fn classify_ghost(&self, broker: &BrokerPosition) -> Classification {
        Classification {
            class: PositionClassification::GhostPosition,
            reason: format!(
                "broker holds {} {} with no local record",
                broker.quantity, broker.symbol
            ),
        }
    }

    fn stuck_exit_reason(
        &self,
        position: &Position,
        exit_orders: &[PendingOrder],
        attempts: &[ExitAttempt],
        now: DateTime<Utc>,
    ) -> Option<String> {
        let timeout = self.config.exit_fill_timeout();

        if let Some(failed) = attempts.iter().find(|a| a.failed()) {
            return Some(format!(
                "exit order {} ended {:?} with position still open",
                failed.order_id, failed.status
            ));
        }
        if let Some(overdue) = attempts.iter().find(|a| a.overdue(now, timeout)) {
            return Some(format!(
                "exit order {} unfilled after {}s",
                overdue.order_id,
                timeout.as_secs()
            ));
        }

        let closing = position.closing_side();
        exit_orders
            .iter()
            .filter(|o| o.symbol == position.symbol && o.side == closing)
            .filter(|o| matches!(o.order_type, OrderType::Market | OrderType::Limit))
            .find(|o| o.status.is_active() && elapsed_between(o.submitted_at, now) > timeout)
            .map(|o| {
                format!(
                    "exit order {} unfilled after {}s",
                    o.order_id,
                    timeout.as_secs()
                )
            })
    }
}

/// Reference price for a symbol: last trade if known, else `fallback`.
#[must_use]
pub fn reference_price(
    last_prices: &std::collections::BTreeMap<String, Decimal>,
    symbol: &str,
    fallback: Decimal,
) -> Decimal {
    last_prices
        .get(symbol)
        .copied()
        .filter(|p| !p.is_zero())
        .unwrap_or(fallback)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{OrderSide, OrderStatus};
    use chrono::TimeDelta;
    use rust_decimal_macros::dec;

    fn classifier() -> PositionClassifier {
        let mut config = EscalationConfig::default();
        config.default_max_hold_minutes = 60;
        config.runaway_loss_threshold = 1000.0;
        config.exit_fill_timeout_secs = 30;
        PositionClassifier::new(config)
    }

    fn position(now: DateTime<Utc>, age_minutes: i64) -> Position {
        Position::new(
            "ES",
            dec!(2),
            dec!(5000),
            now - TimeDelta::minutes(age_minutes),
            "orb",
        )
    }

    fn exit_order(now: DateTime<Utc>, age_secs: i64) -> PendingOrder {
        PendingOrder {
            order_id: "exit-1".to_string(),
            symbol: "ES".to_string(),
            side: OrderSide::Sell,
            quantity: dec!(2),
            order_type: OrderType::Limit,
            price: Some(dec!(5001)),
            status: OrderStatus::Working,
            submitted_at: now - TimeDelta::seconds(age_secs),
        }
    }

    #[test]
    fn test_fresh_position_is_healthy() {
        let now = Utc::now();
        let verdict = classifier().classify(&position(now, 5), &[], &[], now);
        assert_eq!(verdict.class, PositionClassification::Healthy);
        assert!(!verdict.is_unhealthy());
    }

    #[test]
    fn test_aged_out_past_max_hold() {
        let now = Utc::now();
        let verdict = classifier().classify(&position(now, 80), &[], &[], now);
        assert_eq!(verdict.class, PositionClassification::AgedOut);
    }

    #[test]
    fn test_per_strategy_max_hold() {
        let now = Utc::now();
        let mut config = EscalationConfig::default();
        config.strategy_max_hold_minutes.insert("orb".to_string(), 10);
        let verdict = PositionClassifier::new(config).classify(&position(now, 15), &[], &[], now);
        assert_eq!(verdict.class, PositionClassification::AgedOut);
    }

    #[test]
    fn test_overdue_exit_order_is_stuck() {
        let now = Utc::now();
        let verdict =
            classifier().classify(&position(now, 5), &[exit_order(now, 45)], &[], now);
        assert_eq!(verdict.class, PositionClassification::StuckExit);

        let verdict =
            classifier().classify(&position(now, 5), &[exit_order(now, 10)], &[], now);
        assert_eq!(verdict.class, PositionClassification::Healthy);
    }

    #[test]
    fn test_rejected_exit_attempt_is_stuck() {
        let now = Utc::now();
        let attempt = ExitAttempt {
            order_id: "exit-9".to_string(),
            submitted_at: now,
            order_type: OrderType::Limit,
            price: Some(dec!(5001)),
            status: OrderStatus::Rejected,
        };
        let verdict = classifier().classify(&position(now, 5), &[], &[attempt], now);
        assert_eq!(verdict.class, PositionClassification::StuckExit);
    }

    #[test]
    fn test_runaway_loss_outranks_stuck_and_aged() {
        let now = Utc::now();
        let mut p = position(now, 80);
        p.mark(dec!(4980), dec!(50));
        assert_eq!(p.unrealized_pnl, dec!(-2000));

        let verdict = classifier().classify(&p, &[exit_order(now, 45)], &[], now);
        assert_eq!(verdict.class, PositionClassification::RunawayLoss);
    }

    #[test]
    fn test_stuck_outranks_aged() {
        let now = Utc::now();
        let verdict =
            classifier().classify(&position(now, 80), &[exit_order(now, 45)], &[], now);
        assert_eq!(verdict.class, PositionClassification::StuckExit);
    }
}
