//! Stuck-position escalation types.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::clock::elapsed_between;
use crate::error::{Classify, ErrorKind};
use crate::models::{OrderStatus, OrderType, PositionSide};
use crate::persistence::StoreError;
use crate::ports::BrokerError;

// =============================================================================
// Errors
// =============================================================================

/// Escalation errors.
#[derive(Debug, Error)]
pub enum EscalationError {
    /// Attempted to move an incident to a level at or below its current one.
    #[error("Recovery level cannot go from {from:?} to {to:?}")]
    LevelRegression {
        /// Current level.
        from: RecoveryLevel,
        /// Requested level.
        to: RecoveryLevel,
    },

    /// Broker call failed.
    #[error(transparent)]
    Broker(#[from] BrokerError),

    /// Incident log could not be written.
    #[error(transparent)]
    Log(#[from] StoreError),
}

impl Classify for EscalationError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::LevelRegression { .. } => ErrorKind::Unrecoverable,
            Self::Broker(e) => e.kind(),
            Self::Log(e) => e.kind(),
        }
    }
}

// =============================================================================
// Classification and Levels
// =============================================================================

/// Health of a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PositionClassification {
    /// Nothing wrong.
    Healthy,
    /// An exit order failed or has not filled in time.
    StuckExit,
    /// Held longer than the strategy allows.
    AgedOut,
    /// Unrealized loss past the emergency threshold.
    RunawayLoss,
    /// Open at the broker with no local record.
    GhostPosition,
}

impl PositionClassification {
    /// Label for logs and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::StuckExit => "stuck_exit",
            Self::AgedOut => "aged_out",
            Self::RunawayLoss => "runaway_loss",
            Self::GhostPosition => "ghost_position",
        }
    }
}

/// Rung of the recovery ladder. Ordered from least to most drastic.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecoveryLevel {
    /// Not yet escalated.
    None,
    /// Resubmit the exit at an adjusted price.
    SmartRetry,
    /// Cancel and replace at the current market.
    FreshStart,
    /// Immediate market exit.
    MarketOrder,
    /// Operator paged; no more bot attempts.
    HumanEscalation,
    /// Trading disabled.
    SystemShutdown,
}

impl RecoveryLevel {
    /// The next rung, or `None` at the top.
    #[must_use]
    pub const fn next(self) -> Option<Self> {
        match self {
            Self::None => Some(Self::SmartRetry),
            Self::SmartRetry => Some(Self::FreshStart),
            Self::FreshStart => Some(Self::MarketOrder),
            Self::MarketOrder => Some(Self::HumanEscalation),
            Self::HumanEscalation => Some(Self::SystemShutdown),
            Self::SystemShutdown => None,
        }
    }

    /// Whether the bot places orders at this level.
    #[must_use]
    pub const fn is_automated(self) -> bool {
        matches!(self, Self::SmartRetry | Self::FreshStart | Self::MarketOrder)
    }

    /// Label for logs and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::SmartRetry => "smart_retry",
            Self::FreshStart => "fresh_start",
            Self::MarketOrder => "market_order",
            Self::HumanEscalation => "human_escalation",
            Self::SystemShutdown => "system_shutdown",
        }
    }
}

// =============================================================================
// Alerts
// =============================================================================

/// An exit order reported by the trading loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExitAttempt {
    /// Broker order id.
    pub order_id: String,
    /// Submission time.
    pub submitted_at: DateTime<Utc>,
    /// Order type.
    pub order_type: OrderType,
    /// Limit price, if any.
    pub price: Option<Decimal>,
    /// Last known status.
    pub status: OrderStatus,
}

impl ExitAttempt {
    /// Whether the attempt failed outright.
    #[must_use]
    pub const fn failed(&self) -> bool {
        matches!(self.status, OrderStatus::Rejected | OrderStatus::Cancelled)
    }

    /// Whether the attempt is still working past `timeout`.
    #[must_use]
    pub fn overdue(&self, now: DateTime<Utc>, timeout: std::time::Duration) -> bool {
        self.status.is_active() && elapsed_between(self.submitted_at, now) > timeout
    }
}

/// Snapshot of a troubled position at detection. Immutable once logged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StuckPositionAlert {
    /// Position identity.
    pub position_id: String,
    /// Symbol.
    pub symbol: String,
    /// Signed quantity.
    pub quantity: Decimal,
    /// Entry price.
    pub entry_price: Decimal,
    /// Direction.
    pub side: PositionSide,
    /// When the position was opened.
    pub entry_timestamp: DateTime<Utc>,
    /// Price at detection.
    pub current_price: Decimal,
    /// Unrealized P&L at detection.
    #[serde(rename = "unrealizedPnL")]
    pub unrealized_pnl: Decimal,
    /// Why it is unhealthy.
    pub classification: PositionClassification,
    /// Detection time.
    pub detection_timestamp: DateTime<Utc>,
    /// Human-readable reason.
    pub reason: String,
    /// Exit attempts known at detection.
    pub exit_attempts: Vec<ExitAttempt>,
}

// =============================================================================
// Recovery State
// =============================================================================

/// What a recovery action did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecoveryActionType {
    /// Moved to a new level.
    LevelEntered,
    /// Cancelled a previous exit order.
    CancelOrder,
    /// Resubmitted the exit at an adjusted limit.
    AdjustedLimit,
    /// Replaced the exit with a limit at the current market.
    ReplaceAtMarket,
    /// Sent an immediate market exit.
    MarketExit,
    /// Paged an operator.
    PageOperator,
    /// Disabled all trading.
    DisableTrading,
}

/// Outcome of a recovery action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionResult {
    /// Done.
    Succeeded,
    /// Order accepted but not yet filled.
    Working,
    /// Failed.
    Failed,
    /// Refused by the emergency order gate.
    Blocked,
}

/// One step taken on a recovery. Append-only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryAction {
    /// When.
    pub timestamp: DateTime<Utc>,
    /// Level in force.
    pub level: RecoveryLevel,
    /// What.
    pub action_type: RecoveryActionType,
    /// Order involved.
    pub order_id: Option<String>,
    /// Price involved.
    pub price: Option<Decimal>,
    /// Outcome.
    pub result: ActionResult,
    /// Free text.
    pub notes: Option<String>,
}

/// Live recovery for one position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionRecoveryState {
    /// Position identity.
    pub position_id: String,
    /// Alert that opened the incident.
    pub alert: StuckPositionAlert,
    /// Current rung. Never decreases.
    pub current_level: RecoveryLevel,
    /// Incident start.
    pub recovery_start_time: DateTime<Utc>,
    /// When the current level was entered.
    pub last_escalation_time: DateTime<Utc>,
    /// Attempts at the current level.
    pub attempt_count: u32,
    /// Every action, in order.
    pub actions: Vec<RecoveryAction>,
    /// Whether the position is confirmed flat.
    pub resolved: bool,
    /// When it was confirmed flat.
    pub resolved_time: Option<DateTime<Utc>>,
    /// Price of the last exit fill.
    pub final_exit_price: Option<Decimal>,
    /// Cost versus the detection price.
    pub slippage_cost: Option<Decimal>,
    /// Exit order currently working, if any.
    pub active_order_id: Option<String>,
    /// Last automated attempt.
    pub last_attempt_at: Option<DateTime<Utc>>,
}

impl PositionRecoveryState {
    /// Open a recovery at level `None`.
    #[must_use]
    pub fn open(alert: StuckPositionAlert) -> Self {
        let at = alert.detection_timestamp;
        Self {
            position_id: alert.position_id.clone(),
            alert,
            current_level: RecoveryLevel::None,
            recovery_start_time: at,
            last_escalation_time: at,
            attempt_count: 0,
            actions: Vec::new(),
            resolved: false,
            resolved_time: None,
            final_exit_price: None,
            slippage_cost: None,
            active_order_id: None,
            last_attempt_at: None,
        }
    }

    /// Move up the ladder. Refuses to stay put or go down.
    pub fn escalate_to(
        &mut self,
        level: RecoveryLevel,
        at: DateTime<Utc>,
    ) -> Result<(), EscalationError> {
        if level <= self.current_level {
            return Err(EscalationError::LevelRegression {
                from: self.current_level,
                to: level,
            });
        }
        self.current_level = level;
        self.last_escalation_time = at;
        self.attempt_count = 0;
        self.last_attempt_at = None;
        self.record(RecoveryAction {
            timestamp: at,
            level,
            action_type: RecoveryActionType::LevelEntered,
            order_id: None,
            price: None,
            result: ActionResult::Succeeded,
            notes: None,
        });
        Ok(())
    }

    /// Append an action.
    pub fn record(&mut self, action: RecoveryAction) {
        self.actions.push(action);
    }

    /// Whether any bot exit order was sent.
    #[must_use]
    pub fn bot_sent_orders(&self) -> bool {
        self.actions.iter().any(|a| {
            a.order_id.is_some()
                && matches!(
                    a.action_type,
                    RecoveryActionType::AdjustedLimit
                        | RecoveryActionType::ReplaceAtMarket
                        | RecoveryActionType::MarketExit
                )
        })
    }
}

// =============================================================================
// Incidents
// =============================================================================

/// How an incident ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FinalOutcome {
    /// Closed by an automated rung.
    ResolvedAutomatically,
    /// Closed after an operator was paged.
    ResolvedAfterHumanEscalation,
    /// Closed after trading was shut down.
    ResolvedAfterShutdown,
    /// Went flat without any bot exit order.
    ClosedExternally,
}

/// Post-incident record. Produced exactly once at resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryIncident {
    /// Unique id.
    pub incident_id: String,
    /// Position identity.
    pub position_id: String,
    /// Symbol.
    pub symbol: String,
    /// Entry price.
    pub entry_price: Decimal,
    /// Signed quantity at detection.
    pub quantity: Decimal,
    /// Detection time.
    pub detection_timestamp: DateTime<Utc>,
    /// Classification at detection.
    pub classification: PositionClassification,
    /// Every action taken.
    pub actions: Vec<RecoveryAction>,
    /// How it ended.
    pub final_outcome: FinalOutcome,
    /// Detection to resolution.
    pub total_recovery_time_seconds: f64,
    /// `(detection price - exit price) * quantity`; positive is a cost.
    pub slippage_cost: Option<Decimal>,
    /// Highest rung reached.
    pub max_level_reached: RecoveryLevel,
    /// Whether an operator had to be involved.
    pub required_human_intervention: bool,
}

impl RecoveryIncident {
    /// Build the incident for a resolved recovery.
    #[must_use]
    pub fn from_resolved(state: &PositionRecoveryState) -> Self {
        let resolved_at = state.resolved_time.unwrap_or(state.last_escalation_time);
        let final_outcome = if !state.bot_sent_orders() {
            FinalOutcome::ClosedExternally
        } else {
            match state.current_level {
                RecoveryLevel::SystemShutdown => FinalOutcome::ResolvedAfterShutdown,
                RecoveryLevel::HumanEscalation => FinalOutcome::ResolvedAfterHumanEscalation,
                _ => FinalOutcome::ResolvedAutomatically,
            }
        };
        Self {
            incident_id: Uuid::new_v4().to_string(),
            position_id: state.position_id.clone(),
            symbol: state.alert.symbol.clone(),
            entry_price: state.alert.entry_price,
            quantity: state.alert.quantity,
            detection_timestamp: state.alert.detection_timestamp,
            classification: state.alert.classification,
            actions: state.actions.clone(),
            final_outcome,
            total_recovery_time_seconds: elapsed_between(
                state.alert.detection_timestamp,
                resolved_at,
            )
            .as_secs_f64(),
            slippage_cost: state.slippage_cost,
            max_level_reached: state.current_level,
            required_human_intervention: state.current_level >= RecoveryLevel::HumanEscalation,
        }
    }
}

/// Slippage of an exit versus the price at detection. Positive is a cost.
#[must_use]
pub fn slippage(detection_price: Decimal, exit_price: Decimal, quantity: Decimal) -> Decimal {
    (detection_price - exit_price) * quantity
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn alert() -> StuckPositionAlert {
        StuckPositionAlert {
            position_id: "orb:ES".to_string(),
            symbol: "ES".to_string(),
            quantity: dec!(2),
            entry_price: dec!(5000),
            side: PositionSide::Long,
            entry_timestamp: Utc::now(),
            current_price: dec!(4990),
            unrealized_pnl: dec!(-1000),
            classification: PositionClassification::AgedOut,
            detection_timestamp: Utc::now(),
            reason: "held too long".to_string(),
            exit_attempts: Vec::new(),
        }
    }

    #[test]
    fn test_ladder_order() {
        let mut level = RecoveryLevel::None;
        let mut seen = vec![level];
        while let Some(next) = level.next() {
            assert!(next > level);
            level = next;
            seen.push(level);
        }
        assert_eq!(seen.len(), 6);
        assert_eq!(level, RecoveryLevel::SystemShutdown);
    }

    #[test]
    fn test_escalation_is_monotonic() {
        let mut state = PositionRecoveryState::open(alert());
        let now = Utc::now();
        state.escalate_to(RecoveryLevel::SmartRetry, now).unwrap();
        state.escalate_to(RecoveryLevel::MarketOrder, now).unwrap();

        let Err(err) = state.escalate_to(RecoveryLevel::FreshStart, now) else {
            panic!("regression must be refused");
        };
        assert!(matches!(err, EscalationError::LevelRegression { .. }));
        assert!(state.escalate_to(RecoveryLevel::MarketOrder, now).is_err());
        assert_eq!(state.current_level, RecoveryLevel::MarketOrder);
        assert_eq!(state.actions.len(), 2);
    }

    #[test]
    fn test_slippage_sign() {
        assert_eq!(slippage(dec!(5000), dec!(4998), dec!(2)), dec!(4));
        assert_eq!(slippage(dec!(5000), dec!(5002), dec!(-1)), dec!(2));
        assert_eq!(slippage(dec!(5000), dec!(5001), dec!(1)), dec!(-1));
    }

    #[test]
    fn test_incident_without_bot_orders_closed_externally() {
        let mut state = PositionRecoveryState::open(alert());
        state
            .escalate_to(RecoveryLevel::SmartRetry, Utc::now())
            .unwrap();
        state.resolved = true;
        state.resolved_time = Some(state.recovery_start_time + chrono::TimeDelta::seconds(12));

        let incident = RecoveryIncident::from_resolved(&state);
        assert_eq!(incident.final_outcome, FinalOutcome::ClosedExternally);
        assert_eq!(incident.total_recovery_time_seconds, 12.0);
        assert!(!incident.required_human_intervention);
    }
}
