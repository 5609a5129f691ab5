//! Emergency liquidation.
//!
//! Flattens every open position, cancels resting orders, disables all
//! strategies and writes a critical alert. Each step runs even if the
//! previous one failed; one position's failure never stops another's.
//!
//! ```text
//! raise flag ─► IOC market per position ──unfilled──► marketable limit (backoff)
//!                        │                                   │
//!                        └──────────────┬────────────────────┘
//!                                       ▼
//!     cancel resting orders (local + broker) ─► disable strategies ─► alert
//! ```
//!
//! Only quantity the broker reports as filled counts. An IOC acknowledged as
//! working is cancelled before the next order goes out, so a late fill can
//! never stack on top of the backup path.
//!
//! Broker calls share one overall deadline. When it expires the remaining
//! broker work is abandoned, the strategy and alert steps still run, and the
//! report says what was left undone.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use futures::future::join_all;
use rust_decimal::Decimal;
use rust_decimal::prelude::Signed;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{error, info, warn};

use super::backoff::{BackupRetryPolicy, ExponentialBackoff};
use super::emergency::{EmergencyFlag, EmergencyRecord, TriggerSource};
use crate::clock::Clock;
use crate::config::EmergencyConfig;
use crate::models::{OrderSide, OrderStatus, Position, TimeInForce};
use crate::observability::metrics;
use crate::ports::{
    AlertSink, BrokerError, OrderAck, OrderExecutionGateway, OrderRequest, StrategyController,
};
use crate::state::TradingState;

/// How a position was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LiquidationPath {
    /// Flattened by the IOC market order.
    Primary,
    /// Flattened by the marketable-limit backup path.
    Backup,
    /// Still open after both paths.
    Failed,
}

impl LiquidationPath {
    /// Label for logs and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Backup => "backup",
            Self::Failed => "failed",
        }
    }
}

/// Outcome for one position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PositionLiquidation {
    /// Symbol.
    pub symbol: String,
    /// Signed quantity before liquidation.
    pub quantity: Decimal,
    /// Path that closed it, or `Failed`.
    pub path: LiquidationPath,
    /// Broker ids of every order sent for this position.
    pub order_ids: Vec<String>,
    /// Unsigned quantity still open.
    pub remaining: Decimal,
    /// Errors seen along the way.
    pub errors: Vec<String>,
}

/// A resting order that could not be cancelled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CancelFailure {
    /// Broker order id.
    pub order_id: String,
    /// Error text.
    pub error: String,
}

/// Result of a liquidation run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LiquidationReport {
    /// Trigger.
    pub source: TriggerSource,
    /// Reason given by the trigger.
    pub reason: String,
    /// Start time.
    pub started_at: DateTime<Utc>,
    /// End time.
    pub finished_at: DateTime<Utc>,
    /// Per-position outcomes.
    pub positions: Vec<PositionLiquidation>,
    /// Resting orders cancelled (or already gone).
    pub orders_cancelled: usize,
    /// Resting orders that could not be cancelled.
    pub cancel_failures: Vec<CancelFailure>,
    /// Whether the broker's open-order list was available to cancel from.
    pub broker_orders_listed: bool,
    /// Whether `disable_all` succeeded.
    pub strategies_disabled: bool,
    /// Whether the alert was written.
    pub alert_delivered: bool,
    /// Whether the overall deadline expired during broker work.
    pub deadline_expired: bool,
    /// Set when another run was already underway and this call did nothing.
    pub skipped: bool,
}

impl LiquidationReport {
    fn skipped(source: TriggerSource, reason: &str, at: DateTime<Utc>) -> Self {
        Self {
            source,
            reason: reason.to_string(),
            started_at: at,
            finished_at: at,
            positions: Vec::new(),
            orders_cancelled: 0,
            cancel_failures: Vec::new(),
            broker_orders_listed: false,
            strategies_disabled: false,
            alert_delivered: false,
            deadline_expired: false,
            skipped: true,
        }
    }

    /// Whether every position was flattened.
    #[must_use]
    pub fn fully_flat(&self) -> bool {
        self.positions
            .iter()
            .all(|p| p.path != LiquidationPath::Failed)
    }

    /// Number of positions that went through a given path.
    #[must_use]
    pub fn count_path(&self, path: LiquidationPath) -> usize {
        self.positions.iter().filter(|p| p.path == path).count()
    }
}

/// Result of halting trading without flattening.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HaltReport {
    /// Trigger.
    pub source: TriggerSource,
    /// Reason.
    pub reason: String,
    /// Whether this call raised the emergency flag.
    pub newly_activated: bool,
    /// Whether `disable_all` succeeded.
    pub strategies_disabled: bool,
    /// Whether the alert was written.
    pub alert_delivered: bool,
}

/// Resets the in-progress marker when a run ends, including on panic.
struct RunGuard<'a>(&'a AtomicBool);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Flattens everything and halts trading.
pub struct EmergencyLiquidator {
    state: Arc<TradingState>,
    gateway: Arc<dyn OrderExecutionGateway>,
    strategies: Arc<dyn StrategyController>,
    alerts: Arc<dyn AlertSink>,
    flag: Arc<EmergencyFlag>,
    clock: Arc<dyn Clock>,
    config: EmergencyConfig,
    retry: BackupRetryPolicy,
    in_progress: AtomicBool,
}

impl EmergencyLiquidator {
    /// Create a liquidator.
    #[must_use]
    pub fn new(
        state: Arc<TradingState>,
        gateway: Arc<dyn OrderExecutionGateway>,
        strategies: Arc<dyn StrategyController>,
        alerts: Arc<dyn AlertSink>,
        flag: Arc<EmergencyFlag>,
        clock: Arc<dyn Clock>,
        config: EmergencyConfig,
    ) -> Self {
        let retry = config.to_backup_retry_policy();
        Self {
            state,
            gateway,
            strategies,
            alerts,
            flag,
            clock,
            config,
            retry,
            in_progress: AtomicBool::new(false),
        }
    }

    /// The emergency flag this liquidator raises.
    #[must_use]
    pub fn flag(&self) -> &Arc<EmergencyFlag> {
        &self.flag
    }

    /// Whether emergency mode is active.
    #[must_use]
    pub fn is_emergency_active(&self) -> bool {
        self.flag.is_active()
    }

    /// Whether a liquidation run is underway.
    #[must_use]
    pub fn is_in_progress(&self) -> bool {
        self.in_progress.load(Ordering::SeqCst)
    }

    /// Flatten every open position and halt trading.
    pub async fn liquidate_all(&self, source: TriggerSource, reason: &str) -> LiquidationReport {
        if self.in_progress.swap(true, Ordering::SeqCst) {
            warn!(source = source.as_str(), "Emergency liquidation already in progress");
            return LiquidationReport::skipped(source, reason, self.clock.now());
        }
        let _guard = RunGuard(&self.in_progress);

        let started_at = self.clock.now();
        self.flag.activate(EmergencyRecord {
            activated_at: started_at,
            source,
            reason: reason.to_string(),
        });

        let deadline = Instant::now() + self.config.liquidation_deadline();
        let positions = self.state.open_positions();

        error!(
            source = source.as_str(),
            reason = %reason,
            positions = positions.len(),
            "Starting emergency liquidation"
        );

        let outcomes = join_all(positions.iter().map(|p| self.flatten(p, deadline))).await;
        for outcome in &outcomes {
            metrics::record_liquidation(outcome.path.as_str());
        }

        let (orders_cancelled, cancel_failures, broker_orders_listed) =
            self.cancel_resting(&positions, deadline).await;
        let deadline_expired = Instant::now() >= deadline;
        if deadline_expired {
            warn!("Liquidation deadline expired, continuing with partial result");
        }

        let strategies_disabled = self.disable_strategies(reason).await;

        let failed = outcomes
            .iter()
            .filter(|o| o.path == LiquidationPath::Failed)
            .count();
        let message = format!(
            "CRITICAL EMERGENCY LIQUIDATION source={} reason=\"{}\" positions={} flattened={} failed={} orders_cancelled={} cancel_failures={} broker_orders_listed={} strategies_disabled={} deadline_expired={}",
            source.as_str(),
            reason,
            outcomes.len(),
            outcomes.len() - failed,
            failed,
            orders_cancelled,
            cancel_failures.len(),
            broker_orders_listed,
            strategies_disabled,
            deadline_expired,
        );
        let alert_delivered = self.send_alert(&message);

        let report = LiquidationReport {
            source,
            reason: reason.to_string(),
            started_at,
            finished_at: self.clock.now(),
            positions: outcomes,
            orders_cancelled,
            cancel_failures,
            broker_orders_listed,
            strategies_disabled,
            alert_delivered,
            deadline_expired,
            skipped: false,
        };

        info!(
            primary = report.count_path(LiquidationPath::Primary),
            backup = report.count_path(LiquidationPath::Backup),
            failed = report.count_path(LiquidationPath::Failed),
            orders_cancelled = report.orders_cancelled,
            "Emergency liquidation completed"
        );

        report
    }

    /// Raise the flag, disable strategies and alert, without flattening.
    pub async fn halt_trading(&self, source: TriggerSource, reason: &str) -> HaltReport {
        let newly_activated = self.flag.activate(EmergencyRecord {
            activated_at: self.clock.now(),
            source,
            reason: reason.to_string(),
        });
        let strategies_disabled = self.disable_strategies(reason).await;
        let alert_delivered = self.send_alert(&format!(
            "CRITICAL TRADING HALTED source={} reason=\"{}\" strategies_disabled={}",
            source.as_str(),
            reason,
            strategies_disabled
        ));

        HaltReport {
            source,
            reason: reason.to_string(),
            newly_activated,
            strategies_disabled,
            alert_delivered,
        }
    }

    /// Write a critical alert through the liquidator's alert sink.
    pub fn alert(&self, message: &str) -> bool {
        self.send_alert(message)
    }

    /// Operator action: leave emergency mode.
    pub fn clear_emergency(&self, operator: &str) -> std::io::Result<bool> {
        let was_active = self.flag.clear(operator)?;
        if was_active {
            self.send_alert(&format!("EMERGENCY MODE CLEARED by {operator}"));
        }
        Ok(was_active)
    }

    async fn flatten(&self, position: &Position, deadline: Instant) -> PositionLiquidation {
        let side = position.closing_side();
        let mut remaining = position.quantity.abs();
        let mut order_ids = Vec::new();
        let mut errors = Vec::new();

        let mut settled = true;
        let request = OrderRequest::market_ioc(&position.symbol, side, remaining);
        match self.call(deadline, "submit", self.gateway.submit(request)).await {
            Ok(ack) => {
                order_ids.push(ack.order_id.clone());
                let filled = filled_quantity(&ack, remaining);
                remaining -= filled;
                if ack.status == OrderStatus::Rejected {
                    errors.push(format!("primary rejected: {}", ack.order_id));
                }
                settled = self.cancel_unfilled(&ack, deadline, &mut errors).await;
            }
            Err(e) => {
                warn!(symbol = %position.symbol, error = %e, "Primary liquidation order failed");
                errors.push(format!("primary: {e}"));
            }
        }

        let path = if remaining <= Decimal::ZERO {
            LiquidationPath::Primary
        } else if !settled {
            // A live order may still fill.
            LiquidationPath::Failed
        } else {
            remaining = self
                .backup(position, side, remaining, deadline, &mut order_ids, &mut errors)
                .await;
            if remaining <= Decimal::ZERO {
                LiquidationPath::Backup
            } else {
                LiquidationPath::Failed
            }
        };

        if remaining <= Decimal::ZERO {
            self.state.remove_position(&position.symbol);
        } else {
            let signed = remaining * position.quantity.signum();
            self.state
                .update_position(&position.symbol, |p| p.quantity = signed);
            error!(
                symbol = %position.symbol,
                remaining = %remaining,
                "Position still open after emergency liquidation"
            );
        }

        PositionLiquidation {
            symbol: position.symbol.clone(),
            quantity: position.quantity,
            path,
            order_ids,
            remaining: remaining.max(Decimal::ZERO),
            errors,
        }
    }

    /// Marketable limit orders with backoff. Returns the quantity still open.
    async fn backup(
        &self,
        position: &Position,
        side: OrderSide,
        mut remaining: Decimal,
        deadline: Instant,
        order_ids: &mut Vec<String>,
        errors: &mut Vec<String>,
    ) -> Decimal {
        let reference = self.reference_price(position);
        let offset = self.config.backup_limit_offset();
        let limit_price = match side {
            OrderSide::Sell => reference * (Decimal::ONE - offset),
            OrderSide::Buy => reference * (Decimal::ONE + offset),
        }
        .round_dp(2);

        let mut backoff = ExponentialBackoff::new(&self.retry);
        let mut attempts = 0;
        loop {
            attempts += 1;
            let request = OrderRequest::limit(&position.symbol, side, remaining, limit_price)
                .with_time_in_force(TimeInForce::Ioc);
            match self.call(deadline, "submit", self.gateway.submit(request)).await {
                Ok(ack) => {
                    order_ids.push(ack.order_id.clone());
                    remaining -= filled_quantity(&ack, remaining);
                    if ack.status == OrderStatus::Rejected {
                        errors.push(format!("backup attempt {attempts} rejected"));
                    }
                    if !self.cancel_unfilled(&ack, deadline, errors).await {
                        break;
                    }
                }
                Err(e) => errors.push(format!("backup attempt {attempts}: {e}")),
            }

            if remaining <= Decimal::ZERO || attempts >= self.retry.max_attempts {
                break;
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let Some(delay) = backoff.next_backoff() else {
                break;
            };
            tokio::time::sleep(delay.min(deadline - now)).await;
        }

        info!(
            symbol = %position.symbol,
            attempts,
            remaining = %remaining,
            limit_price = %limit_price,
            "Backup liquidation path finished"
        );
        remaining
    }

    fn reference_price(&self, position: &Position) -> Decimal {
        self.state
            .market_state()
            .last_prices
            .get(&position.symbol)
            .copied()
            .filter(|p| !p.is_zero())
            .unwrap_or(position.current_price)
    }

    /// Cancel an IOC the broker left working. Returns `false` if it may
    /// still be live.
    async fn cancel_unfilled(
        &self,
        ack: &OrderAck,
        deadline: Instant,
        errors: &mut Vec<String>,
    ) -> bool {
        if !ack.status.is_active() {
            return true;
        }
        warn!(
            order_id = %ack.order_id,
            status = ?ack.status,
            filled = %ack.filled_qty,
            "Liquidation IOC left working, cancelling"
        );
        errors.push(format!("{} unfilled: {:?}", ack.order_id, ack.status));
        match self
            .call(deadline, "cancel", self.gateway.cancel(&ack.order_id))
            .await
        {
            Ok(()) | Err(BrokerError::OrderNotFound { .. }) => true,
            Err(e) => {
                error!(order_id = %ack.order_id, error = %e, "Could not cancel working liquidation order");
                errors.push(format!("cancel {}: {e}", ack.order_id));
                false
            }
        }
    }

    /// Cancel every order known locally or still working at the broker.
    async fn cancel_resting(
        &self,
        positions: &[Position],
        deadline: Instant,
    ) -> (usize, Vec<CancelFailure>, bool) {
        let mut ids: BTreeSet<String> = self
            .state
            .pending_orders()
            .into_iter()
            .map(|o| o.order_id)
            .collect();
        for position in positions {
            ids.extend(position.stop_order_id.iter().cloned());
            ids.extend(position.target_order_id.iter().cloned());
        }
        let listed = match self
            .call(deadline, "open_orders", self.gateway.open_orders())
            .await
        {
            Ok(open) => {
                ids.extend(
                    open.into_iter()
                        .filter(|o| o.status.is_active())
                        .map(|o| o.order_id),
                );
                true
            }
            Err(e) => {
                error!(error = %e, "Broker open orders unavailable, cancelling known orders only");
                false
            }
        };

        let results = join_all(ids.iter().map(|id| async move {
            let result = self.call(deadline, "cancel", self.gateway.cancel(id)).await;
            (id, result)
        }))
        .await;

        let mut cancelled = 0;
        let mut failures = Vec::new();
        for (id, result) in results {
            match result {
                Ok(()) | Err(BrokerError::OrderNotFound { .. }) => {
                    self.state.remove_order(id);
                    cancelled += 1;
                }
                Err(e) => {
                    warn!(order_id = %id, error = %e, "Failed to cancel resting order");
                    failures.push(CancelFailure {
                        order_id: id.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }
        (cancelled, failures, listed)
    }

    async fn disable_strategies(&self, reason: &str) -> bool {
        match tokio::time::timeout(
            self.config.control_step_timeout(),
            self.strategies.disable_all(reason),
        )
        .await
        {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                error!(error = %e, "Failed to disable strategies");
                false
            }
            Err(_) => {
                error!("Timed out disabling strategies");
                false
            }
        }
    }

    fn send_alert(&self, message: &str) -> bool {
        match self.alerts.send(message) {
            Ok(()) => true,
            Err(e) => {
                error!(error = %e, alert = %message, "Failed to deliver critical alert");
                false
            }
        }
    }

    async fn call<T, F>(&self, deadline: Instant, operation: &str, fut: F) -> Result<T, BrokerError>
    where
        F: Future<Output = Result<T, BrokerError>>,
    {
        let until = deadline.min(Instant::now() + self.config.order_timeout());
        tokio::time::timeout_at(until, fut)
            .await
            .unwrap_or_else(|_| Err(BrokerError::timeout(operation)))
    }
}

/// Quantity an acknowledgment took off the position. Anything short of
/// `Filled` counts only the reported fills.
fn filled_quantity(ack: &OrderAck, requested: Decimal) -> Decimal {
    match ack.status {
        OrderStatus::Filled => requested,
        _ => ack.filled_qty.min(requested),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::infrastructure::{
        PaperBroker, RecordingAlertSink, RestingOrder, StateStrategyController,
    };
    use crate::models::{OrderType, PendingOrder, StrategyState};
    use crate::ports::MockStrategyController;
    use rust_decimal_macros::dec;

    struct Harness {
        state: Arc<TradingState>,
        broker: Arc<PaperBroker>,
        alerts: Arc<RecordingAlertSink>,
        liquidator: EmergencyLiquidator,
    }

    fn harness() -> Harness {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(Utc::now()));
        let state = Arc::new(TradingState::new());
        let broker = Arc::new(PaperBroker::new(clock.clone()));
        let alerts = Arc::new(RecordingAlertSink::default());
        let strategies = Arc::new(StateStrategyController::new(state.clone(), clock.clone()));
        let config = EmergencyConfig {
            backup_initial_backoff_ms: 1,
            ..Default::default()
        };
        let liquidator = EmergencyLiquidator::new(
            state.clone(),
            broker.clone(),
            strategies,
            alerts.clone(),
            Arc::new(EmergencyFlag::in_memory()),
            clock,
            config,
        );
        Harness {
            state,
            broker,
            alerts,
            liquidator,
        }
    }

    fn open(h: &Harness, symbol: &str, qty: Decimal, price: Decimal) {
        let now = Utc::now();
        h.state
            .upsert_position(Position::new(symbol, qty, price, now, "orb"));
        h.broker.set_position(symbol, qty, price);
        h.broker.set_price(symbol, price);
    }

    #[tokio::test]
    async fn test_liquidates_every_position_and_halts() {
        let h = harness();
        h.state
            .upsert_strategy(StrategyState::enabled("orb", Utc::now()));
        open(&h, "ES", dec!(2), dec!(5000));
        open(&h, "NQ", dec!(-1), dec!(18000));
        h.state.upsert_order(PendingOrder {
            order_id: "resting-1".to_string(),
            symbol: "ES".to_string(),
            side: OrderSide::Sell,
            quantity: dec!(2),
            order_type: OrderType::Limit,
            price: Some(dec!(5050)),
            status: OrderStatus::Working,
            submitted_at: Utc::now(),
        });

        let report = h
            .liquidator
            .liquidate_all(TriggerSource::StaleRecovery, "snapshot 5 minutes old")
            .await;

        assert!(report.fully_flat());
        assert_eq!(report.count_path(LiquidationPath::Primary), 2);
        assert_eq!(h.state.open_position_count(), 0);
        assert_eq!(h.state.pending_order_count(), 0);
        assert!(h.state.all_strategies_disabled());
        assert!(report.strategies_disabled);
        assert!(report.alert_delivered);
        assert!(h.liquidator.is_emergency_active());

        let market_orders = h.broker.submitted_market_orders();
        assert_eq!(market_orders.len(), 2);
        assert!(
            market_orders
                .iter()
                .all(|o| o.time_in_force == TimeInForce::Ioc)
        );
        assert_eq!(h.alerts.messages().len(), 1);
        assert!(h.alerts.messages()[0].contains("CRITICAL EMERGENCY LIQUIDATION"));
    }

    #[tokio::test]
    async fn test_rejected_primary_uses_backup_for_that_position_only() {
        let h = harness();
        open(&h, "ES", dec!(1), dec!(5000));
        open(&h, "NQ", dec!(1), dec!(18000));
        h.broker.reject_market_orders_for("ES");

        let report = h
            .liquidator
            .liquidate_all(TriggerSource::HeartbeatFreeze, "freeze")
            .await;

        let es = report.positions.iter().find(|p| p.symbol == "ES").unwrap();
        let nq = report.positions.iter().find(|p| p.symbol == "NQ").unwrap();
        assert_eq!(es.path, LiquidationPath::Backup);
        assert_eq!(nq.path, LiquidationPath::Primary);
        assert!(report.fully_flat());
    }

    #[tokio::test]
    async fn test_total_rejection_reports_failure_but_still_halts() {
        let h = harness();
        open(&h, "ES", dec!(1), dec!(5000));
        h.broker.reject_all_orders_for("ES");

        let report = h
            .liquidator
            .liquidate_all(TriggerSource::UnhandledFault, "panic")
            .await;

        assert!(!report.fully_flat());
        assert_eq!(report.positions[0].remaining, dec!(1));
        assert!(h.state.position("ES").is_some());
        assert!(report.strategies_disabled);
        assert!(report.alert_delivered);
        assert!(h.liquidator.is_emergency_active());
    }

    #[tokio::test]
    async fn test_working_ioc_is_not_counted_as_flat() {
        let h = harness();
        open(&h, "ES", dec!(1), dec!(5000));
        h.broker.hold_fills_for("ES");

        let report = h
            .liquidator
            .liquidate_all(TriggerSource::HeartbeatFreeze, "freeze")
            .await;

        let es = &report.positions[0];
        assert_eq!(es.path, LiquidationPath::Failed);
        assert_eq!(es.remaining, dec!(1));
        assert!(!report.fully_flat());
        // The backup path ran after the primary was left working.
        assert_eq!(h.broker.submitted_market_orders().len(), 1);
        assert!(h.broker.submitted().len() > 1);
        // Nothing is left working that could fill later.
        assert!(h.broker.resting_orders().is_empty());
        assert_eq!(h.broker.position_quantity("ES"), dec!(1));
        assert_eq!(h.state.position("ES").map(|p| p.quantity), Some(dec!(1)));
    }

    #[test]
    fn test_filled_quantity_counts_only_reported_fills() {
        let ack = |status, filled| OrderAck {
            order_id: "paper-1".to_string(),
            client_order_id: String::new(),
            symbol: "ES".to_string(),
            order_type: OrderType::Market,
            status,
            filled_qty: filled,
            avg_fill_price: None,
        };

        assert_eq!(filled_quantity(&ack(OrderStatus::Filled, dec!(0)), dec!(2)), dec!(2));
        assert_eq!(filled_quantity(&ack(OrderStatus::Working, dec!(0)), dec!(2)), dec!(0));
        assert_eq!(filled_quantity(&ack(OrderStatus::Submitted, dec!(0)), dec!(2)), dec!(0));
        assert_eq!(
            filled_quantity(&ack(OrderStatus::PartiallyFilled, dec!(1)), dec!(2)),
            dec!(1)
        );
        assert_eq!(filled_quantity(&ack(OrderStatus::Cancelled, dec!(1)), dec!(2)), dec!(1));
    }

    #[tokio::test]
    async fn test_cancels_orders_only_the_broker_knows() {
        let h = harness();
        open(&h, "ES", dec!(1), dec!(5000));
        h.broker.add_resting(RestingOrder {
            order_id: "unknown-1".to_string(),
            symbol: "ES".to_string(),
            side: OrderSide::Buy,
            quantity: dec!(1),
            order_type: OrderType::Limit,
            price: Some(dec!(4900)),
        });

        let report = h
            .liquidator
            .liquidate_all(TriggerSource::StaleRecovery, "snapshot stale")
            .await;

        assert!(report.fully_flat());
        assert!(report.broker_orders_listed);
        assert_eq!(report.orders_cancelled, 1);
        assert!(report.cancel_failures.is_empty());
        assert!(h.broker.resting_orders().is_empty());
        assert_eq!(h.broker.cancelled(), vec!["unknown-1".to_string()]);
    }

    #[tokio::test]
    async fn test_concurrent_run_is_skipped() {
        let h = harness();
        open(&h, "ES", dec!(1), dec!(5000));
        h.broker.set_latency(std::time::Duration::from_millis(50));

        let (first, second) = tokio::join!(
            h.liquidator
                .liquidate_all(TriggerSource::HeartbeatFreeze, "first"),
            h.liquidator
                .liquidate_all(TriggerSource::HeartbeatFreeze, "second"),
        );

        assert!(!first.skipped);
        assert!(second.skipped);
        assert_eq!(h.broker.submitted_market_orders().len(), 1);
    }

    #[tokio::test]
    async fn test_halt_trading_does_not_flatten() {
        let h = harness();
        open(&h, "ES", dec!(1), dec!(5000));

        let report = h
            .liquidator
            .halt_trading(TriggerSource::EscalationShutdown, "ladder exhausted")
            .await;

        assert!(report.newly_activated);
        assert!(h.liquidator.is_emergency_active());
        assert!(h.broker.submitted().is_empty());
        assert!(h.state.position("ES").is_some());
    }

    #[tokio::test]
    async fn test_strategy_failure_does_not_stop_alert() {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(Utc::now()));
        let state = Arc::new(TradingState::new());
        let broker = Arc::new(PaperBroker::new(clock.clone()));
        let alerts = Arc::new(RecordingAlertSink::default());
        let mut strategies = MockStrategyController::new();
        strategies.expect_disable_all().times(1).returning(|_| {
            Err(crate::ports::StrategyControlError {
                message: "controller offline".to_string(),
            })
        });
        let liquidator = EmergencyLiquidator::new(
            state,
            broker,
            Arc::new(strategies),
            alerts.clone(),
            Arc::new(EmergencyFlag::in_memory()),
            clock,
            EmergencyConfig::default(),
        );

        let report = liquidator
            .liquidate_all(TriggerSource::UnhandledFault, "panic")
            .await;

        assert!(!report.strategies_disabled);
        assert!(report.alert_delivered);
        assert_eq!(alerts.messages().len(), 1);
    }

    #[tokio::test]
    async fn test_clear_emergency() {
        let h = harness();
        h.liquidator
            .halt_trading(TriggerSource::EscalationShutdown, "test")
            .await;

        assert!(h.liquidator.clear_emergency("ops").unwrap());
        assert!(!h.liquidator.is_emergency_active());
        assert!(!h.liquidator.clear_emergency("ops").unwrap());
    }
}
