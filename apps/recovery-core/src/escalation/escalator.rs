//! Stuck-position escalation ladder.
//!
//! ```text
//! detect ─► SmartRetry ─► FreshStart ─► MarketOrder ─► HumanEscalation ─► SystemShutdown
//!              │              │              │                │
//!              └──────────────┴──────────────┴── flat at broker and locally ─► incident
//! ```
//!
//! Each automated rung is bounded by attempts and by a time window. Levels
//! only move up. An incident stays open until the position is flat both in
//! local state and at the broker; the incident record is written exactly
//! once at that point.
//!
//! The broker's position report wins over local state. A flat report clears
//! the local record and resolves the incident without sending anything, and
//! a working exit that has vanished holds back the next order until the
//! broker confirms what is left.
//!
//! Every order the ladder sends goes through the emergency order gate.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::future::join_all;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::classifier::{PositionClassifier, reference_price};
use super::incidents::IncidentLog;
use super::types::{
    ActionResult, ExitAttempt, PositionRecoveryState, RecoveryAction, RecoveryActionType,
    RecoveryIncident, RecoveryLevel, StuckPositionAlert, slippage,
};
use crate::clock::{Clock, elapsed_between};
use crate::config::{EscalationConfig, LevelPolicy};
use crate::models::{
    BrokerPosition, OrderSide, OrderStatus, OrderType, Position, PositionSide,
};
use crate::observability::metrics;
use crate::pool::WorkerPool;
use crate::ports::{
    AlertSink, BrokerError, BrokerPositionProvider, OrderExecutionGateway, OrderRequest,
};
use crate::recovery::{EmergencyLiquidator, TriggerSource};
use crate::state::TradingState;

/// Result of one evaluation pass.
#[derive(Debug, Clone, Default)]
pub struct EvaluationSummary {
    /// Positions looked at, local and ghost.
    pub evaluated: usize,
    /// Incidents opened this pass.
    pub opened: Vec<StuckPositionAlert>,
    /// Level changes this pass, as `(symbol, new level)`.
    pub escalations: Vec<(String, RecoveryLevel)>,
    /// Incidents closed this pass.
    pub resolved: Vec<RecoveryIncident>,
    /// Recoveries skipped because another pass held them.
    pub busy: usize,
    /// Whether broker positions were available.
    pub broker_available: bool,
}

/// Per-pass inputs shared by every recovery.
struct Cycle<'a> {
    now: DateTime<Utc>,
    broker: Option<&'a HashMap<String, BrokerPosition>>,
    last_prices: &'a std::collections::BTreeMap<String, Decimal>,
}

enum StepOutcome {
    Busy,
    Progress(Vec<RecoveryLevel>),
    Resolved(Box<RecoveryIncident>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CancelOutcome {
    Cancelled,
    /// Not working at the broker any more: filled or cancelled elsewhere.
    AlreadyGone,
    Failed,
}

/// Detects troubled positions and walks each one up the recovery ladder.
pub struct StuckPositionEscalator {
    state: Arc<TradingState>,
    broker: Arc<dyn BrokerPositionProvider>,
    gateway: Arc<dyn OrderExecutionGateway>,
    liquidator: Arc<EmergencyLiquidator>,
    alerts: Arc<dyn AlertSink>,
    clock: Arc<dyn Clock>,
    config: EscalationConfig,
    classifier: PositionClassifier,
    incidents: Option<IncidentLog>,
    pool: Option<Arc<WorkerPool>>,
    recoveries: DashMap<String, Arc<AsyncMutex<PositionRecoveryState>>>,
    exit_attempts: DashMap<String, Vec<ExitAttempt>>,
    history: Mutex<Vec<RecoveryIncident>>,
}

impl StuckPositionEscalator {
    /// Create an escalator.
    #[must_use]
    pub fn new(
        state: Arc<TradingState>,
        broker: Arc<dyn BrokerPositionProvider>,
        gateway: Arc<dyn OrderExecutionGateway>,
        liquidator: Arc<EmergencyLiquidator>,
        alerts: Arc<dyn AlertSink>,
        clock: Arc<dyn Clock>,
        config: EscalationConfig,
    ) -> Self {
        Self {
            state,
            broker,
            gateway,
            liquidator,
            alerts,
            clock,
            classifier: PositionClassifier::new(config.clone()),
            config,
            incidents: None,
            pool: None,
            recoveries: DashMap::new(),
            exit_attempts: DashMap::new(),
            history: Mutex::new(Vec::new()),
        }
    }

    /// Archive alerts and incidents to `log`.
    #[must_use]
    pub fn with_incident_log(mut self, log: IncidentLog) -> Self {
        self.incidents = Some(log);
        self
    }

    /// Take a worker permit for each recovery step.
    #[must_use]
    pub fn with_pool(mut self, pool: Arc<WorkerPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Report an exit order placed by the trading loop. Replaces any earlier
    /// report for the same order id.
    pub fn record_exit_attempt(&self, symbol: &str, attempt: ExitAttempt) {
        let mut attempts = self.exit_attempts.entry(symbol.to_string()).or_default();
        match attempts.iter_mut().find(|a| a.order_id == attempt.order_id) {
            Some(existing) => *existing = attempt,
            None => attempts.push(attempt),
        }
    }

    /// Number of open incidents.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.recoveries.len()
    }

    /// Copy of the open incident for a symbol.
    pub async fn recovery(&self, symbol: &str) -> Option<PositionRecoveryState> {
        let cell = self.recoveries.get(symbol).map(|e| e.value().clone())?;
        let state = cell.lock().await;
        Some(state.clone())
    }

    /// Incidents resolved since startup.
    #[must_use]
    pub fn resolved_incidents(&self) -> Vec<RecoveryIncident> {
        self.history.lock().clone()
    }

    // =========================================================================
    // Evaluation
    // =========================================================================

    /// Classify every position and advance every open incident one step.
    pub async fn evaluate_all(&self) -> EvaluationSummary {
        let now = self.clock.now();
        let broker = self.fetch_broker_positions().await;
        let market = self.state.market_state();
        let mut summary = EvaluationSummary {
            broker_available: broker.is_some(),
            ..Default::default()
        };

        self.detect(&mut summary, broker.as_ref(), &market.last_prices, now);

        let tracked: Vec<(String, Arc<AsyncMutex<PositionRecoveryState>>)> = self
            .recoveries
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        let cycle = Cycle {
            now,
            broker: broker.as_ref(),
            last_prices: &market.last_prices,
        };
        let outcomes = join_all(
            tracked
                .iter()
                .map(|(symbol, cell)| self.advance(symbol, cell, &cycle)),
        )
        .await;

        for ((symbol, _), outcome) in tracked.iter().zip(outcomes) {
            match outcome {
                StepOutcome::Busy => summary.busy += 1,
                StepOutcome::Progress(levels) => summary
                    .escalations
                    .extend(levels.into_iter().map(|l| (symbol.clone(), l))),
                StepOutcome::Resolved(incident) => {
                    self.recoveries.remove(symbol);
                    summary.resolved.push(*incident);
                }
            }
        }

        metrics::set_active_recoveries(self.recoveries.len());
        summary
    }

    /// Evaluate on a fixed interval until cancelled.
    pub async fn run(&self, shutdown: CancellationToken) {
        if !self.config.enabled {
            info!("Stuck-position escalator disabled");
            return;
        }
        info!(
            interval_ms = self.config.poll_interval_ms,
            "Starting stuck-position escalator"
        );

        let mut interval = tokio::time::interval(self.config.poll_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let summary = self.evaluate_all().await;
                    if !summary.opened.is_empty() || !summary.resolved.is_empty() {
                        debug!(
                            opened = summary.opened.len(),
                            resolved = summary.resolved.len(),
                            active = self.active_count(),
                            "Escalation pass finished"
                        );
                    }
                }
                () = shutdown.cancelled() => {
                    info!("Stuck-position escalator shutting down");
                    break;
                }
            }
        }
    }

    async fn fetch_broker_positions(&self) -> Option<HashMap<String, BrokerPosition>> {
        match self.call("get_positions", self.broker.get_positions()).await {
            Ok(positions) => Some(
                positions
                    .into_iter()
                    .filter(BrokerPosition::is_open)
                    .map(|p| (p.symbol.clone(), p))
                    .collect(),
            ),
            Err(e) => {
                warn!(error = %e, "Broker positions unavailable, resolution deferred");
                None
            }
        }
    }

    fn detect(
        &self,
        summary: &mut EvaluationSummary,
        broker: Option<&HashMap<String, BrokerPosition>>,
        last_prices: &std::collections::BTreeMap<String, Decimal>,
        now: DateTime<Utc>,
    ) {
        let pending = self.state.pending_orders();

        for position in self.state.open_positions() {
            summary.evaluated += 1;
            if self.recoveries.contains_key(&position.symbol) {
                continue;
            }
            let attempts = self
                .exit_attempts
                .get(&position.symbol)
                .map(|a| a.value().clone())
                .unwrap_or_default();
            let verdict = self.classifier.classify(&position, &pending, &attempts, now);
            if !verdict.is_unhealthy() {
                continue;
            }
            let alert = StuckPositionAlert {
                position_id: format!("{}:{}", position.strategy_id, position.symbol),
                symbol: position.symbol.clone(),
                quantity: position.quantity,
                entry_price: position.entry_price,
                side: position.side(),
                entry_timestamp: position.entry_time,
                current_price: reference_price(
                    last_prices,
                    &position.symbol,
                    position.current_price,
                ),
                unrealized_pnl: position.unrealized_pnl,
                classification: verdict.class,
                detection_timestamp: now,
                reason: verdict.reason,
                exit_attempts: attempts,
            };
            if self.open_incident(alert.clone()) {
                summary.opened.push(alert);
            }
        }

        let Some(broker) = broker else {
            return;
        };
        for held in broker.values() {
            if self
                .state
                .position(&held.symbol)
                .is_some_and(|p| p.is_open())
            {
                continue;
            }
            summary.evaluated += 1;
            if self.recoveries.contains_key(&held.symbol) {
                continue;
            }
            let verdict = self.classifier.classify_ghost(held);
            let alert = StuckPositionAlert {
                position_id: format!("ghost:{}", held.symbol),
                symbol: held.symbol.clone(),
                quantity: held.quantity,
                entry_price: held.average_price,
                side: PositionSide::of(held.quantity),
                entry_timestamp: held.last_update,
                current_price: reference_price(last_prices, &held.symbol, held.average_price),
                unrealized_pnl: held.unrealized_pnl,
                classification: verdict.class,
                detection_timestamp: now,
                reason: verdict.reason,
                exit_attempts: Vec::new(),
            };
            if self.open_incident(alert.clone()) {
                summary.opened.push(alert);
            }
        }
    }

    /// Start tracking an incident. Returns `false` if one is already open.
    fn open_incident(&self, alert: StuckPositionAlert) -> bool {
        let inserted = match self.recoveries.entry(alert.symbol.clone()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(Arc::new(AsyncMutex::new(PositionRecoveryState::open(
                    alert.clone(),
                ))));
                true
            }
        };
        if !inserted {
            return false;
        }

        warn!(
            position_id = %alert.position_id,
            symbol = %alert.symbol,
            classification = alert.classification.as_str(),
            quantity = %alert.quantity,
            reason = %alert.reason,
            "Stuck position detected"
        );
        if let Some(log) = &self.incidents {
            if let Err(e) = log.log_alert(&alert) {
                error!(error = %e, "Failed to archive stuck-position alert");
            }
        }
        true
    }

    // =========================================================================
    // Ladder
    // =========================================================================

    async fn advance(
        &self,
        symbol: &str,
        cell: &Arc<AsyncMutex<PositionRecoveryState>>,
        cycle: &Cycle<'_>,
    ) -> StepOutcome {
        let Ok(mut recovery) = cell.try_lock() else {
            return StepOutcome::Busy;
        };
        if recovery.resolved {
            return StepOutcome::Busy;
        }
        let _permit = match &self.pool {
            Some(pool) => match pool.acquire().await {
                Ok(permit) => Some(permit),
                Err(_) => return StepOutcome::Busy,
            },
            None => None,
        };

        let local = self.state.position(symbol).filter(Position::is_open);
        let at_broker = cycle.broker.map(|b| b.get(symbol).cloned());

        if matches!(at_broker, Some(None)) {
            if let Some(stale) = &local {
                info!(
                    symbol,
                    local_quantity = %stale.quantity,
                    "Broker reports flat, clearing local position"
                );
                self.state.remove_position(symbol);
            }
            let incident = self.resolve(&mut recovery, cycle.now).await;
            return StepOutcome::Resolved(Box::new(incident));
        }

        let quantity = match (&at_broker, &local) {
            (Some(Some(held)), Some(position)) => {
                if held.quantity != position.quantity {
                    info!(
                        symbol,
                        local_quantity = %position.quantity,
                        broker_quantity = %held.quantity,
                        "Syncing local position to broker"
                    );
                    let broker_quantity = held.quantity;
                    self.state
                        .update_position(symbol, |p| p.quantity = broker_quantity);
                }
                held.quantity
            }
            (Some(Some(held)), None) => held.quantity,
            (_, Some(position)) => position.quantity,
            _ => {
                debug!(symbol, "No known quantity for stuck position, waiting");
                return StepOutcome::Progress(Vec::new());
            }
        };
        let fallback = local
            .as_ref()
            .map_or(recovery.alert.current_price, |p| p.current_price);
        let reference = reference_price(cycle.last_prices, symbol, fallback);

        let mut escalated = Vec::new();
        self.step(&mut recovery, quantity, reference, cycle.now, &mut escalated)
            .await;
        StepOutcome::Progress(escalated)
    }

    async fn step(
        &self,
        recovery: &mut PositionRecoveryState,
        quantity: Decimal,
        reference: Decimal,
        now: DateTime<Utc>,
        escalated: &mut Vec<RecoveryLevel>,
    ) {
        let level = recovery.current_level;
        match level {
            RecoveryLevel::None => {
                self.enter(recovery, RecoveryLevel::SmartRetry, now, escalated)
                    .await;
                self.attempt(recovery, quantity, reference, now).await;
            }
            RecoveryLevel::SmartRetry | RecoveryLevel::FreshStart | RecoveryLevel::MarketOrder => {
                let policy = self.policy(level);
                let since_attempt = recovery
                    .last_attempt_at
                    .map(|t| elapsed_between(t, now));
                let retry_due = since_attempt.is_none_or(|e| e >= policy.retry_interval());
                let exhausted = (recovery.attempt_count >= policy.max_attempts && retry_due)
                    || elapsed_between(recovery.last_escalation_time, now) >= policy.window();

                if exhausted {
                    let Some(next) = level.next() else {
                        return;
                    };
                    self.enter(recovery, next, now, escalated).await;
                    if next.is_automated() {
                        self.attempt(recovery, quantity, reference, now).await;
                    }
                } else if retry_due {
                    self.attempt(recovery, quantity, reference, now).await;
                }
            }
            RecoveryLevel::HumanEscalation => {
                if elapsed_between(recovery.last_escalation_time, now)
                    >= self.config.human_escalation_window()
                {
                    self.enter(recovery, RecoveryLevel::SystemShutdown, now, escalated)
                        .await;
                }
            }
            RecoveryLevel::SystemShutdown => {}
        }
    }

    const fn policy(&self, level: RecoveryLevel) -> &LevelPolicy {
        match level {
            RecoveryLevel::FreshStart => &self.config.fresh_start,
            RecoveryLevel::MarketOrder => &self.config.market_order,
            _ => &self.config.smart_retry,
        }
    }

    async fn enter(
        &self,
        recovery: &mut PositionRecoveryState,
        level: RecoveryLevel,
        now: DateTime<Utc>,
        escalated: &mut Vec<RecoveryLevel>,
    ) {
        if let Err(e) = recovery.escalate_to(level, now) {
            error!(position_id = %recovery.position_id, error = %e, "Escalation refused");
            return;
        }
        escalated.push(level);
        metrics::record_escalation(level.as_str());
        warn!(
            position_id = %recovery.position_id,
            symbol = %recovery.alert.symbol,
            level = level.as_str(),
            "Stuck position escalated"
        );

        match level {
            RecoveryLevel::HumanEscalation => {
                let message = format!(
                    "CRITICAL STUCK POSITION symbol={} position_id={} classification={} quantity={} reason=\"{}\" operator action required within {}s",
                    recovery.alert.symbol,
                    recovery.position_id,
                    recovery.alert.classification.as_str(),
                    recovery.alert.quantity,
                    recovery.alert.reason,
                    self.config.human_escalation_window().as_secs(),
                );
                let result = match self.alerts.send(&message) {
                    Ok(()) => ActionResult::Succeeded,
                    Err(e) => {
                        error!(error = %e, alert = %message, "Failed to page operator");
                        ActionResult::Failed
                    }
                };
                recovery.record(action(now, level, RecoveryActionType::PageOperator, result));
            }
            RecoveryLevel::SystemShutdown => {
                let reason = format!(
                    "stuck position {} unresolved after operator window",
                    recovery.alert.symbol
                );
                let report = self
                    .liquidator
                    .halt_trading(TriggerSource::EscalationShutdown, &reason)
                    .await;
                let result = if report.strategies_disabled {
                    ActionResult::Succeeded
                } else {
                    ActionResult::Failed
                };
                let mut entry = action(now, level, RecoveryActionType::DisableTrading, result);
                entry.notes = Some(reason);
                recovery.record(entry);
            }
            _ => {}
        }
    }

    async fn attempt(
        &self,
        recovery: &mut PositionRecoveryState,
        quantity: Decimal,
        reference: Decimal,
        now: DateTime<Utc>,
    ) {
        let level = recovery.current_level;

        if let Err(blocked) = self.liquidator.flag().check_order_gate() {
            recovery.attempt_count += 1;
            recovery.last_attempt_at = Some(now);
            let mut entry = action(now, level, order_action(level), ActionResult::Blocked);
            entry.notes = Some(blocked.to_string());
            recovery.record(entry);
            return;
        }

        let symbol = recovery.alert.symbol.clone();
        if let Some(previous) = recovery.active_order_id.take() {
            if self.cancel(recovery, &previous, now).await == CancelOutcome::AlreadyGone {
                if recovery.final_exit_price.is_none() {
                    recovery.final_exit_price = order_price(recovery, &previous);
                }
                info!(
                    symbol = %symbol,
                    order_id = %previous,
                    "Working exit no longer at broker, waiting for position report"
                );
                return;
            }
        }
        recovery.attempt_count += 1;
        recovery.last_attempt_at = Some(now);
        if level == RecoveryLevel::FreshStart {
            let side = OrderSide::closing(quantity);
            let stale: Vec<String> = self
                .state
                .pending_orders()
                .into_iter()
                .filter(|o| o.symbol == symbol && o.side == side && o.status.is_active())
                .filter(|o| matches!(o.order_type, OrderType::Market | OrderType::Limit))
                .map(|o| o.order_id)
                .collect();
            for order_id in stale {
                self.cancel(recovery, &order_id, now).await;
            }
        }

        let side = OrderSide::closing(quantity);
        let size = quantity.abs();
        let (request, price) = match level {
            RecoveryLevel::SmartRetry => {
                let step =
                    self.config.smart_retry_price_step() * Decimal::from(recovery.attempt_count);
                let price = match side {
                    OrderSide::Sell => reference * (Decimal::ONE - step),
                    OrderSide::Buy => reference * (Decimal::ONE + step),
                }
                .round_dp(2);
                (OrderRequest::limit(&symbol, side, size, price), Some(price))
            }
            RecoveryLevel::FreshStart => {
                let price = reference.round_dp(2);
                (OrderRequest::limit(&symbol, side, size, price), Some(price))
            }
            _ => (OrderRequest::market_ioc(&symbol, side, size), None),
        };

        let mut entry = action(now, level, order_action(level), ActionResult::Failed);
        entry.price = price;
        match self.call("submit", self.gateway.submit(request)).await {
            Ok(ack) => {
                entry.order_id = Some(ack.order_id.clone());
                entry.result = match ack.status {
                    OrderStatus::Filled => ActionResult::Succeeded,
                    status if status.is_active() => {
                        recovery.active_order_id = Some(ack.order_id.clone());
                        ActionResult::Working
                    }
                    _ => ActionResult::Failed,
                };
                if ack.filled_qty > Decimal::ZERO {
                    self.apply_exit_fill(&symbol, side, ack.filled_qty);
                    recovery.final_exit_price = ack.avg_fill_price.or(price);
                }
                info!(
                    symbol = %symbol,
                    level = level.as_str(),
                    attempt = recovery.attempt_count,
                    order_id = %ack.order_id,
                    status = ?ack.status,
                    "Stuck-position exit submitted"
                );
            }
            Err(e) => {
                warn!(symbol = %symbol, level = level.as_str(), error = %e, "Stuck-position exit failed");
                entry.notes = Some(e.to_string());
            }
        }
        recovery.record(entry);
    }

    async fn cancel(
        &self,
        recovery: &mut PositionRecoveryState,
        order_id: &str,
        now: DateTime<Utc>,
    ) -> CancelOutcome {
        let outcome = match self.call("cancel", self.gateway.cancel(order_id)).await {
            Ok(()) => CancelOutcome::Cancelled,
            Err(BrokerError::OrderNotFound { .. }) => CancelOutcome::AlreadyGone,
            Err(e) => {
                warn!(order_id, error = %e, "Failed to cancel stuck-position exit");
                CancelOutcome::Failed
            }
        };
        let result = if outcome == CancelOutcome::Failed {
            ActionResult::Failed
        } else {
            self.state.remove_order(order_id);
            ActionResult::Succeeded
        };
        let mut entry = action(
            now,
            recovery.current_level,
            RecoveryActionType::CancelOrder,
            result,
        );
        entry.order_id = Some(order_id.to_string());
        if outcome == CancelOutcome::AlreadyGone {
            entry.notes = Some("not working at broker".to_string());
        }
        recovery.record(entry);
        outcome
    }

    fn apply_exit_fill(&self, symbol: &str, side: OrderSide, filled: Decimal) {
        let mut flat = false;
        self.state.update_position(symbol, |p| {
            p.quantity += filled * side.sign();
            flat = p.quantity.is_zero();
        });
        if flat {
            self.state.remove_position(symbol);
        }
    }

    async fn resolve(
        &self,
        recovery: &mut PositionRecoveryState,
        now: DateTime<Utc>,
    ) -> RecoveryIncident {
        if let Some(leftover) = recovery.active_order_id.take() {
            // A working exit that is gone once the broker is flat is the fill.
            if self.cancel(recovery, &leftover, now).await == CancelOutcome::AlreadyGone
                && recovery.final_exit_price.is_none()
            {
                recovery.final_exit_price = order_price(recovery, &leftover);
            }
        }
        recovery.resolved = true;
        recovery.resolved_time = Some(now);
        if let Some(exit) = recovery.final_exit_price {
            recovery.slippage_cost = Some(slippage(
                recovery.alert.current_price,
                exit,
                recovery.alert.quantity,
            ));
        }

        let incident = RecoveryIncident::from_resolved(recovery);
        metrics::record_incident_resolved(
            incident.max_level_reached.as_str(),
            incident.total_recovery_time_seconds,
        );
        info!(
            incident_id = %incident.incident_id,
            symbol = %incident.symbol,
            outcome = ?incident.final_outcome,
            max_level = incident.max_level_reached.as_str(),
            seconds = incident.total_recovery_time_seconds,
            "Stuck position resolved"
        );
        if let Some(log) = &self.incidents {
            if let Err(e) = log.log_incident(&incident) {
                error!(error = %e, "Failed to archive recovery incident");
            }
        }
        self.exit_attempts.remove(&incident.symbol);
        self.history.lock().push(incident.clone());
        incident
    }

    async fn call<T, F>(&self, operation: &str, fut: F) -> Result<T, BrokerError>
    where
        F: Future<Output = Result<T, BrokerError>>,
    {
        tokio::time::timeout(self.config.broker_call_timeout(), fut)
            .await
            .unwrap_or_else(|_| Err(BrokerError::timeout(operation)))
    }
}

/// Price of the exit order the ladder placed under `order_id`.
fn order_price(recovery: &PositionRecoveryState, order_id: &str) -> Option<Decimal> {
    recovery
        .actions
        .iter()
        .rev()
        .filter(|a| a.action_type != RecoveryActionType::CancelOrder)
        .find(|a| a.order_id.as_deref() == Some(order_id))
        .and_then(|a| a.price)
}

const fn order_action(level: RecoveryLevel) -> RecoveryActionType {
    match level {
        RecoveryLevel::SmartRetry => RecoveryActionType::AdjustedLimit,
        RecoveryLevel::FreshStart => RecoveryActionType::ReplaceAtMarket,
        _ => RecoveryActionType::MarketExit,
    }
}

fn action(
    timestamp: DateTime<Utc>,
    level: RecoveryLevel,
    action_type: RecoveryActionType,
    result: ActionResult,
) -> RecoveryAction {
    RecoveryAction {
        timestamp,
        level,
        action_type,
        order_id: None,
        price: None,
        result,
        notes: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::EmergencyConfig;
    use crate::escalation::{FinalOutcome, IncidentRecord, PositionClassification};
    use crate::infrastructure::{PaperBroker, RecordingAlertSink, StateStrategyController};
    use crate::models::StrategyState;
    use crate::recovery::EmergencyFlag;
    use chrono::TimeDelta;
    use rust_decimal_macros::dec;
    use std::time::Duration;

    struct Harness {
        clock: Arc<ManualClock>,
        state: Arc<TradingState>,
        broker: Arc<PaperBroker>,
        alerts: Arc<RecordingAlertSink>,
        escalator: StuckPositionEscalator,
    }

    fn config() -> EscalationConfig {
        let mut config = EscalationConfig::default();
        config.default_max_hold_minutes = 60;
        config.smart_retry = LevelPolicy {
            max_attempts: 2,
            window_secs: 60,
            retry_interval_secs: 10,
        };
        config.fresh_start = LevelPolicy {
            max_attempts: 1,
            window_secs: 60,
            retry_interval_secs: 10,
        };
        config.market_order = LevelPolicy {
            max_attempts: 1,
            window_secs: 60,
            retry_interval_secs: 10,
        };
        config.human_escalation_window_secs = 300;
        config
    }

    fn harness_with(config: EscalationConfig, log: Option<IncidentLog>) -> Harness {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let dyn_clock: Arc<dyn Clock> = clock.clone();
        let state = Arc::new(TradingState::new());
        state.upsert_strategy(StrategyState::enabled("orb", clock.now()));
        let broker = Arc::new(PaperBroker::new(dyn_clock.clone()));
        let alerts = Arc::new(RecordingAlertSink::default());
        let strategies = Arc::new(StateStrategyController::new(state.clone(), dyn_clock.clone()));
        let liquidator = Arc::new(EmergencyLiquidator::new(
            state.clone(),
            broker.clone(),
            strategies,
            alerts.clone(),
            Arc::new(EmergencyFlag::in_memory()),
            dyn_clock.clone(),
            EmergencyConfig::default(),
        ));
        let mut escalator = StuckPositionEscalator::new(
            state.clone(),
            broker.clone(),
            broker.clone(),
            liquidator,
            alerts.clone(),
            dyn_clock,
            config,
        );
        if let Some(log) = log {
            escalator = escalator.with_incident_log(log);
        }
        Harness {
            clock,
            state,
            broker,
            alerts,
            escalator,
        }
    }

    fn harness() -> Harness {
        harness_with(config(), None)
    }

    /// Long 2 ES at 5000, opened `age_minutes` ago, held at the broker too.
    fn open_aged(h: &Harness, age_minutes: i64) {
        let entry = h.clock.now() - TimeDelta::minutes(age_minutes);
        h.state
            .upsert_position(Position::new("ES", dec!(2), dec!(5000), entry, "orb"));
        h.broker.set_position("ES", dec!(2), dec!(5000));
        h.broker.set_price("ES", dec!(5000));
        h.state.record_price("ES", dec!(5000), h.clock.now());
    }

    /// Aged-out ES with fills held, after one pass. Returns the id of the
    /// SmartRetry exit left working.
    async fn rest_first_exit(h: &Harness) -> String {
        open_aged(h, 80);
        h.broker.hold_fills_for("ES");
        h.escalator.evaluate_all().await;
        h.escalator
            .recovery("ES")
            .await
            .and_then(|r| r.active_order_id)
            .unwrap()
    }

    #[tokio::test]
    async fn test_aged_out_position_starts_at_smart_retry() {
        let h = harness();
        open_aged(&h, 80);
        h.broker.hold_fills_for("ES");

        let summary = h.escalator.evaluate_all().await;

        assert_eq!(summary.opened.len(), 1);
        assert_eq!(
            summary.opened[0].classification,
            PositionClassification::AgedOut
        );
        assert_eq!(
            summary.escalations,
            vec![("ES".to_string(), RecoveryLevel::SmartRetry)]
        );

        let recovery = h.escalator.recovery("ES").await.unwrap();
        assert_eq!(recovery.current_level, RecoveryLevel::SmartRetry);
        assert_eq!(recovery.attempt_count, 1);
        assert!(recovery.active_order_id.is_some());

        let sent = h.broker.submitted();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].order_type, OrderType::Limit);
        assert_eq!(sent[0].side, OrderSide::Sell);
        assert_eq!(sent[0].limit_price, Some(dec!(4995.00)));
    }

    #[tokio::test]
    async fn test_healthy_positions_open_no_incident() {
        let h = harness();
        open_aged(&h, 5);

        let summary = h.escalator.evaluate_all().await;

        assert_eq!(summary.evaluated, 1);
        assert!(summary.opened.is_empty());
        assert_eq!(h.escalator.active_count(), 0);
        assert!(h.broker.submitted().is_empty());
    }

    #[tokio::test]
    async fn test_full_ladder_is_monotonic_and_bounded() {
        let h = harness();
        open_aged(&h, 80);
        h.broker.hold_fills_for("ES");

        let mut seen = Vec::new();
        for _ in 0..16 {
            let summary = h.escalator.evaluate_all().await;
            seen.extend(summary.escalations.into_iter().map(|(_, l)| l));
            h.clock.advance(Duration::from_secs(30));
        }

        assert_eq!(
            seen,
            vec![
                RecoveryLevel::SmartRetry,
                RecoveryLevel::FreshStart,
                RecoveryLevel::MarketOrder,
                RecoveryLevel::HumanEscalation,
                RecoveryLevel::SystemShutdown,
            ]
        );
        let recovery = h.escalator.recovery("ES").await.unwrap();
        let levels: Vec<RecoveryLevel> = recovery.actions.iter().map(|a| a.level).collect();
        assert!(levels.windows(2).all(|w| w[0] <= w[1]));

        // SmartRetry twice, FreshStart once, MarketOrder once.
        assert_eq!(h.broker.submitted().len(), 4);

        let pages = h
            .alerts
            .messages()
            .iter()
            .filter(|m| m.starts_with("CRITICAL STUCK POSITION"))
            .count();
        assert_eq!(pages, 1);
        assert!(h.state.all_strategies_disabled());
        assert!(h.escalator.liquidator.is_emergency_active());
    }

    #[tokio::test]
    async fn test_resolution_requires_flat_at_broker_and_locally() {
        let dir = tempfile::tempdir().unwrap();
        let log = IncidentLog::new(dir.path().join("incidents.jsonl"));
        let h = harness_with(config(), Some(log));
        open_aged(&h, 80);

        // SmartRetry sell limit at 4995 is marketable and fills.
        let first = h.escalator.evaluate_all().await;
        assert_eq!(first.opened.len(), 1);
        assert!(h.state.position("ES").is_none());
        assert_eq!(h.broker.position_quantity("ES"), Decimal::ZERO);

        h.clock.advance(Duration::from_secs(5));
        let second = h.escalator.evaluate_all().await;
        assert_eq!(second.resolved.len(), 1);

        let incident = &second.resolved[0];
        assert_eq!(incident.final_outcome, FinalOutcome::ResolvedAutomatically);
        assert_eq!(incident.max_level_reached, RecoveryLevel::SmartRetry);
        assert_eq!(incident.total_recovery_time_seconds, 5.0);
        // (5000 - 4995) * 2
        assert_eq!(incident.slippage_cost, Some(dec!(10)));
        assert!(!incident.required_human_intervention);
        assert_eq!(h.escalator.active_count(), 0);

        let records = h.escalator.incidents.as_ref().unwrap().read_all().unwrap();
        assert_eq!(records.len(), 2);
        assert!(matches!(records[0], IncidentRecord::Alert(_)));
        assert!(matches!(records[1], IncidentRecord::Incident(_)));

        // Exactly once.
        let third = h.escalator.evaluate_all().await;
        assert!(third.resolved.is_empty());
        assert_eq!(h.escalator.resolved_incidents().len(), 1);
    }

    #[tokio::test]
    async fn test_not_resolved_while_broker_still_holds() {
        let h = harness();
        open_aged(&h, 80);
        h.broker.hold_fills_for("ES");
        h.escalator.evaluate_all().await;

        // Local state says flat, broker disagrees.
        h.state.remove_position("ES");
        h.clock.advance(Duration::from_secs(5));
        let summary = h.escalator.evaluate_all().await;
        assert!(summary.resolved.is_empty());
        assert_eq!(h.escalator.active_count(), 1);

        // Broker unreachable: still not resolved.
        h.broker.set_position("ES", Decimal::ZERO, dec!(5000));
        h.broker.set_positions_unavailable(true);
        let summary = h.escalator.evaluate_all().await;
        assert!(!summary.broker_available);
        assert!(summary.resolved.is_empty());

        h.broker.set_positions_unavailable(false);
        let summary = h.escalator.evaluate_all().await;
        assert_eq!(summary.resolved.len(), 1);
    }

    #[tokio::test]
    async fn test_resting_exit_filled_at_broker_resolves_without_new_orders() {
        let h = harness();
        let order_id = rest_first_exit(&h).await;

        // The resting SmartRetry limit fills later; local state never saw it.
        assert!(h.broker.fill_resting(&order_id));
        h.broker.release_fills_for("ES");
        assert_eq!(h.state.position("ES").map(|p| p.quantity), Some(dec!(2)));

        h.clock.advance(Duration::from_secs(10));
        let second = h.escalator.evaluate_all().await;

        assert_eq!(second.resolved.len(), 1);
        let incident = &second.resolved[0];
        assert_eq!(incident.final_outcome, FinalOutcome::ResolvedAutomatically);
        // (5000 - 4995) * 2
        assert_eq!(incident.slippage_cost, Some(dec!(10)));
        assert!(h.state.position("ES").is_none());

        for _ in 0..3 {
            h.clock.advance(Duration::from_secs(10));
            h.escalator.evaluate_all().await;
        }
        assert_eq!(h.broker.submitted().len(), 1);
        assert_eq!(h.broker.position_quantity("ES"), Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_broker_flat_outside_ladder_resolves_and_cancels_exit() {
        let h = harness();
        rest_first_exit(&h).await;
        assert_eq!(h.broker.resting_orders().len(), 1);

        // Closed by hand at the broker while our exit is still working.
        h.broker.set_position("ES", Decimal::ZERO, dec!(5000));
        h.clock.advance(Duration::from_secs(10));
        let summary = h.escalator.evaluate_all().await;

        assert_eq!(summary.resolved.len(), 1);
        assert_eq!(summary.resolved[0].slippage_cost, None);
        assert!(h.state.position("ES").is_none());
        assert!(h.broker.resting_orders().is_empty());
        assert_eq!(h.broker.submitted().len(), 1);
        assert_eq!(h.broker.position_quantity("ES"), Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_vanished_exit_waits_for_broker_report() {
        let h = harness();
        let order_id = rest_first_exit(&h).await;
        assert!(h.broker.fill_resting(&order_id));
        h.broker.set_positions_unavailable(true);

        // Retry is due, but the working exit is gone and the broker is silent.
        h.clock.advance(Duration::from_secs(10));
        let blind = h.escalator.evaluate_all().await;
        assert!(blind.resolved.is_empty());
        assert_eq!(h.broker.submitted().len(), 1);
        assert_eq!(h.escalator.recovery("ES").await.unwrap().attempt_count, 1);

        h.broker.set_positions_unavailable(false);
        let confirmed = h.escalator.evaluate_all().await;
        assert_eq!(confirmed.resolved.len(), 1);
        assert_eq!(confirmed.resolved[0].slippage_cost, Some(dec!(10)));
        assert_eq!(h.broker.submitted().len(), 1);
    }

    #[tokio::test]
    async fn test_partial_fill_syncs_local_quantity_to_broker() {
        let h = harness();
        rest_first_exit(&h).await;
        h.broker.set_position("ES", dec!(1), dec!(5000));

        h.clock.advance(Duration::from_secs(10));
        h.escalator.evaluate_all().await;

        assert_eq!(h.state.position("ES").map(|p| p.quantity), Some(dec!(1)));
        let sent = h.broker.submitted();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1].quantity, dec!(1));
    }

    #[tokio::test]
    async fn test_ghost_position_detected() {
        let h = harness();
        h.broker.set_position("NQ", dec!(-1), dec!(18000));
        h.broker.set_price("NQ", dec!(18000));
        h.broker.hold_fills_for("NQ");

        let summary = h.escalator.evaluate_all().await;

        assert_eq!(summary.opened.len(), 1);
        let alert = &summary.opened[0];
        assert_eq!(alert.classification, PositionClassification::GhostPosition);
        assert_eq!(alert.position_id, "ghost:NQ");
        assert_eq!(alert.side, PositionSide::Short);

        let sent = h.broker.submitted();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].side, OrderSide::Buy);
        assert_eq!(sent[0].quantity, dec!(1));
    }

    #[tokio::test]
    async fn test_order_gate_blocks_ladder_orders() {
        let h = harness();
        open_aged(&h, 80);
        h.escalator
            .liquidator
            .halt_trading(TriggerSource::RecoveryFailure, "test")
            .await;

        h.escalator.evaluate_all().await;

        assert!(h.broker.submitted().is_empty());
        let recovery = h.escalator.recovery("ES").await.unwrap();
        let last = recovery.actions.last().unwrap();
        assert_eq!(last.result, ActionResult::Blocked);
    }

    #[tokio::test]
    async fn test_reported_rejected_exit_is_stuck() {
        let h = harness();
        open_aged(&h, 5);
        h.broker.hold_fills_for("ES");
        h.escalator.record_exit_attempt(
            "ES",
            ExitAttempt {
                order_id: "exit-1".to_string(),
                submitted_at: h.clock.now(),
                order_type: OrderType::Limit,
                price: Some(dec!(5002)),
                status: OrderStatus::Rejected,
            },
        );

        let summary = h.escalator.evaluate_all().await;

        assert_eq!(summary.opened.len(), 1);
        assert_eq!(
            summary.opened[0].classification,
            PositionClassification::StuckExit
        );
        assert_eq!(summary.opened[0].exit_attempts.len(), 1);
    }
}
