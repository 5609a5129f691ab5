//! In-memory trading state container.
//!
//! One `TradingState` is constructed at startup and shared by `Arc` with
//! every component. Reads of individual records go straight to the
//! concurrent maps. Every mutation of the position or order maps, and
//! snapshot capture, happen under one coarse write gate so a snapshot
//! never observes a half-applied change.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};

use crate::models::{
    MarketState, PendingOrder, Position, RiskMetrics, StrategyState, SystemStateSnapshot,
};

/// Shared, explicitly constructed trading state.
#[derive(Debug, Default)]
pub struct TradingState {
    write_gate: Mutex<()>,
    positions: DashMap<String, Position>,
    pending_orders: DashMap<String, PendingOrder>,
    strategies: DashMap<String, StrategyState>,
    risk: RwLock<RiskMetrics>,
    market: RwLock<MarketState>,
}

impl TradingState {
    /// Empty state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    // ------------------------------------------------------------------
    // Positions
    // ------------------------------------------------------------------

    /// Copy of one position.
    #[must_use]
    pub fn position(&self, symbol: &str) -> Option<Position> {
        self.positions.get(symbol).map(|p| p.value().clone())
    }

    /// Copies of all positions, ordered by symbol.
    #[must_use]
    pub fn positions(&self) -> Vec<Position> {
        let mut positions: Vec<Position> =
            self.positions.iter().map(|p| p.value().clone()).collect();
        positions.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        positions
    }

    /// Copies of all positions with non-zero quantity, ordered by symbol.
    #[must_use]
    pub fn open_positions(&self) -> Vec<Position> {
        let mut positions = self.positions();
        positions.retain(Position::is_open);
        positions
    }

    /// Number of positions with non-zero quantity.
    #[must_use]
    pub fn open_position_count(&self) -> usize {
        self.positions.iter().filter(|p| p.is_open()).count()
    }

    /// Insert or replace a position.
    pub fn upsert_position(&self, position: Position) {
        let _gate = self.write_gate.lock();
        self.positions.insert(position.symbol.clone(), position);
    }

    /// Remove a position.
    pub fn remove_position(&self, symbol: &str) -> Option<Position> {
        let _gate = self.write_gate.lock();
        self.positions.remove(symbol).map(|(_, p)| p)
    }

    /// Mutate a position in place. Returns `false` if it does not exist.
    pub fn update_position<F>(&self, symbol: &str, f: F) -> bool
    where
        F: FnOnce(&mut Position),
    {
        let _gate = self.write_gate.lock();
        match self.positions.get_mut(symbol) {
            Some(mut entry) => {
                f(entry.value_mut());
                true
            }
            None => false,
        }
    }

    // ------------------------------------------------------------------
    // Pending orders
    // ------------------------------------------------------------------

    /// Copies of all pending orders, ordered by id.
    #[must_use]
    pub fn pending_orders(&self) -> Vec<PendingOrder> {
        let mut orders: Vec<PendingOrder> = self
            .pending_orders
            .iter()
            .map(|o| o.value().clone())
            .collect();
        orders.sort_by(|a, b| a.order_id.cmp(&b.order_id));
        orders
    }

    /// Copy of one pending order.
    #[must_use]
    pub fn pending_order(&self, order_id: &str) -> Option<PendingOrder> {
        self.pending_orders.get(order_id).map(|o| o.value().clone())
    }

    /// Number of pending orders.
    #[must_use]
    pub fn pending_order_count(&self) -> usize {
        self.pending_orders.len()
    }

    /// Insert or replace a pending order.
    pub fn upsert_order(&self, order: PendingOrder) {
        let _gate = self.write_gate.lock();
        self.pending_orders.insert(order.order_id.clone(), order);
    }

    /// Remove a pending order.
    pub fn remove_order(&self, order_id: &str) -> Option<PendingOrder> {
        let _gate = self.write_gate.lock();
        self.pending_orders.remove(order_id).map(|(_, o)| o)
    }

    // ------------------------------------------------------------------
    // Strategies, risk, market
    // ------------------------------------------------------------------

    /// Copies of all strategy states, ordered by id.
    #[must_use]
    pub fn strategies(&self) -> Vec<StrategyState> {
        let mut strategies: Vec<StrategyState> =
            self.strategies.iter().map(|s| s.value().clone()).collect();
        strategies.sort_by(|a, b| a.strategy_id.cmp(&b.strategy_id));
        strategies
    }

    /// Insert or replace a strategy state.
    pub fn upsert_strategy(&self, strategy: StrategyState) {
        let _gate = self.write_gate.lock();
        self.strategies
            .insert(strategy.strategy_id.clone(), strategy);
    }

    /// Flip every strategy's enablement. Returns how many changed.
    pub fn set_all_strategies_enabled(
        &self,
        enabled: bool,
        reason: Option<&str>,
        at: DateTime<Utc>,
    ) -> usize {
        let _gate = self.write_gate.lock();
        let mut changed = 0;
        for mut entry in self.strategies.iter_mut() {
            let strategy = entry.value_mut();
            if strategy.enabled != enabled {
                changed += 1;
            }
            strategy.enabled = enabled;
            strategy.disabled_reason = if enabled {
                None
            } else {
                reason.map(str::to_string)
            };
            strategy.updated_at = at;
        }
        changed
    }

    /// Whether every known strategy is disabled.
    #[must_use]
    pub fn all_strategies_disabled(&self) -> bool {
        self.strategies.iter().all(|s| !s.enabled)
    }

    /// Current risk metrics.
    #[must_use]
    pub fn risk_metrics(&self) -> RiskMetrics {
        self.risk.read().clone()
    }

    /// Replace risk metrics.
    pub fn set_risk_metrics(&self, metrics: RiskMetrics) {
        *self.risk.write() = metrics;
    }

    /// Current market state.
    #[must_use]
    pub fn market_state(&self) -> MarketState {
        self.market.read().clone()
    }

    /// Record the last price for a symbol.
    pub fn record_price(&self, symbol: &str, price: rust_decimal::Decimal, at: DateTime<Utc>) {
        let mut market = self.market.write();
        market.last_prices.insert(symbol.to_string(), price);
        market.updated_at = Some(at);
    }

    // ------------------------------------------------------------------
    // Snapshot support
    // ------------------------------------------------------------------

    /// Capture an unsealed snapshot under the write gate.
    #[must_use]
    pub fn capture(&self, system_version: &str, at: DateTime<Utc>) -> SystemStateSnapshot {
        let _gate = self.write_gate.lock();

        let positions: BTreeMap<String, Position> = self
            .positions
            .iter()
            .map(|p| (p.key().clone(), p.value().clone()))
            .collect();
        let pending_orders: BTreeMap<String, PendingOrder> = self
            .pending_orders
            .iter()
            .map(|o| (o.key().clone(), o.value().clone()))
            .collect();
        let strategy_states: BTreeMap<String, StrategyState> = self
            .strategies
            .iter()
            .map(|s| (s.key().clone(), s.value().clone()))
            .collect();

        SystemStateSnapshot {
            timestamp: at,
            last_updated: at,
            positions,
            pending_orders,
            strategy_states,
            risk_metrics: self.risk.read().clone(),
            market_state: self.market.read().clone(),
            system_version: system_version.to_string(),
            checkpoint_hash: String::new(),
        }
    }

    /// Replace everything with the contents of a snapshot.
    pub fn restore(&self, snapshot: &SystemStateSnapshot) {
        let _gate = self.write_gate.lock();
        self.clear_locked();
        for (symbol, position) in &snapshot.positions {
            self.positions.insert(symbol.clone(), position.clone());
        }
        for (id, order) in &snapshot.pending_orders {
            self.pending_orders.insert(id.clone(), order.clone());
        }
        for (id, strategy) in &snapshot.strategy_states {
            self.strategies.insert(id.clone(), strategy.clone());
        }
        *self.risk.write() = snapshot.risk_metrics.clone();
        *self.market.write() = snapshot.market_state.clone();
    }

    /// Drop all state (cold start).
    pub fn reset(&self) {
        let _gate = self.write_gate.lock();
        self.clear_locked();
    }

    fn clear_locked(&self) {
        self.positions.clear();
        self.pending_orders.clear();
        self.strategies.clear();
        *self.risk.write() = RiskMetrics::default();
        *self.market.write() = MarketState::default();
    }

    /// Release spare capacity held by the maps.
    pub fn shrink_to_fit(&self) {
        let _gate = self.write_gate.lock();
        self.positions.shrink_to_fit();
        self.pending_orders.shrink_to_fit();
        self.strategies.shrink_to_fit();
    }
}
