//! Protective order guardian.
//!
//! Makes sure every open position has one live stop and one live target.
//! Legs that are already live at the broker are left alone, so running the
//! guardian any number of times never stacks duplicate orders.
//!
//! Prices come from the per-symbol [`ProtectionPolicy`]. The anchor is the
//! entry price, unless the market has already moved through the level it
//! would produce, in which case the current price is used so the order is
//! not immediately marketable. Prices are rounded to the symbol's tick.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use rust_decimal::Decimal;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::emergency::{EmergencyFlag, OrderBlocked};
use crate::clock::Clock;
use crate::config::{ProtectionConfig, ProtectionPolicy};
use crate::error::{Classify, ErrorKind};
use crate::models::{OrderStatus, OrderType, PendingOrder, Position, PositionSide};
use crate::observability::metrics;
use crate::ports::{BrokerError, OrderAck, OrderExecutionGateway};
use crate::state::TradingState;

/// Errors that stop the guardian from running at all.
#[derive(Debug, Error)]
pub enum GuardianError {
    /// Emergency mode blocks new orders.
    #[error(transparent)]
    EmergencyModeActive(#[from] OrderBlocked),
}

impl Classify for GuardianError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::EmergencyModeActive(e) => e.kind(),
        }
    }
}

/// Which protective order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtectiveLeg {
    /// Stop loss.
    Stop,
    /// Profit target.
    Target,
}

impl ProtectiveLeg {
    /// Label for logs and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Stop => "stop",
            Self::Target => "target",
        }
    }
}

/// A leg the guardian placed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlacedLeg {
    /// Symbol.
    pub symbol: String,
    /// Leg.
    pub leg: ProtectiveLeg,
    /// Broker order id.
    pub order_id: String,
    /// Stop or limit price.
    pub price: Decimal,
}

/// A leg the guardian could not place.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LegFailure {
    /// Symbol.
    pub symbol: String,
    /// Leg.
    pub leg: ProtectiveLeg,
    /// Error text.
    pub error: String,
}

/// Result of one guardian pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GuardianReport {
    /// Open positions examined.
    pub positions_checked: usize,
    /// Legs found live and left alone.
    pub legs_present: usize,
    /// Legs placed.
    pub placed: Vec<PlacedLeg>,
    /// Legs that failed.
    pub failures: Vec<LegFailure>,
}

impl GuardianReport {
    /// Whether every open position ended the pass with both legs.
    #[must_use]
    pub fn fully_protected(&self) -> bool {
        self.failures.is_empty()
    }
}

enum LegOutcome {
    Present,
    Placed(PlacedLeg),
    Failed(LegFailure),
}

/// Re-attaches missing stop and target orders.
pub struct ProtectiveOrderGuardian {
    state: Arc<TradingState>,
    gateway: Arc<dyn OrderExecutionGateway>,
    flag: Arc<EmergencyFlag>,
    clock: Arc<dyn Clock>,
    protection: ProtectionConfig,
    call_timeout: Duration,
}

impl ProtectiveOrderGuardian {
    /// Create a guardian.
    #[must_use]
    pub fn new(
        state: Arc<TradingState>,
        gateway: Arc<dyn OrderExecutionGateway>,
        flag: Arc<EmergencyFlag>,
        clock: Arc<dyn Clock>,
        protection: ProtectionConfig,
        call_timeout: Duration,
    ) -> Self {
        Self {
            state,
            gateway,
            flag,
            clock,
            protection,
            call_timeout,
        }
    }

    /// Ensure every open position has a live stop and target.
    ///
    /// Per-leg failures are collected in the report; only an active
    /// emergency flag fails the whole call.
    pub async fn reattach_all(&self) -> Result<GuardianReport, GuardianError> {
        self.flag.check_order_gate()?;

        let live = self.live_order_ids().await;
        let positions = self.state.open_positions();

        let outcomes = join_all(positions.iter().map(|p| self.protect(p, &live))).await;

        let mut report = GuardianReport {
            positions_checked: positions.len(),
            ..GuardianReport::default()
        };
        for outcome in outcomes.into_iter().flatten() {
            match outcome {
                LegOutcome::Present => report.legs_present += 1,
                LegOutcome::Placed(leg) => report.placed.push(leg),
                LegOutcome::Failed(failure) => report.failures.push(failure),
            }
        }

        info!(
            positions = report.positions_checked,
            present = report.legs_present,
            placed = report.placed.len(),
            failed = report.failures.len(),
            "Protective order pass complete"
        );
        Ok(report)
    }

    /// Stop and target prices for a position under its symbol's policy.
    #[must_use]
    pub fn protective_prices(&self, position: &Position) -> (Decimal, Decimal) {
        let policy = self.protection.policy_for(&position.symbol);
        (
            stop_price(position, &policy),
            target_price(position, &policy),
        )
    }

    async fn live_order_ids(&self) -> HashSet<String> {
        match tokio::time::timeout(self.call_timeout, self.gateway.open_orders()).await {
            Ok(Ok(orders)) => orders
                .into_iter()
                .filter(|o| o.status.is_active())
                .map(|o| o.order_id)
                .collect(),
            Ok(Err(e)) => {
                warn!(error = %e, "Open order query failed, trusting local pending orders");
                self.local_live_ids()
            }
            Err(_) => {
                warn!("Open order query timed out, trusting local pending orders");
                self.local_live_ids()
            }
        }
    }

    fn local_live_ids(&self) -> HashSet<String> {
        self.state
            .pending_orders()
            .into_iter()
            .filter(|o| o.status.is_active())
            .map(|o| o.order_id)
            .collect()
    }

    async fn protect(&self, position: &Position, live: &HashSet<String>) -> Vec<LegOutcome> {
        let (stop, target) = self.protective_prices(position);
        vec![
            self.ensure_leg(position, ProtectiveLeg::Stop, stop, live)
                .await,
            self.ensure_leg(position, ProtectiveLeg::Target, target, live)
                .await,
        ]
    }

    async fn ensure_leg(
        &self,
        position: &Position,
        leg: ProtectiveLeg,
        price: Decimal,
        live: &HashSet<String>,
    ) -> LegOutcome {
        let existing = match leg {
            ProtectiveLeg::Stop => position.stop_order_id.as_ref(),
            ProtectiveLeg::Target => position.target_order_id.as_ref(),
        };
        if existing.is_some_and(|id| live.contains(id)) {
            debug!(symbol = %position.symbol, leg = leg.as_str(), "Protective leg already live");
            metrics::record_protective_order(leg.as_str(), "present");
            return LegOutcome::Present;
        }

        let failure = |error: String| {
            metrics::record_protective_order(leg.as_str(), "failed");
            warn!(symbol = %position.symbol, leg = leg.as_str(), error = %error, "Failed to place protective order");
            LegOutcome::Failed(LegFailure {
                symbol: position.symbol.clone(),
                leg,
                error,
            })
        };

        if let Err(blocked) = self.flag.check_order_gate() {
            return failure(blocked.to_string());
        }

        let side = position.closing_side();
        let quantity = position.quantity.abs();
        let call = async {
            match leg {
                ProtectiveLeg::Stop => {
                    self.gateway
                        .place_stop(&position.symbol, side, quantity, price)
                        .await
                }
                ProtectiveLeg::Target => {
                    self.gateway
                        .place_target(&position.symbol, side, quantity, price)
                        .await
                }
            }
        };
        let ack: OrderAck = match tokio::time::timeout(self.call_timeout, call).await {
            Ok(Ok(ack)) if ack.status != OrderStatus::Rejected => ack,
            Ok(Ok(ack)) => return failure(format!("order {} rejected", ack.order_id)),
            Ok(Err(e)) => return failure(e.to_string()),
            Err(_) => return failure(BrokerError::timeout(leg.as_str()).to_string()),
        };

        if let Some(stale) = existing {
            self.state.remove_order(stale);
        }
        let order_id = ack.order_id.clone();
        self.state.update_position(&position.symbol, |p| match leg {
            ProtectiveLeg::Stop => p.stop_order_id = Some(order_id.clone()),
            ProtectiveLeg::Target => p.target_order_id = Some(order_id.clone()),
        });
        self.state.upsert_order(PendingOrder {
            order_id: ack.order_id.clone(),
            symbol: position.symbol.clone(),
            side,
            quantity,
            order_type: match leg {
                ProtectiveLeg::Stop => OrderType::Stop,
                ProtectiveLeg::Target => OrderType::Target,
            },
            price: Some(price),
            status: OrderStatus::Working,
            submitted_at: self.clock.now(),
        });

        metrics::record_protective_order(leg.as_str(), "placed");
        info!(
            symbol = %position.symbol,
            leg = leg.as_str(),
            order_id = %ack.order_id,
            price = %price,
            "Protective order placed"
        );
        LegOutcome::Placed(PlacedLeg {
            symbol: position.symbol.clone(),
            leg,
            order_id: ack.order_id,
            price,
        })
    }
}

fn stop_price(position: &Position, policy: &ProtectionPolicy) -> Decimal {
    let d = policy.stop_distance;
    let price = match position.side() {
        PositionSide::Short => {
            let level = position.entry_price + d;
            if position.current_price >= level {
                position.current_price + d
            } else {
                level
            }
        }
        _ => {
            let level = position.entry_price - d;
            if position.current_price <= level {
                position.current_price - d
            } else {
                level
            }
        }
    };
    policy.round_to_tick(price)
}

fn target_price(position: &Position, policy: &ProtectionPolicy) -> Decimal {
    let d = policy.target_distance;
    let price = match position.side() {
        PositionSide::Short => {
            let level = position.entry_price - d;
            if position.current_price <= level {
                position.current_price - d
            } else {
                level
            }
        }
        _ => {
            let level = position.entry_price + d;
            if position.current_price >= level {
                position.current_price + d
            } else {
                level
            }
        }
    };
    policy.round_to_tick(price)
}
