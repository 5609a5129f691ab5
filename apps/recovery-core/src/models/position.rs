//! Positions as the engine tracks them and as the broker reports them.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::OrderSide;

/// Direction of a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PositionSide {
    /// Positive quantity.
    Long,
    /// Negative quantity.
    Short,
    /// Zero quantity.
    Flat,
}

impl PositionSide {
    /// Side of a signed quantity.
    #[must_use]
    pub fn of(quantity: Decimal) -> Self {
        if quantity.is_zero() {
            Self::Flat
        } else if quantity.is_sign_negative() {
            Self::Short
        } else {
            Self::Long
        }
    }
}

/// An open position owned by the in-memory position map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Position {
    /// Instrument symbol (e.g. "ES").
    pub symbol: String,
    /// Signed quantity: positive long, negative short.
    pub quantity: Decimal,
    /// Average entry price.
    pub entry_price: Decimal,
    /// Last marked price.
    pub current_price: Decimal,
    /// Unrealized P&L at the last mark.
    #[serde(rename = "unrealizedPnL")]
    pub unrealized_pnl: Decimal,
    /// Broker id of the protective stop, if one was placed.
    pub stop_order_id: Option<String>,
    /// Broker id of the profit target, if one was placed.
    pub target_order_id: Option<String>,
    /// When the position was opened.
    pub entry_time: DateTime<Utc>,
    /// Strategy that owns the position.
    pub strategy_id: String,
}

impl Position {
    /// Create a position marked at its entry price with no protective legs.
    #[must_use]
    pub fn new(
        symbol: impl Into<String>,
        quantity: Decimal,
        entry_price: Decimal,
        entry_time: DateTime<Utc>,
        strategy_id: impl Into<String>,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            quantity,
            entry_price,
            current_price: entry_price,
            unrealized_pnl: Decimal::ZERO,
            stop_order_id: None,
            target_order_id: None,
            entry_time,
            strategy_id: strategy_id.into(),
        }
    }

    /// Build a local record for a position only the broker knew about.
    #[must_use]
    pub fn adopted(broker: &BrokerPosition, strategy_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            symbol: broker.symbol.clone(),
            quantity: broker.quantity,
            entry_price: broker.average_price,
            current_price: broker.average_price,
            unrealized_pnl: broker.unrealized_pnl,
            stop_order_id: None,
            target_order_id: None,
            entry_time: now,
            strategy_id: strategy_id.to_string(),
        }
    }

    /// Position direction.
    #[must_use]
    pub fn side(&self) -> PositionSide {
        PositionSide::of(self.quantity)
    }

    /// Whether the position carries any quantity.
    #[must_use]
    pub fn is_open(&self) -> bool {
        !self.quantity.is_zero()
    }

    /// Side of the order that closes this position.
    #[must_use]
    pub fn closing_side(&self) -> OrderSide {
        OrderSide::closing(self.quantity)
    }

    /// Re-mark the position and recompute unrealized P&L.
    ///
    /// `point_value` is the currency value of one full price point per
    /// contract (50 for ES).
    pub fn mark(&mut self, price: Decimal, point_value: Decimal) {
        self.current_price = price;
        self.unrealized_pnl = (price - self.entry_price) * self.quantity * point_value;
    }
}

/// A position as reported by the broker. Authoritative.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrokerPosition {
    /// Instrument symbol.
    pub symbol: String,
    /// Signed quantity.
    pub quantity: Decimal,
    /// Broker-computed average price.
    pub average_price: Decimal,
    /// Broker-computed unrealized P&L.
    #[serde(rename = "unrealizedPnL")]
    pub unrealized_pnl: Decimal,
    /// When the broker last updated this position.
    pub last_update: DateTime<Utc>,
}

impl BrokerPosition {
    /// Whether the broker reports any quantity.
    #[must_use]
    pub fn is_open(&self) -> bool {
        !self.quantity.is_zero()
    }
}
