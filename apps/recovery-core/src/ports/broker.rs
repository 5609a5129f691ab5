//! Broker Ports (Driven Ports)
//!
//! Read-only position queries and order execution against the broker.
//! The broker is authoritative for positions; every local belief is
//! reconciled against what these ports report.

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Classify, ErrorKind};
use crate::models::{BrokerPosition, OrderSide, OrderStatus, OrderType, TimeInForce};

/// Request to submit an order to the broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderRequest {
    /// Client order ID.
    pub client_order_id: String,
    /// Symbol to trade.
    pub symbol: String,
    /// Order side.
    pub side: OrderSide,
    /// Order type.
    pub order_type: OrderType,
    /// Unsigned quantity.
    pub quantity: Decimal,
    /// Limit price (for limit orders).
    pub limit_price: Option<Decimal>,
    /// Time in force.
    pub time_in_force: TimeInForce,
}

impl OrderRequest {
    /// Create a day market order.
    #[must_use]
    pub fn market(symbol: impl Into<String>, side: OrderSide, quantity: Decimal) -> Self {
        Self {
            client_order_id: Uuid::new_v4().to_string(),
            symbol: symbol.into(),
            side,
            order_type: OrderType::Market,
            quantity: quantity.abs(),
            limit_price: None,
            time_in_force: TimeInForce::Day,
        }
    }

    /// Create an immediate-or-cancel market order.
    #[must_use]
    pub fn market_ioc(symbol: impl Into<String>, side: OrderSide, quantity: Decimal) -> Self {
        Self::market(symbol, side, quantity).with_time_in_force(TimeInForce::Ioc)
    }

    /// Create a day limit order.
    #[must_use]
    pub fn limit(
        symbol: impl Into<String>,
        side: OrderSide,
        quantity: Decimal,
        limit_price: Decimal,
    ) -> Self {
        Self {
            client_order_id: Uuid::new_v4().to_string(),
            symbol: symbol.into(),
            side,
            order_type: OrderType::Limit,
            quantity: quantity.abs(),
            limit_price: Some(limit_price),
            time_in_force: TimeInForce::Day,
        }
    }

    /// Set time in force.
    #[must_use]
    pub const fn with_time_in_force(mut self, tif: TimeInForce) -> Self {
        self.time_in_force = tif;
        self
    }
}

/// Acknowledgment from broker after order submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderAck {
    /// Broker-assigned order ID.
    pub order_id: String,
    /// Client order ID echoed back.
    pub client_order_id: String,
    /// Symbol.
    pub symbol: String,
    /// Order type.
    pub order_type: OrderType,
    /// Current status.
    pub status: OrderStatus,
    /// Filled quantity.
    pub filled_qty: Decimal,
    /// Average fill price (if any).
    pub avg_fill_price: Option<Decimal>,
}

/// Broker port error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BrokerError {
    /// Connection error.
    #[error("Broker connection error: {message}")]
    ConnectionError {
        /// Error details.
        message: String,
    },

    /// Order rejected by broker.
    #[error("Order rejected: {reason}")]
    OrderRejected {
        /// Rejection reason.
        reason: String,
    },

    /// Order not found.
    #[error("Order not found: {order_id}")]
    OrderNotFound {
        /// The missing order ID.
        order_id: String,
    },

    /// Call did not complete in time.
    #[error("Broker call timed out: {operation}")]
    Timeout {
        /// Operation that timed out.
        operation: String,
    },

    /// Rate limited.
    #[error("Rate limited by broker")]
    RateLimited,

    /// Unknown error.
    #[error("Broker error: {message}")]
    Unknown {
        /// Error details.
        message: String,
    },
}

impl BrokerError {
    /// Timeout for a named operation.
    #[must_use]
    pub fn timeout(operation: impl Into<String>) -> Self {
        Self::Timeout {
            operation: operation.into(),
        }
    }
}

impl Classify for BrokerError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::ConnectionError { .. }
            | Self::Timeout { .. }
            | Self::RateLimited
            | Self::Unknown { .. } => ErrorKind::Transient,
            Self::OrderRejected { .. } | Self::OrderNotFound { .. } => {
                ErrorKind::BrokerDivergence
            }
        }
    }
}

/// Port for reading the broker's positions.
#[async_trait]
pub trait BrokerPositionProvider: Send + Sync {
    /// All positions the broker currently holds for the account.
    async fn get_positions(&self) -> Result<Vec<BrokerPosition>, BrokerError>;
}

/// Port for placing and cancelling orders.
#[async_trait]
pub trait OrderExecutionGateway: Send + Sync {
    /// Submit an order.
    async fn submit(&self, request: OrderRequest) -> Result<OrderAck, BrokerError>;

    /// Cancel a resting order.
    async fn cancel(&self, order_id: &str) -> Result<(), BrokerError>;

    /// Place a protective stop on the closing side.
    async fn place_stop(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: Decimal,
        stop_price: Decimal,
    ) -> Result<OrderAck, BrokerError>;

    /// Place a resting profit target on the closing side.
    async fn place_target(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: Decimal,
        limit_price: Decimal,
    ) -> Result<OrderAck, BrokerError>;

    /// All orders still working at the broker.
    async fn open_orders(&self) -> Result<Vec<OrderAck>, BrokerError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn market_ioc_request() {
        let request = OrderRequest::market_ioc("ES", OrderSide::Sell, dec!(-2));

        assert_eq!(request.order_type, OrderType::Market);
        assert_eq!(request.time_in_force, TimeInForce::Ioc);
        assert_eq!(request.quantity, dec!(2));
        assert!(request.limit_price.is_none());
    }

    #[test]
    fn limit_request() {
        let request = OrderRequest::limit("NQ", OrderSide::Buy, dec!(1), dec!(18000.25));

        assert_eq!(request.order_type, OrderType::Limit);
        assert_eq!(request.limit_price, Some(dec!(18000.25)));
        assert_eq!(request.time_in_force, TimeInForce::Day);
    }

    #[test]
    fn client_order_ids_are_unique() {
        let a = OrderRequest::market("ES", OrderSide::Buy, dec!(1));
        let b = OrderRequest::market("ES", OrderSide::Buy, dec!(1));
        assert_ne!(a.client_order_id, b.client_order_id);
    }

    #[test]
    fn broker_error_classification() {
        assert_eq!(BrokerError::timeout("get_positions").kind(), ErrorKind::Transient);
        assert_eq!(
            BrokerError::OrderNotFound {
                order_id: "x".to_string()
            }
            .kind(),
            ErrorKind::BrokerDivergence
        );
    }
}
