//! Core data model for the recovery domain.
//!
//! Field names serialize in camelCase because these records form the
//! on-disk state document and the audit logs.

mod order;
mod position;
mod snapshot;
mod strategy;

pub use order::{OrderSide, OrderStatus, OrderType, PendingOrder, TimeInForce};
pub use position::{BrokerPosition, Position, PositionSide};
pub use snapshot::{MarketState, RiskMetrics, SystemStateSnapshot};
pub use strategy::StrategyState;
