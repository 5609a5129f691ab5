//! Infrastructure Layer
//!
//! Adapters implementing the ports defined in [`crate::ports`]:
//!
//! - `broker/`: broker position and order adapters (paper)
//! - `alerts`: durable operator alert sinks
//! - `strategy`: strategy controller backed by [`crate::state::TradingState`]
//! - `config/`: dependency wiring

pub mod alerts;
pub mod broker;
pub mod config;
pub mod strategy;

pub use alerts::{FileAlertSink, RecordingAlertSink};
pub use broker::{PaperBroker, RestingOrder};
pub use config::{Container, Ports};
pub use strategy::StateStrategyController;
