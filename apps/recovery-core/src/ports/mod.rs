//! Ports to the collaborators the recovery core drives.
//!
//! Concrete adapters live in [`crate::infrastructure`].

mod broker;
mod control;

pub use broker::{
    BrokerError, BrokerPositionProvider, OrderAck, OrderExecutionGateway, OrderRequest,
};
pub use control::{AlertError, AlertSink, StrategyControlError, StrategyController};

#[cfg(test)]
pub use control::{MockAlertSink, MockStrategyController};
