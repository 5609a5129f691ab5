//! Broker Adapters
//!
//! Implementations of the broker ports. Only the in-memory paper broker
//! ships here; live adapters plug in behind the same traits.

pub mod paper;

pub use paper::{PaperBroker, RestingOrder};
