//! Dependency wiring.

pub mod container;

pub use container::{Container, Ports};
