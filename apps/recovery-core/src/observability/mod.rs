//! Observability module for metrics.
//!
//! Tracing setup lives in [`crate::telemetry`]; this module carries the
//! Prometheus instrumentation recorded by every recovery component.

pub mod metrics;

pub use metrics::{MetricsConfig, MetricsError, init_metrics};
