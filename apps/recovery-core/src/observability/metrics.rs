//! Prometheus metrics for the recovery core.
//!
//! Recording functions are thin wrappers over the `metrics` facade; without
//! an installed exporter they are no-ops, so components call them
//! unconditionally.
//!
//! # Example
//!
//! ```ignore
//! use recovery_core::observability::metrics::{init_metrics, MetricsConfig};
//!
//! init_metrics(&MetricsConfig::default())?;
//! record_snapshot(true, 0.002);
//! ```

use std::net::SocketAddr;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;

use crate::config::MetricsSettings;

/// Configuration for the metrics exporter.
#[derive(Debug, Clone)]
pub struct MetricsConfig {
    /// Address to bind the metrics HTTP listener.
    pub listen_addr: SocketAddr,
    /// Histogram buckets for latency measurements (in seconds).
    pub latency_buckets: Vec<f64>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 9090)),
            // 100us to 30s; snapshots sit at the low end, recoveries at the top
            latency_buckets: vec![
                0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0,
            ],
        }
    }
}

impl MetricsConfig {
    /// Build from the `observability.metrics` section.
    pub fn from_settings(settings: &MetricsSettings) -> Result<Self, MetricsError> {
        let listen_addr = settings
            .listen_addr
            .parse()
            .map_err(|e| MetricsError::Configuration(format!("listen_addr: {e}")))?;
        Ok(Self {
            listen_addr,
            ..Default::default()
        })
    }
}

/// Initialize the Prometheus metrics exporter.
///
/// This starts an HTTP server that exposes metrics at `/metrics`.
///
/// # Errors
///
/// Returns an error if the metrics exporter fails to start (e.g., port already in use).
pub fn init_metrics(config: &MetricsConfig) -> Result<(), MetricsError> {
    PrometheusBuilder::new()
        .with_http_listener(config.listen_addr)
        .set_buckets(&config.latency_buckets)
        .map_err(|e| MetricsError::Configuration(e.to_string()))?
        .install()
        .map_err(|e| MetricsError::Installation(e.to_string()))?;

    tracing::info!(
        addr = %config.listen_addr,
        "Prometheus metrics exporter started"
    );

    Ok(())
}

/// Error type for metrics operations.
#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    /// Failed to configure metrics exporter.
    #[error("metrics configuration error: {0}")]
    Configuration(String),
    /// Failed to install metrics exporter.
    #[error("metrics installation error: {0}")]
    Installation(String),
}

// ============================================================================
// Persistence
// ============================================================================

/// Record a snapshot attempt.
pub fn record_snapshot(success: bool, latency_seconds: f64) {
    let status = if success { "ok" } else { "failed" };
    counter!("state_snapshots_total", "status" => status).increment(1);
    if success {
        histogram!("state_snapshot_latency_seconds").record(latency_seconds);
    }
}

// ============================================================================
// Recovery
// ============================================================================

/// Record the outcome of a startup recovery.
pub fn record_recovery_outcome(outcome: &str, duration_seconds: f64) {
    counter!("startup_recoveries_total", "outcome" => outcome.to_string()).increment(1);
    histogram!("startup_recovery_duration_seconds").record(duration_seconds);
}

/// Record one reconciliation discrepancy.
pub fn record_discrepancy(kind: &str) {
    counter!("reconciliation_discrepancies_total", "kind" => kind.to_string()).increment(1);
}

/// Record a protective order placement.
pub fn record_protective_order(leg: &str, status: &str) {
    counter!(
        "protective_orders_total",
        "leg" => leg.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record how one position was flattened during liquidation.
pub fn record_liquidation(path: &str) {
    counter!("emergency_liquidations_total", "path" => path.to_string()).increment(1);
}

/// Record an emergency-mode activation.
pub fn record_emergency_activation(source: &str) {
    counter!("emergency_activations_total", "source" => source.to_string()).increment(1);
    gauge!("emergency_mode_active").set(1.0);
}

/// Record the operator clearing emergency mode.
pub fn record_emergency_cleared() {
    gauge!("emergency_mode_active").set(0.0);
}

// ============================================================================
// Heartbeat
// ============================================================================

/// Update the heartbeat age gauge.
pub fn set_heartbeat_staleness(seconds: f64) {
    gauge!("heartbeat_staleness_seconds").set(seconds);
}

/// Record a self-healing action.
pub fn record_heartbeat_mitigation(action: &str) {
    counter!("heartbeat_mitigations_total", "action" => action.to_string()).increment(1);
}

// ============================================================================
// Escalation
// ============================================================================

/// Record a position entering a ladder level.
pub fn record_escalation(level: &str) {
    counter!("stuck_position_escalations_total", "level" => level.to_string()).increment(1);
}

/// Record a resolved incident.
pub fn record_incident_resolved(max_level: &str, recovery_seconds: f64) {
    counter!("recovery_incidents_total", "max_level" => max_level.to_string()).increment(1);
    histogram!("recovery_incident_duration_seconds").record(recovery_seconds);
}

/// Update the number of positions under active recovery.
pub fn set_active_recoveries(count: usize) {
    gauge!("active_position_recoveries").set(count as f64);
}
