//! Recovery Core Binary
//!
//! Runs startup crash recovery against the paper broker, then supervises
//! snapshots, the heartbeat monitor and the stuck-position escalator until
//! SIGINT or SIGTERM.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin recovery-core
//! ```
//!
//! # Environment Variables
//!
//! - `RECOVERY_CONFIG`: Path to the YAML config (default: recovery.yaml)
//! - `RUST_LOG`: Log filter (default: `observability.logging.level`)
//! - `OTEL_ENABLED`: Set to `false` to disable OTLP export

use std::sync::Arc;

use anyhow::Context;
use recovery_core::clock::{Clock, SystemClock};
use recovery_core::config::{Config, load_config};
use recovery_core::infrastructure::{
    Container, FileAlertSink, PaperBroker, Ports, StateStrategyController,
};
use recovery_core::observability::{MetricsConfig, init_metrics};
use recovery_core::recovery::RecoveryOutcome;
use recovery_core::runtime::Supervisor;
use recovery_core::state::TradingState;
use recovery_core::telemetry::init_telemetry;
use tokio::signal;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    load_dotenv();

    let (config, config_error) = match load_config(None) {
        Ok(config) => (config, None),
        Err(e) => (Config::default(), Some(e)),
    };

    let _telemetry = init_telemetry(&config.observability.logging);
    if let Some(e) = config_error {
        tracing::warn!(error = %e, "Config not loaded, using defaults");
    }

    tracing::info!(
        version = %config.persistence.system_version,
        state_dir = %config.persistence.state_dir,
        "Starting recovery core"
    );

    if config.observability.metrics.enabled {
        let metrics_config = MetricsConfig::from_settings(&config.observability.metrics)
            .context("invalid metrics settings")?;
        init_metrics(&metrics_config).context("failed to start metrics exporter")?;
        tracing::info!(addr = %metrics_config.listen_addr, "Metrics exporter listening");
    }

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let state = Arc::new(TradingState::new());
    let broker = Arc::new(PaperBroker::new(clock.clone()));
    let ports = Ports {
        positions: broker.clone(),
        gateway: broker,
        strategies: Arc::new(StateStrategyController::new(state.clone(), clock.clone())),
        alerts: Arc::new(FileAlertSink::new(
            config.emergency.alert_log_path(),
            clock.clone(),
        )),
    };
    let container = Container::new(config, clock, state, ports);

    container
        .crash_guard()
        .install_panic_hook(tokio::runtime::Handle::current());

    let report = container.orchestrator().recover().await;
    tracing::info!(
        outcome = report.outcome.as_str(),
        phases = report.phases.len(),
        "Startup recovery finished"
    );
    if report.outcome == RecoveryOutcome::EmergencyMode {
        tracing::error!(
            error = report.error.as_deref().unwrap_or("unknown"),
            "Running in emergency mode, new orders are blocked"
        );
    }

    let mut supervisor = Supervisor::new(&container);
    supervisor.start();
    tracing::info!("Recovery core ready");

    shutdown_signal().await?;

    tracing::info!(
        timeout_secs = container.config().emergency.shutdown_timeout().as_secs(),
        "Graceful shutdown started"
    );
    match supervisor.shutdown().await {
        Some(receipt) => tracing::info!(positions = receipt.positions, "Final state saved"),
        None => tracing::warn!("Final state snapshot was not written"),
    }

    tracing::info!("Recovery core stopped");
    Ok(())
}

/// Load .env file from current or ancestor directories.
fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = cwd.as_path();
        while let Some(parent) = dir.parent() {
            let env_path = parent.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
            dir = parent;
        }
    }
}

/// Wait for shutdown signal (SIGTERM or SIGINT).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())
            .context("failed to install SIGTERM handler")?;
        tokio::select! {
            result = signal::ctrl_c() => {
                result.context("failed to listen for Ctrl+C")?;
                tracing::info!("Received Ctrl+C, initiating shutdown");
            }
            _ = terminate.recv() => {
                tracing::info!("Received SIGTERM, initiating shutdown");
            }
        }
    }

    #[cfg(not(unix))]
    {
        signal::ctrl_c()
            .await
            .context("failed to listen for Ctrl+C")?;
        tracing::info!("Received Ctrl+C, initiating shutdown");
    }

    Ok(())
}
