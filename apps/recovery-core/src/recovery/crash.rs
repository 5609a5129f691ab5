//! Unhandled-fault handling.
//!
//! On a panic the guard writes a crash dump, sends a critical alert and runs
//! emergency liquidation on the runtime, blocking the faulting thread until
//! liquidation finishes or the shutdown timeout expires. Either way the hook
//! then returns and the default panic handling continues.
//!
//! The blocking wait needs another runtime worker to make progress, so the
//! hook is only useful on a multi-threaded runtime; on a single thread it
//! simply times out.

use std::backtrace::Backtrace;
use std::fs;
use std::panic::PanicHookInfo;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::runtime::Handle;
use tracing::{error, warn};

use super::emergency::TriggerSource;
use super::heartbeat::LivenessPulse;
use super::liquidator::{EmergencyLiquidator, LiquidationReport};
use super::process::ProcessStats;
use crate::clock::Clock;
use crate::ports::AlertSink;
use crate::state::TradingState;

/// One document per unhandled fault.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CrashDump {
    /// When the fault was handled.
    pub timestamp: DateTime<Utc>,
    /// Error text.
    pub error: String,
    /// Captured stack trace.
    pub backtrace: String,
    /// Open positions at the time of the fault.
    pub position_count: usize,
    /// Symbols of those positions.
    pub open_symbols: Vec<String>,
    /// Whether emergency mode was already active.
    pub emergency_mode: bool,
    /// Last heartbeat.
    pub last_heartbeat: DateTime<Utc>,
    /// Seconds since the last heartbeat.
    pub heartbeat_age_secs: f64,
    /// Process figures.
    pub process: ProcessStats,
    /// Build version.
    pub system_version: String,
}

/// What happened to open positions during fault handling.
#[derive(Debug, Clone)]
pub enum ProtectionOutcome {
    /// Liquidation ran to completion.
    Completed(Box<LiquidationReport>),
    /// The shutdown timeout expired first.
    TimedOut,
    /// No runtime was available to run liquidation.
    Unavailable,
}

/// Result of handling one fault.
#[derive(Debug, Clone)]
pub enum FaultOutcome {
    /// The fault was handled.
    Handled {
        /// Where the dump was written, if it could be.
        dump_path: Option<PathBuf>,
        /// Position protection result.
        protection: ProtectionOutcome,
    },
    /// Another fault is already being handled.
    AlreadyHandling,
}

/// Crash dump writer and bounded shutdown protection.
pub struct CrashGuard {
    state: Arc<TradingState>,
    pulse: Arc<LivenessPulse>,
    liquidator: Arc<EmergencyLiquidator>,
    alerts: Arc<dyn AlertSink>,
    clock: Arc<dyn Clock>,
    dump_dir: PathBuf,
    shutdown_timeout: Duration,
    system_version: String,
    handling: AtomicBool,
}

impl CrashGuard {
    /// Create a guard.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        state: Arc<TradingState>,
        pulse: Arc<LivenessPulse>,
        liquidator: Arc<EmergencyLiquidator>,
        alerts: Arc<dyn AlertSink>,
        clock: Arc<dyn Clock>,
        dump_dir: impl Into<PathBuf>,
        shutdown_timeout: Duration,
        system_version: impl Into<String>,
    ) -> Self {
        Self {
            state,
            pulse,
            liquidator,
            alerts,
            clock,
            dump_dir: dump_dir.into(),
            shutdown_timeout,
            system_version: system_version.into(),
            handling: AtomicBool::new(false),
        }
    }

    /// Crash dump directory.
    #[must_use]
    pub fn dump_dir(&self) -> &Path {
        &self.dump_dir
    }

    /// Assemble a dump for a fault.
    #[must_use]
    pub fn build_dump(&self, error: &str, backtrace: &str) -> CrashDump {
        let now = self.clock.now();
        let open = self.state.open_positions();
        CrashDump {
            timestamp: now,
            error: error.to_string(),
            backtrace: backtrace.to_string(),
            position_count: open.len(),
            open_symbols: open.into_iter().map(|p| p.symbol).collect(),
            emergency_mode: self.liquidator.is_emergency_active(),
            last_heartbeat: self.pulse.last_beat(),
            heartbeat_age_secs: self.pulse.staleness(now).as_secs_f64(),
            process: ProcessStats::sample(),
            system_version: self.system_version.clone(),
        }
    }

    /// Write a dump as pretty JSON. Returns the file path.
    pub fn write_dump(&self, dump: &CrashDump) -> std::io::Result<PathBuf> {
        fs::create_dir_all(&self.dump_dir)?;
        let name = format!(
            "crash_{}_{}.json",
            dump.timestamp.format("%Y%m%dT%H%M%S%.3fZ"),
            dump.process.pid
        );
        let path = self.dump_dir.join(name);
        let bytes = serde_json::to_vec_pretty(dump).map_err(std::io::Error::other)?;
        fs::write(&path, bytes)?;
        Ok(path)
    }

    /// Run emergency liquidation on `handle` and wait for it, at most the
    /// shutdown timeout. Must not be called from inside an async task.
    pub fn protect_positions_blocking(&self, handle: &Handle, reason: &str) -> ProtectionOutcome {
        let liquidator = Arc::clone(&self.liquidator);
        let reason = reason.to_string();
        let (tx, rx) = mpsc::channel();
        handle.spawn(async move {
            let report = liquidator
                .liquidate_all(TriggerSource::UnhandledFault, &reason)
                .await;
            let _ = tx.send(report);
        });

        match rx.recv_timeout(self.shutdown_timeout) {
            Ok(report) => ProtectionOutcome::Completed(Box::new(report)),
            Err(RecvTimeoutError::Timeout) => {
                error!(
                    timeout_ms = self.shutdown_timeout.as_millis() as u64,
                    "Emergency protection did not finish before shutdown timeout"
                );
                ProtectionOutcome::TimedOut
            }
            Err(RecvTimeoutError::Disconnected) => {
                error!("Emergency protection task ended without a report");
                ProtectionOutcome::Unavailable
            }
        }
    }

    /// Dump, alert and protect positions. Only the first fault is handled.
    pub fn handle_fault(&self, handle: Option<&Handle>, error: &str, backtrace: &str) -> FaultOutcome {
        if self.handling.swap(true, Ordering::SeqCst) {
            warn!(error = %error, "Fault while already handling a fault");
            return FaultOutcome::AlreadyHandling;
        }

        let dump = self.build_dump(error, backtrace);
        let dump_path = match self.write_dump(&dump) {
            Ok(path) => Some(path),
            Err(e) => {
                error!(error = %e, "Failed to write crash dump");
                None
            }
        };

        let alert = format!(
            "CRITICAL UNHANDLED FAULT error=\"{}\" positions={} dump={}",
            error,
            dump.position_count,
            dump_path
                .as_deref()
                .map_or_else(|| "unwritten".to_string(), |p| p.display().to_string())
        );
        if let Err(e) = self.alerts.send(&alert) {
            error!(error = %e, "Failed to deliver fault alert");
        }

        let protection = match handle {
            Some(handle) => self.protect_positions_blocking(handle, error),
            None => {
                error!("No runtime handle, positions left unprotected");
                ProtectionOutcome::Unavailable
            }
        };

        FaultOutcome::Handled {
            dump_path,
            protection,
        }
    }

    /// Install a panic hook that runs [`Self::handle_fault`] before the
    /// previous hook.
    pub fn install_panic_hook(self: &Arc<Self>, handle: Handle) {
        let guard = Arc::clone(self);
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            let backtrace = Backtrace::force_capture().to_string();
            let message = panic_message(info);
            guard.handle_fault(Some(&handle), &message, &backtrace);
            previous(info);
        }));
    }
}

fn panic_message(info: &PanicHookInfo<'_>) -> String {
    let payload = info
        .payload()
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| info.payload().downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string());
    match info.location() {
        Some(loc) => format!("{payload} at {}:{}", loc.file(), loc.line()),
        None => payload,
    }
}
