//! Durable emergency-mode flag and the order gate it enforces.
//!
//! Once raised, the flag survives restarts as a small JSON file and blocks
//! every bot-driven order placement until an operator clears it. A flag
//! file that exists but cannot be parsed still counts as raised.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::error::{Classify, ErrorKind};
use crate::observability::metrics;

/// What put the engine into emergency mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerSource {
    /// Restart found a snapshot older than the downtime threshold.
    StaleRecovery,
    /// Reconcile, reattach or resume failed during startup recovery.
    RecoveryFailure,
    /// The heartbeat stayed stale through mitigation.
    HeartbeatFreeze,
    /// Panic or other unhandled fault.
    UnhandledFault,
    /// A stuck position exhausted the escalation ladder.
    EscalationShutdown,
    /// The flag file was found unreadable.
    CorruptFlag,
}

impl TriggerSource {
    /// Label for logs and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::StaleRecovery => "stale_recovery",
            Self::RecoveryFailure => "recovery_failure",
            Self::HeartbeatFreeze => "heartbeat_freeze",
            Self::UnhandledFault => "unhandled_fault",
            Self::EscalationShutdown => "escalation_shutdown",
            Self::CorruptFlag => "corrupt_flag",
        }
    }
}

/// Contents of the flag file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmergencyRecord {
    /// When emergency mode was entered.
    pub activated_at: DateTime<Utc>,
    /// Trigger.
    pub source: TriggerSource,
    /// Free-text reason.
    pub reason: String,
}

/// Refusal from the order gate.
#[derive(Debug, Clone, Error)]
#[error("Emergency mode active ({reason}): new orders blocked")]
pub struct OrderBlocked {
    /// Reason emergency mode was entered.
    pub reason: String,
}

impl Classify for OrderBlocked {
    fn kind(&self) -> ErrorKind {
        ErrorKind::Unrecoverable
    }
}

/// Process-wide emergency-mode switch, mirrored to disk.
#[derive(Debug)]
pub struct EmergencyFlag {
    active: AtomicBool,
    path: Option<PathBuf>,
    record: RwLock<Option<EmergencyRecord>>,
}

impl EmergencyFlag {
    /// Flag without a backing file.
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            active: AtomicBool::new(false),
            path: None,
            record: RwLock::new(None),
        }
    }

    /// Flag backed by `path`, raised if the file already exists.
    #[must_use]
    pub fn load(path: impl Into<PathBuf>, now: DateTime<Utc>) -> Self {
        let path = path.into();
        let record = match std::fs::read(&path) {
            Ok(bytes) => Some(
                serde_json::from_slice::<EmergencyRecord>(&bytes).unwrap_or_else(|e| {
                    warn!(path = %path.display(), error = %e, "Emergency flag file unreadable, treating as active");
                    EmergencyRecord {
                        activated_at: now,
                        source: TriggerSource::CorruptFlag,
                        reason: format!("unreadable flag file: {e}"),
                    }
                }),
            ),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Emergency flag file unreadable, treating as active");
                Some(EmergencyRecord {
                    activated_at: now,
                    source: TriggerSource::CorruptFlag,
                    reason: format!("unreadable flag file: {e}"),
                })
            }
        };

        if let Some(record) = &record {
            warn!(
                source = record.source.as_str(),
                reason = %record.reason,
                activated_at = %record.activated_at,
                "Emergency mode flag present"
            );
        }

        Self {
            active: AtomicBool::new(record.is_some()),
            path: Some(path),
            record: RwLock::new(record),
        }
    }

    /// Whether emergency mode is active.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Activation details, if active.
    #[must_use]
    pub fn record(&self) -> Option<EmergencyRecord> {
        self.record.read().clone()
    }

    /// Flag file location.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Raise the flag. Returns `true` only for the call that raised it.
    pub fn activate(&self, record: EmergencyRecord) -> bool {
        if self
            .active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }

        metrics::record_emergency_activation(record.source.as_str());
        error!(
            source = record.source.as_str(),
            reason = %record.reason,
            "EMERGENCY MODE ACTIVATED"
        );

        if let Some(path) = &self.path {
            if let Err(e) = write_flag_file(path, &record) {
                error!(path = %path.display(), error = %e, "Failed to persist emergency flag");
            }
        }
        *self.record.write() = Some(record);
        true
    }

    /// Lower the flag. Returns whether it was raised.
    pub fn clear(&self, operator: &str) -> std::io::Result<bool> {
        if let Some(path) = &self.path {
            match std::fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }
        let was_active = self.active.swap(false, Ordering::SeqCst);
        let previous = self.record.write().take();
        metrics::record_emergency_cleared();
        info!(
            operator = %operator,
            was_active,
            previous_reason = previous.as_ref().map_or("", |r| r.reason.as_str()),
            "Emergency mode cleared by operator"
        );
        Ok(was_active)
    }

    /// Order gate: refuse when emergency mode is active.
    pub fn check_order_gate(&self) -> Result<(), OrderBlocked> {
        if !self.is_active() {
            return Ok(());
        }
        let reason = self
            .record
            .read()
            .as_ref()
            .map_or_else(|| "unknown".to_string(), |r| r.reason.clone());
        Err(OrderBlocked { reason })
    }
}

fn write_flag_file(path: &Path, record: &EmergencyRecord) -> std::io::Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    let bytes = serde_json::to_vec_pretty(record).map_err(std::io::Error::other)?;
    let mut temp = path.as_os_str().to_owned();
    temp.push(".tmp");
    let temp = PathBuf::from(temp);
    {
        let mut file = File::create(&temp)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
    }
    std::fs::rename(&temp, path)
}
