//! Incident archive.
//!
//! Alerts and resolved incidents share one JSON-lines file so a post-mortem
//! reads the whole story in order.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::types::{RecoveryIncident, StuckPositionAlert};
use crate::persistence::{JsonlLog, StoreError};

/// One line of the archive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "record", rename_all = "snake_case")]
pub enum IncidentRecord {
    /// Detection.
    Alert(StuckPositionAlert),
    /// Resolution.
    Incident(RecoveryIncident),
}

/// Durable alert and incident archive.
#[derive(Debug)]
pub struct IncidentLog {
    log: JsonlLog,
}

impl IncidentLog {
    /// Archive at `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            log: JsonlLog::new(path),
        }
    }

    /// File location.
    #[must_use]
    pub fn path(&self) -> &Path {
        self.log.path()
    }

    /// Record a detection.
    pub fn log_alert(&self, alert: &StuckPositionAlert) -> Result<(), StoreError> {
        self.log.append(&IncidentRecord::Alert(alert.clone()))
    }

    /// Record a resolution.
    pub fn log_incident(&self, incident: &RecoveryIncident) -> Result<(), StoreError> {
        self.log.append(&IncidentRecord::Incident(incident.clone()))
    }

    /// Everything archived so far.
    pub fn read_all(&self) -> Result<Vec<IncidentRecord>, StoreError> {
        self.log.read_all()
    }
}
