//! State persistence configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// State persistence configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// Directory holding the state files and audit logs.
    #[serde(default = "default_state_dir")]
    pub state_dir: String,
    /// File name of the primary snapshot.
    #[serde(default = "default_primary_file")]
    pub primary_file: String,
    /// File name of the rolling backup snapshot.
    #[serde(default = "default_backup_file")]
    pub backup_file: String,
    /// Snapshot interval in milliseconds.
    #[serde(default = "default_snapshot_interval_ms")]
    pub snapshot_interval_ms: u64,
    /// Snapshots older than this are treated as unusable.
    #[serde(default = "default_max_state_age_secs")]
    pub max_state_age_secs: u64,
    /// Version stamped into every snapshot.
    #[serde(default = "default_system_version")]
    pub system_version: String,
    /// File name of the reconciliation audit log.
    #[serde(default = "default_reconciliation_audit_file")]
    pub reconciliation_audit_file: String,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            primary_file: default_primary_file(),
            backup_file: default_backup_file(),
            snapshot_interval_ms: default_snapshot_interval_ms(),
            max_state_age_secs: default_max_state_age_secs(),
            system_version: default_system_version(),
            reconciliation_audit_file: default_reconciliation_audit_file(),
        }
    }
}

impl PersistenceConfig {
    /// Path of the primary snapshot.
    #[must_use]
    pub fn primary_path(&self) -> PathBuf {
        PathBuf::from(&self.state_dir).join(&self.primary_file)
    }

    /// Path of the backup snapshot.
    #[must_use]
    pub fn backup_path(&self) -> PathBuf {
        PathBuf::from(&self.state_dir).join(&self.backup_file)
    }

    /// Path of the reconciliation audit log.
    #[must_use]
    pub fn reconciliation_audit_path(&self) -> PathBuf {
        PathBuf::from(&self.state_dir).join(&self.reconciliation_audit_file)
    }

    /// Snapshot tick.
    #[must_use]
    pub const fn snapshot_interval(&self) -> Duration {
        Duration::from_millis(self.snapshot_interval_ms)
    }

    /// Maximum acceptable snapshot age.
    #[must_use]
    pub const fn max_state_age(&self) -> Duration {
        Duration::from_secs(self.max_state_age_secs)
    }
}

fn default_state_dir() -> String {
    "./data/state".to_string()
}

fn default_primary_file() -> String {
    "system_state.json".to_string()
}

fn default_backup_file() -> String {
    "system_state.backup.json".to_string()
}

const fn default_snapshot_interval_ms() -> u64 {
    100
}

const fn default_max_state_age_secs() -> u64 {
    24 * 60 * 60
}

fn default_system_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

fn default_reconciliation_audit_file() -> String {
    "reconciliation_audit.jsonl".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_persistence_config_defaults() {
        let config = PersistenceConfig::default();
        assert_eq!(config.snapshot_interval(), Duration::from_millis(100));
        assert_eq!(config.max_state_age(), Duration::from_secs(86_400));
        assert!(!config.system_version.is_empty());
        assert!(config.primary_path().ends_with("system_state.json"));
        assert!(config.backup_path().ends_with("system_state.backup.json"));
    }
}
