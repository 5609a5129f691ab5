//! Durable snapshots of the trading state.
//!
//! # Write path
//!
//! ```text
//! capture (under write gate) ─► seal (SHA-256) ─► write temp + fsync
//!                                                     │
//!                     primary ──rename──► backup ◄────┘
//!                     temp    ──rename──► primary
//! ```
//!
//! # Read path
//!
//! Primary first, then backup. A slot is usable only if it decodes, carries
//! a version, its checkpoint hash matches and it is not older than the
//! configured maximum age.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use super::StoreError;
use crate::clock::{Clock, elapsed_between};
use crate::config::PersistenceConfig;
use crate::error::Classify;
use crate::models::SystemStateSnapshot;
use crate::observability::metrics;
use crate::state::TradingState;

/// Which slot a snapshot was loaded from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotSource {
    /// The primary file.
    Primary,
    /// The rolling backup.
    Backup,
}

/// Summary of a successful snapshot write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotReceipt {
    /// Capture time, also the snapshot's `lastUpdated`.
    pub taken_at: DateTime<Utc>,
    /// Positions written.
    pub positions: usize,
    /// Pending orders written.
    pub pending_orders: usize,
    /// Serialized size.
    pub bytes: usize,
    /// Checkpoint hash written.
    pub checkpoint_hash: String,
}

/// Result of looking for prior state at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadOutcome {
    /// Neither slot exists.
    NoPriorState,
    /// A slot passed validation.
    Loaded {
        /// The validated snapshot.
        snapshot: Box<SystemStateSnapshot>,
        /// Slot it came from.
        source: SnapshotSource,
    },
    /// State files exist but none passed validation.
    Unusable {
        /// Why each slot was rejected.
        reasons: Vec<String>,
    },
}

/// Snapshot store with one primary and one rolling backup.
#[derive(Debug)]
pub struct StateStore {
    primary: PathBuf,
    backup: PathBuf,
    temp: PathBuf,
    system_version: String,
    max_age: Duration,
    clock: Arc<dyn Clock>,
}

impl StateStore {
    /// Create a store from configuration.
    #[must_use]
    pub fn new(config: &PersistenceConfig, clock: Arc<dyn Clock>) -> Self {
        let primary = config.primary_path();
        let mut temp = primary.clone().into_os_string();
        temp.push(".tmp");
        Self {
            backup: config.backup_path(),
            temp: PathBuf::from(temp),
            primary,
            system_version: config.system_version.clone(),
            max_age: config.max_state_age(),
            clock,
        }
    }

    /// Primary slot path.
    #[must_use]
    pub fn primary_path(&self) -> &Path {
        &self.primary
    }

    /// Backup slot path.
    #[must_use]
    pub fn backup_path(&self) -> &Path {
        &self.backup
    }

    /// Whether any state file exists.
    #[must_use]
    pub fn has_prior_state(&self) -> bool {
        self.primary.exists() || self.backup.exists()
    }

    /// Capture, seal and durably write a snapshot.
    pub fn snapshot(&self, state: &TradingState) -> Result<SnapshotReceipt, StoreError> {
        let started = Instant::now();
        let now = self.clock.now();

        let mut snapshot = state.capture(&self.system_version, now);
        snapshot.seal()?;
        let bytes = serde_json::to_vec_pretty(&snapshot)?;
        self.write_atomically(&bytes)?;

        metrics::record_snapshot(true, started.elapsed().as_secs_f64());
        debug!(
            positions = snapshot.positions.len(),
            pending_orders = snapshot.pending_orders.len(),
            bytes = bytes.len(),
            "State snapshot written"
        );

        Ok(SnapshotReceipt {
            taken_at: now,
            positions: snapshot.positions.len(),
            pending_orders: snapshot.pending_orders.len(),
            bytes: bytes.len(),
            checkpoint_hash: snapshot.checkpoint_hash,
        })
    }

    /// Snapshot without propagating failures.
    ///
    /// Used by the persistence tick: a failed write is logged as critical
    /// and retried on the next tick, never surfaced to the host.
    pub fn snapshot_best_effort(&self, state: &TradingState) -> Option<SnapshotReceipt> {
        match self.snapshot(state) {
            Ok(receipt) => Some(receipt),
            Err(e) => {
                metrics::record_snapshot(false, 0.0);
                error!(
                    error = %e,
                    kind = e.kind().as_str(),
                    path = %self.primary.display(),
                    "CRITICAL: state snapshot failed"
                );
                None
            }
        }
    }

    fn write_atomically(&self, bytes: &[u8]) -> Result<(), StoreError> {
        if let Some(dir) = self.primary.parent() {
            std::fs::create_dir_all(dir).map_err(|e| StoreError::io(dir, e))?;
        }

        {
            let mut file = File::create(&self.temp).map_err(|e| StoreError::io(&self.temp, e))?;
            file.write_all(bytes)
                .and_then(|()| file.sync_all())
                .map_err(|e| StoreError::io(&self.temp, e))?;
        }

        if self.primary.exists() {
            std::fs::rename(&self.primary, &self.backup)
                .map_err(|e| StoreError::io(&self.backup, e))?;
        }
        std::fs::rename(&self.temp, &self.primary).map_err(|e| StoreError::io(&self.primary, e))?;

        // Persist the directory entries; not supported everywhere.
        if let Some(dir) = self.primary.parent() {
            let _ = File::open(dir).and_then(|d| d.sync_all());
        }
        Ok(())
    }

    /// Load the freshest usable snapshot.
    pub fn load(&self) -> LoadOutcome {
        if !self.has_prior_state() {
            return LoadOutcome::NoPriorState;
        }

        let mut reasons = Vec::new();
        for (path, source) in [
            (&self.primary, SnapshotSource::Primary),
            (&self.backup, SnapshotSource::Backup),
        ] {
            match self.read_slot(path) {
                Ok(snapshot) => {
                    if source == SnapshotSource::Backup {
                        warn!(
                            path = %path.display(),
                            "Primary snapshot unusable, recovered from backup"
                        );
                    }
                    return LoadOutcome::Loaded {
                        snapshot: Box::new(snapshot),
                        source,
                    };
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Snapshot slot rejected");
                    reasons.push(format!("{source:?}: {e}"));
                }
            }
        }

        LoadOutcome::Unusable { reasons }
    }

    fn read_slot(&self, path: &Path) -> Result<SystemStateSnapshot, StoreError> {
        let bytes = std::fs::read(path).map_err(|e| StoreError::io(path, e))?;
        let snapshot: SystemStateSnapshot = serde_json::from_slice(&bytes)?;
        self.validate(&snapshot)?;
        Ok(snapshot)
    }

    /// Check version, checksum and age.
    pub fn validate(&self, snapshot: &SystemStateSnapshot) -> Result<(), StoreError> {
        if snapshot.system_version.trim().is_empty() {
            return Err(StoreError::Integrity("missing system version".to_string()));
        }
        if !snapshot.hash_matches() {
            return Err(StoreError::Integrity(
                "checkpoint hash does not match contents".to_string(),
            ));
        }
        let age = elapsed_between(snapshot.last_updated, self.clock.now());
        if age > self.max_age {
            return Err(StoreError::Integrity(format!(
                "snapshot is {}s old, limit {}s",
                age.as_secs(),
                self.max_age.as_secs()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::models::{OrderSide, OrderStatus, OrderType, PendingOrder, Position};
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 14, 30, 0).single().unwrap()
    }

    fn setup() -> (tempfile::TempDir, Arc<ManualClock>, StateStore) {
        let dir = tempfile::tempdir().unwrap();
        let config = PersistenceConfig {
            state_dir: dir.path().to_string_lossy().into_owned(),
            ..Default::default()
        };
        let clock = Arc::new(ManualClock::new(start()));
        let store = StateStore::new(&config, clock.clone());
        (dir, clock, store)
    }

    fn populated_state() -> TradingState {
        let state = TradingState::new();
        let mut es = Position::new("ES", dec!(2), dec!(5000.25), start(), "orb");
        es.stop_order_id = Some("stop-1".to_string());
        state.upsert_position(es);
        state.upsert_position(Position::new("NQ", dec!(-1), dec!(18000), start(), "vwap"));
        state.upsert_order(PendingOrder {
            order_id: "stop-1".to_string(),
            symbol: "ES".to_string(),
            side: OrderSide::Sell,
            quantity: dec!(2),
            order_type: OrderType::Stop,
            price: Some(dec!(4990.25)),
            status: OrderStatus::Working,
            submitted_at: start(),
        });
        state
    }

    #[test]
    fn test_no_prior_state() {
        let (_dir, _clock, store) = setup();
        assert_eq!(store.load(), LoadOutcome::NoPriorState);
    }

    #[test]
    fn test_write_then_load_reproduces_maps() {
        let (_dir, _clock, store) = setup();
        let state = populated_state();

        let receipt = store.snapshot(&state).unwrap();
        assert_eq!(receipt.positions, 2);
        assert_eq!(receipt.checkpoint_hash.len(), 64);

        let LoadOutcome::Loaded { snapshot, source } = store.load() else {
            panic!("expected a usable snapshot");
        };
        assert_eq!(source, SnapshotSource::Primary);

        let restored = TradingState::new();
        restored.restore(&snapshot);
        assert_eq!(restored.positions(), state.positions());
        assert_eq!(restored.pending_orders(), state.pending_orders());
    }

    #[test]
    fn test_second_snapshot_rotates_backup() {
        let (_dir, clock, store) = setup();
        let state = populated_state();

        store.snapshot(&state).unwrap();
        assert!(!store.backup_path().exists());

        clock.advance(Duration::from_millis(100));
        store.snapshot(&state).unwrap();
        assert!(store.backup_path().exists());
        assert!(store.primary_path().exists());
    }

    #[test]
    fn test_corrupt_primary_falls_back_to_backup() {
        let (_dir, clock, store) = setup();
        let state = populated_state();
        store.snapshot(&state).unwrap();
        clock.advance(Duration::from_millis(100));
        store.snapshot(&state).unwrap();

        std::fs::write(store.primary_path(), b"{ not json").unwrap();

        let LoadOutcome::Loaded { source, .. } = store.load() else {
            panic!("expected backup to be used");
        };
        assert_eq!(source, SnapshotSource::Backup);
    }

    #[test]
    fn test_tampered_snapshot_is_rejected() {
        let (_dir, _clock, store) = setup();
        store.snapshot(&populated_state()).unwrap();

        let text = std::fs::read_to_string(store.primary_path()).unwrap();
        std::fs::write(store.primary_path(), text.replace("5000.25", "5100.25")).unwrap();

        let LoadOutcome::Unusable { reasons } = store.load() else {
            panic!("expected tampered snapshot to be rejected");
        };
        assert!(reasons.iter().any(|r| r.contains("checkpoint hash")));
    }

    #[test]
    fn test_stale_snapshot_is_rejected() {
        let (_dir, clock, store) = setup();
        store.snapshot(&populated_state()).unwrap();

        clock.advance(Duration::from_secs(25 * 60 * 60));

        assert!(matches!(store.load(), LoadOutcome::Unusable { .. }));
    }

    #[test]
    fn test_best_effort_swallows_failures() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"file").unwrap();
        let config = PersistenceConfig {
            state_dir: blocker.to_string_lossy().into_owned(),
            ..Default::default()
        };
        let store = StateStore::new(&config, Arc::new(ManualClock::new(start())));

        assert!(store.snapshot_best_effort(&populated_state()).is_none());
    }
}
