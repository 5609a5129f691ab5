//! State persistence for crash recovery.
//!
//! Snapshots of the in-memory trading state, plus the append-only audit
//! logs written by the reconciler and the escalator.

mod audit;
mod store;

use std::path::Path;

use thiserror::Error;

pub use audit::JsonlLog;
pub use store::{LoadOutcome, SnapshotReceipt, SnapshotSource, StateStore};

use crate::error::{Classify, ErrorKind};

/// Errors from persistence operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// File system failure.
    #[error("I/O error on '{path}': {source}")]
    Io {
        /// File or directory involved.
        path: String,
        /// The underlying IO error.
        source: std::io::Error,
    },

    /// Encoding or decoding failure.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Snapshot failed validation.
    #[error("Snapshot integrity error: {0}")]
    Integrity(String),
}

impl StoreError {
    /// Wrap an I/O error with the path it concerned.
    pub fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.display().to_string(),
            source,
        }
    }
}

impl Classify for StoreError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::Io { .. } => ErrorKind::Transient,
            Self::Serialization(_) | Self::Integrity(_) => ErrorKind::StateIntegrity,
        }
    }
}
