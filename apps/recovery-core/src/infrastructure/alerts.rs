//! Operator alert sinks.
//!
//! [`FileAlertSink`] appends one timestamp-prefixed line per alert to a
//! plain-text file and syncs it before returning. It shares nothing with the
//! tracing pipeline, so alerts still land when logging is degraded or the
//! process is panicking.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::clock::Clock;
use crate::ports::{AlertError, AlertSink};

/// Append-only plain-text alert log.
#[derive(Debug)]
pub struct FileAlertSink {
    path: PathBuf,
    clock: Arc<dyn Clock>,
    write_lock: Mutex<()>,
}

impl FileAlertSink {
    /// Create a sink writing to `path`. Parent directories are created on
    /// first write.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, clock: Arc<dyn Clock>) -> Self {
        Self {
            path: path.into(),
            clock,
            write_lock: Mutex::new(()),
        }
    }

    /// Alert log location.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AlertSink for FileAlertSink {
    fn send(&self, message: &str) -> Result<(), AlertError> {
        let _guard = self.write_lock.lock();
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        // One alert per line.
        let line = message.replace('\n', " ");
        writeln!(file, "{} {}", self.clock.now().to_rfc3339(), line)?;
        file.sync_data()?;
        // Operators tailing stderr see it too.
        eprintln!("ALERT {line}");
        Ok(())
    }
}

/// Sink that keeps alerts in memory. Used by tests and dry runs.
#[derive(Debug, Default)]
pub struct RecordingAlertSink {
    messages: Mutex<Vec<String>>,
}

impl RecordingAlertSink {
    /// Alerts received so far.
    #[must_use]
    pub fn messages(&self) -> Vec<String> {
        self.messages.lock().clone()
    }
}

impl AlertSink for RecordingAlertSink {
    fn send(&self, message: &str) -> Result<(), AlertError> {
        self.messages.lock().push(message.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_alerts_are_timestamped_and_appended() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("alerts").join("emergency_alerts.log");
        let at = Utc.with_ymd_and_hms(2026, 3, 2, 14, 30, 0).unwrap();
        let sink = FileAlertSink::new(&path, Arc::new(ManualClock::new(at)));

        sink.send("first").unwrap();
        sink.send("second\nline").unwrap();

        let contents = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], "2026-03-02T14:30:00+00:00 first");
        assert!(lines[1].ends_with("second line"));
    }

    #[test]
    fn test_unwritable_path_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        fs::write(&blocker, b"x").unwrap();
        let sink = FileAlertSink::new(
            blocker.join("alerts.log"),
            Arc::new(ManualClock::new(Utc::now())),
        );

        assert!(sink.send("lost").is_err());
    }
}
