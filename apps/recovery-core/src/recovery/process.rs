//! Basic process metrics from procfs.
//!
//! Linux only; every field is `None` elsewhere or when procfs is unreadable.

use serde::Serialize;

/// Point-in-time process figures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProcessStats {
    /// OS process id.
    pub pid: u32,
    /// Resident set size in bytes.
    pub rss_bytes: Option<u64>,
    /// OS thread count.
    pub threads: Option<u64>,
}

impl ProcessStats {
    /// Sample the current process.
    #[must_use]
    pub fn sample() -> Self {
        let status = std::fs::read_to_string("/proc/self/status").ok();
        let field = |name: &str| status.as_deref().and_then(|s| parse_status_field(s, name));
        Self {
            pid: std::process::id(),
            rss_bytes: field("VmRSS:").map(|kb| kb * 1024),
            threads: field("Threads:"),
        }
    }
}

/// First integer after `name` in `/proc/<pid>/status` text.
fn parse_status_field(status: &str, name: &str) -> Option<u64> {
    status
        .lines()
        .find_map(|line| line.strip_prefix(name))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|n| n.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_status_fields() {
        let status = "Name:\trecovery-core\nVmRSS:\t  20480 kB\nThreads:\t9\n";
        assert_eq!(parse_status_field(status, "VmRSS:"), Some(20480));
        assert_eq!(parse_status_field(status, "Threads:"), Some(9));
        assert_eq!(parse_status_field(status, "VmSwap:"), None);
    }

    #[test]
    fn test_sample_has_pid() {
        assert_eq!(ProcessStats::sample().pid, std::process::id());
    }
}
