//! Per-session counters

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Statistics for a single acquisition session
///
/// Written by the session's reader thread, read by whoever owns the session.
#[derive(Debug, Default)]
pub struct SessionStats {
    pub units_read: AtomicU64,
    pub parse_errors: AtomicU64,
    pub readings_published: AtomicU64,
}

impl SessionStats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// One line, poll response or sample block came off the link
    pub fn record_read(&self) {
        self.units_read.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_parse_error(&self) {
        self.parse_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_published(&self) {
        self.readings_published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            units_read: self.units_read.load(Ordering::Relaxed),
            parse_errors: self.parse_errors.load(Ordering::Relaxed),
            readings_published: self.readings_published.load(Ordering::Relaxed),
        }
    }
}

/// Plain copy of the counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub units_read: u64,
    pub parse_errors: u64,
    pub readings_published: u64,
}

impl std::fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "read: {} | parse errors: {} | published: {}",
            self.units_read, self.parse_errors, self.readings_published
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let stats = SessionStats::new();
        stats.record_read();
        stats.record_read();
        stats.record_parse_error();
        stats.record_published();

        let snap = stats.snapshot();
        assert_eq!(snap.units_read, 2);
        assert_eq!(snap.parse_errors, 1);
        assert_eq!(snap.readings_published, 1);
    }
}
