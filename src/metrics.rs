//! Process-wide operation counters, held in an explicit registry object that
//! is created at startup and passed by reference. No global state.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counter registry for a single database instance.
#[derive(Debug, Default)]
pub struct Metrics {
    /// CAS rejections observed by the OCC loop.
    pub occ_conflicts: AtomicU64,
    /// Write attempts replayed after a CAS rejection.
    pub occ_retries: AtomicU64,
    /// Records appended to the WAL.
    pub wal_records: AtomicU64,
    /// Checkpoints that truncated the WAL prefix.
    pub wal_checkpoints: AtomicU64,
    /// Index updates that failed and left a branch stale.
    pub index_failures: AtomicU64,
    /// Catch-up walks completed by the index.
    pub index_catchups: AtomicU64,
    /// Successful upstream pushes.
    pub remote_pushes: AtomicU64,
    /// Failed pushes or pulls (local state unaffected).
    pub remote_errors: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Increment helper keeping call sites terse.
pub fn inc(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Read helper for tests and adapters.
pub fn get(counter: &AtomicU64) -> u64 {
    counter.load(Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_start_at_zero_and_increment() {
        let m = Metrics::new();
        assert_eq!(get(&m.occ_conflicts), 0);
        inc(&m.occ_conflicts);
        inc(&m.occ_conflicts);
        inc(&m.occ_retries);
        assert_eq!(get(&m.occ_conflicts), 2);
        assert_eq!(get(&m.occ_retries), 1);
    }
}
