//! Process-wide runtime counters (lock-free, relaxed ordering).

use std::sync::atomic::{AtomicU64, Ordering};

static WEFT_COMMITS_TOTAL: AtomicU64 = AtomicU64::new(0);
static WEFT_ABORTS_TOTAL: AtomicU64 = AtomicU64::new(0);
static WEFT_CANCELS_TOTAL: AtomicU64 = AtomicU64::new(0);
static WEFT_TIMEOUT_ABORTS_TOTAL: AtomicU64 = AtomicU64::new(0);

/// Snapshot of the runtime counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct RuntimeStats {
    /// Outermost commits.
    pub weft_commits_total: u64,
    /// Conflict aborts (all of them retried internally).
    pub weft_aborts_total: u64,
    /// Cancel-and-throw unwinds surfaced to the application.
    pub weft_cancels_total: u64,
    /// Conflict aborts triggered specifically by a bounded spin expiring.
    pub weft_timeout_aborts_total: u64,
}

/// Read current runtime counters.
#[must_use]
pub fn runtime_stats() -> RuntimeStats {
    RuntimeStats {
        weft_commits_total: WEFT_COMMITS_TOTAL.load(Ordering::Relaxed),
        weft_aborts_total: WEFT_ABORTS_TOTAL.load(Ordering::Relaxed),
        weft_cancels_total: WEFT_CANCELS_TOTAL.load(Ordering::Relaxed),
        weft_timeout_aborts_total: WEFT_TIMEOUT_ABORTS_TOTAL.load(Ordering::Relaxed),
    }
}

/// Reset counters (for tests).
pub fn reset_runtime_stats() {
    WEFT_COMMITS_TOTAL.store(0, Ordering::Relaxed);
    WEFT_ABORTS_TOTAL.store(0, Ordering::Relaxed);
    WEFT_CANCELS_TOTAL.store(0, Ordering::Relaxed);
    WEFT_TIMEOUT_ABORTS_TOTAL.store(0, Ordering::Relaxed);
}

#[inline]
pub(crate) fn note_commit() {
    WEFT_COMMITS_TOTAL.fetch_add(1, Ordering::Relaxed);
}

#[inline]
pub(crate) fn note_abort() {
    WEFT_ABORTS_TOTAL.fetch_add(1, Ordering::Relaxed);
}

#[inline]
pub(crate) fn note_cancel() {
    WEFT_CANCELS_TOTAL.fetch_add(1, Ordering::Relaxed);
}

#[inline]
pub(crate) fn note_timeout_abort() {
    WEFT_TIMEOUT_ABORTS_TOTAL.fetch_add(1, Ordering::Relaxed);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let before = runtime_stats();
        note_commit();
        note_commit();
        note_abort();
        let after = runtime_stats();
        assert!(after.weft_commits_total >= before.weft_commits_total + 2);
        assert!(after.weft_aborts_total >= before.weft_aborts_total + 1);
    }

}
