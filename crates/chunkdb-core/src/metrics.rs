use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Counters describing how the dedup layer is performing.
#[derive(Debug, Default)]
pub struct DedupMetrics {
    lookups: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    rejected_hits: AtomicU64,
    fetches: AtomicU64,
    commits: AtomicU64,
    duplicate_commits: AtomicU64,
    integrity_failures: AtomicU64,
    lock_timeouts: AtomicU64,
    degraded: AtomicBool,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DedupMetricsSnapshot {
    pub lookups: u64,
    pub hits: u64,
    pub misses: u64,
    pub rejected_hits: u64,
    pub fetches: u64,
    pub commits: u64,
    pub duplicate_commits: u64,
    pub integrity_failures: u64,
    pub lock_timeouts: u64,
    pub degraded: bool,
}

impl DedupMetrics {
    pub(crate) fn lookup(&self) {
        self.lookups.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn rejected_hit(&self) {
        self.rejected_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn fetch(&self) {
        self.fetches.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn commit(&self) {
        self.commits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn duplicate_commit(&self) {
        self.duplicate_commits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn integrity_failure(&self) {
        self.integrity_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn lock_timeout(&self) {
        self.lock_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns `true` only for the call that flipped the flag.
    pub(crate) fn mark_degraded(&self) -> bool {
        !self.degraded.swap(true, Ordering::SeqCst)
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> DedupMetricsSnapshot {
        DedupMetricsSnapshot {
            lookups: self.lookups.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            rejected_hits: self.rejected_hits.load(Ordering::Relaxed),
            fetches: self.fetches.load(Ordering::Relaxed),
            commits: self.commits.load(Ordering::Relaxed),
            duplicate_commits: self.duplicate_commits.load(Ordering::Relaxed),
            integrity_failures: self.integrity_failures.load(Ordering::Relaxed),
            lock_timeouts: self.lock_timeouts.load(Ordering::Relaxed),
            degraded: self.is_degraded(),
        }
    }
}
