//! Pool counters.
//!
//! All counters are independent and monotonically increasing, so every
//! atomic uses `Ordering::Relaxed`. A [`PoolMetricsSnapshot`] reads them one
//! after another and may be slightly inconsistent across counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Lock-free counters for one [`EdekPool`](crate::EdekPool).
#[derive(Debug, Default)]
pub struct PoolMetrics {
    hits: AtomicU64,
    misses: AtomicU64,
    sync_fetches: AtomicU64,
    refill_requests: AtomicU64,
    keys_refilled: AtomicU64,
    refill_errors: AtomicU64,
    coalesced_triggers: AtomicU64,
    expired_discards: AtomicU64,
    overflow_discards: AtomicU64,
    warmup_runs: AtomicU64,
}

/// Point-in-time copy of [`PoolMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolMetricsSnapshot {
    /// `try_get` calls that returned an EDEK.
    pub hits: u64,
    /// `try_get` calls that found the queue empty.
    pub misses: u64,
    /// Synchronous KMS fetches made by `get_or_generate`.
    pub sync_fetches: u64,
    /// Batch requests sent to the KMS by refills.
    pub refill_requests: u64,
    /// EDEKs accepted into queues by refills.
    pub keys_refilled: u64,
    /// Refills that failed.
    pub refill_errors: u64,
    /// Refill triggers dropped because one was already in flight.
    pub coalesced_triggers: u64,
    /// Queued EDEKs dropped because they outlived the entry TTL.
    pub expired_discards: u64,
    /// Delivered EDEKs dropped because the queue was full.
    pub overflow_discards: u64,
    /// Warmup passes started.
    pub warmup_runs: u64,
}

impl PoolMetricsSnapshot {
    /// Fraction of `try_get` calls that were hits, or `0.0` with no calls.
    #[must_use]
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 { 0.0 } else { self.hits as f64 / total as f64 }
    }
}

impl PoolMetrics {
    /// Creates zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_sync_fetch(&self) {
        self.sync_fetches.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_refill(&self, accepted: usize) {
        self.refill_requests.fetch_add(1, Ordering::Relaxed);
        self.keys_refilled.fetch_add(accepted as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_refill_error(&self) {
        self.refill_requests.fetch_add(1, Ordering::Relaxed);
        self.refill_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_coalesced(&self) {
        self.coalesced_triggers.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_expired(&self, count: usize) {
        if count > 0 {
            self.expired_discards.fetch_add(count as u64, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_overflow(&self, count: usize) {
        if count > 0 {
            self.overflow_discards.fetch_add(count as u64, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_warmup_run(&self) {
        self.warmup_runs.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns a copy of all counters.
    #[must_use]
    pub fn snapshot(&self) -> PoolMetricsSnapshot {
        PoolMetricsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            sync_fetches: self.sync_fetches.load(Ordering::Relaxed),
            refill_requests: self.refill_requests.load(Ordering::Relaxed),
            keys_refilled: self.keys_refilled.load(Ordering::Relaxed),
            refill_errors: self.refill_errors.load(Ordering::Relaxed),
            coalesced_triggers: self.coalesced_triggers.load(Ordering::Relaxed),
            expired_discards: self.expired_discards.load(Ordering::Relaxed),
            overflow_discards: self.overflow_discards.load(Ordering::Relaxed),
            warmup_runs: self.warmup_runs.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_records() {
        let metrics = PoolMetrics::new();
        metrics.record_hit();
        metrics.record_hit();
        metrics.record_miss();
        metrics.record_refill(40);
        metrics.record_refill_error();
        metrics.record_expired(0);
        metrics.record_overflow(3);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.hits, 2);
        assert_eq!(snapshot.misses, 1);
        assert_eq!(snapshot.refill_requests, 2);
        assert_eq!(snapshot.keys_refilled, 40);
        assert_eq!(snapshot.refill_errors, 1);
        assert_eq!(snapshot.expired_discards, 0);
        assert_eq!(snapshot.overflow_discards, 3);
        assert!((snapshot.hit_rate() - 2.0 / 3.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_hit_rate_without_calls() {
        assert_eq!(PoolMetricsSnapshot::default().hit_rate(), 0.0);
    }
}
