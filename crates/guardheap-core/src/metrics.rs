//! Atomic counters for heap observability.
//!
//! All counters use relaxed ordering; they are diagnostic, not
//! synchronization primitives.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Per-heap operation counters.
pub struct HeapMetrics {
    /// Successful allocations (including the inner allocation of a realloc).
    pub allocations: AtomicU64,
    /// Successful reallocations.
    pub reallocations: AtomicU64,
    /// Blocks released.
    pub deallocations: AtomicU64,
    /// Full-heap scans performed.
    pub scans: AtomicU64,
    /// Underrun guard mismatches found by scans.
    pub underruns: AtomicU64,
    /// Overrun guard mismatches found by scans.
    pub overruns: AtomicU64,
    /// Scans that found the registry list itself inconsistent.
    pub list_corruptions: AtomicU64,
    /// Frees rejected because the block guard did not match.
    pub invalid_frees: AtomicU64,
    /// Reallocs rejected because the block guard did not match.
    pub invalid_reallocs: AtomicU64,
    /// Pointers rejected by the plausibility filter.
    pub invalid_pointers: AtomicU64,
    /// Allocation requests that failed.
    pub oom_failures: AtomicU64,
}

impl HeapMetrics {
    /// Create a new zeroed metrics instance.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            allocations: AtomicU64::new(0),
            reallocations: AtomicU64::new(0),
            deallocations: AtomicU64::new(0),
            scans: AtomicU64::new(0),
            underruns: AtomicU64::new(0),
            overruns: AtomicU64::new(0),
            list_corruptions: AtomicU64::new(0),
            invalid_frees: AtomicU64::new(0),
            invalid_reallocs: AtomicU64::new(0),
            invalid_pointers: AtomicU64::new(0),
            oom_failures: AtomicU64::new(0),
        }
    }

    /// Increment a counter by 1.
    pub fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment a counter by `n`.
    pub fn add(counter: &AtomicU64, n: u64) {
        if n != 0 {
            counter.fetch_add(n, Ordering::Relaxed);
        }
    }

    /// Read a counter value.
    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }

    /// Snapshot all counters.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            allocations: Self::get(&self.allocations),
            reallocations: Self::get(&self.reallocations),
            deallocations: Self::get(&self.deallocations),
            scans: Self::get(&self.scans),
            underruns: Self::get(&self.underruns),
            overruns: Self::get(&self.overruns),
            list_corruptions: Self::get(&self.list_corruptions),
            invalid_frees: Self::get(&self.invalid_frees),
            invalid_reallocs: Self::get(&self.invalid_reallocs),
            invalid_pointers: Self::get(&self.invalid_pointers),
            oom_failures: Self::get(&self.oom_failures),
        }
    }
}

impl Default for HeapMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time snapshot of all heap counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub allocations: u64,
    pub reallocations: u64,
    pub deallocations: u64,
    pub scans: u64,
    pub underruns: u64,
    pub overruns: u64,
    pub list_corruptions: u64,
    pub invalid_frees: u64,
    pub invalid_reallocs: u64,
    pub invalid_pointers: u64,
    pub oom_failures: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_start_at_zero() {
        let m = HeapMetrics::new();
        let snap = m.snapshot();
        assert_eq!(snap.allocations, 0);
        assert_eq!(snap.scans, 0);
    }

    #[test]
    fn increment_works() {
        let m = HeapMetrics::new();
        HeapMetrics::inc(&m.allocations);
        HeapMetrics::inc(&m.allocations);
        HeapMetrics::add(&m.overruns, 3);
        let snap = m.snapshot();
        assert_eq!(snap.allocations, 2);
        assert_eq!(snap.overruns, 3);
    }
}
