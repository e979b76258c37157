//! Balanced concurrent workload over one shared heap.

use std::ptr::NonNull;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Instant;

use serde::Serialize;

use guardheap_core::{AllocFlags, CallSite, GuardedHeap, HeapConfig, MemorySink};

use crate::error::HarnessError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StressConfig {
    pub threads: usize,
    /// Operations per thread.
    pub iterations: usize,
    pub seed: u64,
    pub quick_mode: bool,
    /// Largest payload requested.
    pub max_size: usize,
    /// Live blocks a worker may hold at once.
    pub max_live: usize,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            threads: 4,
            iterations: 10_000,
            seed: 0xDEAD_BEEF,
            quick_mode: false,
            max_size: 1024,
            max_live: 32,
        }
    }
}

/// JSON summary of one stress run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StressSummary {
    pub threads: usize,
    pub iterations: usize,
    pub seed: u64,
    pub quick_mode: bool,
    pub allocations: u64,
    pub reallocations: u64,
    pub deallocations: u64,
    pub scans: u64,
    pub peak_bytes: usize,
    pub live_blocks_after: usize,
    pub bytes_after: usize,
    pub scan_errors: usize,
    pub diagnostics: usize,
    pub elapsed_ms: u128,
}

impl StressSummary {
    /// Every block freed, nothing reported.
    #[must_use]
    pub fn is_balanced(&self) -> bool {
        self.live_blocks_after == 0
            && self.bytes_after == 0
            && self.scan_errors == 0
            && self.diagnostics == 0
            && self.allocations == self.deallocations
    }
}

/// xorshift64; `state` must be non-zero.
struct XorShift(u64);

impl XorShift {
    fn new(seed: u64) -> Self {
        Self(if seed == 0 { 0x9E37_79B9_7F4A_7C15 } else { seed })
    }

    fn next(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        x
    }

    fn below(&mut self, bound: usize) -> usize {
        (self.next() % bound.max(1) as u64) as usize
    }
}

fn worker(
    heap: &GuardedHeap,
    config: StressConfig,
    index: usize,
) -> Result<(), HarnessError> {
    let mut rng = XorShift::new(config.seed ^ (index as u64).wrapping_mul(0x9E37_79B9));
    // Payload addresses; raw pointers are not Send.
    let mut live: Vec<usize> = Vec::with_capacity(config.max_live);
    let flags = AllocFlags::WARN_ON_FAILURE;
    let fill = [index as u8; 64];

    for _ in 0..config.iterations {
        let roll = rng.below(10);
        if live.len() < config.max_live && roll < 5 {
            let size = rng.below(config.max_size + 1);
            let ptr = if size <= fill.len() && roll == 0 {
                heap.memdup(&fill[..size], CallSite::here(), flags)?
            } else {
                heap.allocate(size, CallSite::here(), flags)?
            };
            live.push(ptr.as_ptr() as usize);
        } else if !live.is_empty() && roll < 7 {
            let slot = rng.below(live.len());
            let size = rng.below(config.max_size + 1);
            let moved = heap.reallocate(
                NonNull::new(live[slot] as *mut u8),
                size,
                CallSite::here(),
                flags | AllocFlags::HOLD_ON_REALLOC_ERROR,
            )?;
            live[slot] = moved.as_ptr() as usize;
        } else if !live.is_empty() {
            let addr = live.swap_remove(rng.below(live.len()));
            heap.deallocate(NonNull::new(addr as *mut u8), CallSite::here(), flags)?;
        }
    }
    for addr in live {
        heap.deallocate(NonNull::new(addr as *mut u8), CallSite::here(), flags)?;
    }
    Ok(())
}

/// Run `config.threads` workers to completion and summarize.
pub fn run_stress(config: StressConfig) -> Result<StressSummary, HarnessError> {
    let sink = Arc::new(MemorySink::new());
    let heap = Arc::new(GuardedHeap::with_sink(
        HeapConfig::default().with_quick_mode(config.quick_mode),
        Arc::clone(&sink),
    ));
    let threads = config.threads.max(1);
    let barrier = Arc::new(Barrier::new(threads));
    let started = Instant::now();

    let handles: Vec<_> = (0..threads)
        .map(|index| {
            let heap = Arc::clone(&heap);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                worker(&heap, config, index)
            })
        })
        .collect();
    for (index, handle) in handles.into_iter().enumerate() {
        handle
            .join()
            .map_err(|_| HarnessError::WorkerPanicked(index))??;
    }
    let elapsed_ms = started.elapsed().as_millis();

    let report = heap.sanity_check(CallSite::here());
    let stats = heap.stats();
    let metrics = heap.metrics();
    Ok(StressSummary {
        threads,
        iterations: config.iterations,
        seed: config.seed,
        quick_mode: config.quick_mode,
        allocations: metrics.allocations,
        reallocations: metrics.reallocations,
        deallocations: metrics.deallocations,
        scans: metrics.scans,
        peak_bytes: stats.peak_bytes,
        live_blocks_after: stats.live_blocks,
        bytes_after: stats.current_bytes,
        scan_errors: report.error_count(),
        diagnostics: sink.records().len(),
        elapsed_ms,
    })
}
