//! The reference walk-through: two allocations, one free, one leak.

use std::sync::Arc;

use serde::Serialize;

use guardheap_core::{
    AllocFlags, CallSite, Diagnostic, GuardedHeap, HeapConfig, LeakReport, MemorySink,
};

use crate::error::HarnessError;

#[derive(Debug, Clone, Serialize)]
pub struct ScenarioOutcome {
    /// Scan errors after the first block was written in full.
    pub errors_after_write: usize,
    /// Scan errors after the first block was freed.
    pub errors_after_free: usize,
    /// What terminate saw.
    pub leaks: LeakReport,
    /// Terminate output in text form.
    pub report_text: String,
    /// Anything the heap complained about.
    pub diagnostics: Vec<Diagnostic>,
}

impl ScenarioOutcome {
    /// One leaked 32-byte block and a peak of 96 bytes, with clean scans.
    #[must_use]
    pub fn matches_reference(&self) -> bool {
        self.errors_after_write == 0
            && self.errors_after_free == 0
            && self.diagnostics.is_empty()
            && self.leaks.outstanding == 1
            && self.leaks.blocks.len() == 1
            && self.leaks.blocks[0].size == 32
            && self.leaks.peak_bytes == 96
    }
}

/// Allocate 64 bytes and fill them, allocate 32, free the 64 and report.
pub fn run_scenario(config: HeapConfig) -> Result<ScenarioOutcome, HarnessError> {
    let sink = Arc::new(MemorySink::new());
    let heap = GuardedHeap::with_sink(config, Arc::clone(&sink));
    let flags = AllocFlags::WARN_ON_FAILURE;

    let first = heap.memdup(&[0x42; 64], CallSite::here(), flags)?;
    let errors_after_write = heap.sanity_check(CallSite::here()).error_count();

    heap.allocate(32, CallSite::here(), flags)?;
    heap.deallocate(Some(first), CallSite::here(), flags)?;
    let errors_after_free = heap.sanity_check(CallSite::here()).error_count();

    let mut text = Vec::new();
    heap.terminate(&mut text, true)?;

    Ok(ScenarioOutcome {
        errors_after_write,
        errors_after_free,
        leaks: heap.leak_report(),
        report_text: String::from_utf8_lossy(&text).into_owned(),
        diagnostics: sink.drain(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reference_scenario_holds() {
        let outcome = run_scenario(HeapConfig::default()).expect("scenario");
        assert!(outcome.matches_reference(), "{outcome:?}");
        assert!(
            outcome
                .report_text
                .ends_with("Maximum memory usage: 96 bytes (1k)\n")
        );
    }

    #[test]
    fn quick_mode_changes_nothing_visible() {
        let outcome =
            run_scenario(HeapConfig::default().with_quick_mode(true)).expect("scenario");
        assert!(outcome.matches_reference());
    }
}
