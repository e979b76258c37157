//! Corruption drills: damage one thing on purpose, confirm it is reported.

#![allow(unsafe_code)]

use std::fmt;
use std::sync::Arc;

use clap::ValueEnum;
use serde::Serialize;

use guardheap_core::{
    AllocFlags, CallSite, Diagnostic, DiagnosticKind, GuardedHeap, HeapConfig, HeapError,
    MemorySink, RetainingAllocator, ScanReport,
};

use crate::error::HarnessError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, ValueEnum, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CorruptionKind {
    /// Write one byte past the end of a payload.
    Overrun,
    /// Write into the guard in front of a payload.
    Underrun,
    /// Free the same pointer twice.
    DoubleFree,
    /// Cut the registry list.
    List,
}

impl CorruptionKind {
    pub const ALL: [Self; 4] = [Self::Overrun, Self::Underrun, Self::DoubleFree, Self::List];

    fn expected(self) -> DiagnosticKind {
        match self {
            Self::Overrun => DiagnosticKind::Overrun,
            Self::Underrun => DiagnosticKind::Underrun,
            Self::DoubleFree => DiagnosticKind::InvalidFree,
            Self::List => DiagnosticKind::ListCorruption,
        }
    }
}

impl fmt::Display for CorruptionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Overrun => "overrun",
            Self::Underrun => "underrun",
            Self::DoubleFree => "double-free",
            Self::List => "list",
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CorruptionOutcome {
    pub kind: CorruptionKind,
    /// Exactly one diagnostic of the expected kind was produced.
    pub detected: bool,
    /// Scan after the damage, when the drill runs one.
    pub scan: Option<ScanReport>,
    pub diagnostics: Vec<Diagnostic>,
}

/// Run one drill on a fresh heap.
pub fn run_corruption(kind: CorruptionKind) -> Result<CorruptionOutcome, HarnessError> {
    let sink = Arc::new(MemorySink::new());
    // Released blocks stay mapped until the drill ends, so a second free
    // reads memory the process still owns.
    let heap = GuardedHeap::with_allocator(
        HeapConfig::default(),
        RetainingAllocator::default(),
        Arc::clone(&sink),
    );
    let flags = AllocFlags::WARN_ON_FAILURE;

    let scan = match kind {
        CorruptionKind::Overrun => {
            let ptr = heap.allocate(24, CallSite::here(), flags)?;
            // SAFETY: the byte after the payload is the first overrun guard
            // byte, inside the same allocation.
            unsafe { *ptr.as_ptr().add(24) ^= 0xFF };
            Some(heap.sanity_check(CallSite::here()))
        }
        CorruptionKind::Underrun => {
            let ptr = heap.allocate(24, CallSite::here(), flags)?;
            // SAFETY: the byte before the payload is part of the underrun
            // guard, inside the same allocation.
            unsafe { *ptr.as_ptr().sub(1) ^= 0xFF };
            Some(heap.sanity_check(CallSite::here()))
        }
        CorruptionKind::DoubleFree => {
            let ptr = heap.allocate(24, CallSite::here(), flags)?;
            heap.deallocate(Some(ptr), CallSite::here(), flags)?;
            match heap.deallocate(Some(ptr), CallSite::here(), flags) {
                Err(HeapError::InvalidFree { .. }) => {}
                Err(other) => return Err(other.into()),
                Ok(()) => {
                    return Err(HarnessError::Undetected {
                        kind: kind.to_string(),
                    });
                }
            }
            None
        }
        CorruptionKind::List => {
            for size in [8, 16, 32] {
                heap.allocate(size, CallSite::here(), flags)?;
            }
            let link = heap
                .sever_list_after_head()
                .ok_or_else(|| HarnessError::Undetected {
                    kind: kind.to_string(),
                })?;
            let report = heap.sanity_check(CallSite::here());
            heap.restore_link(link);
            Some(report)
        }
    };

    let diagnostics = sink.drain();
    let detected = diagnostics.len() == 1 && diagnostics[0].kind == kind.expected();
    Ok(CorruptionOutcome {
        kind,
        detected,
        scan,
        diagnostics,
    })
}
