//! Pointer plausibility checks and block corruption checks.

use std::ptr::NonNull;

use serde::Serialize;

use crate::block::{GuardedBlock, MAGIC_KEY, MIN_ALIGN};
use crate::diag::{Diagnostic, DiagnosticKind, Severity};
use crate::error::PointerFault;
use crate::registry::RegistryState;
use crate::site::CallSite;

/// Reject obviously wild pointers before any block metadata is read.
///
/// This is a plausibility filter: passing it does not prove the pointer was
/// handed out by this heap.
pub(crate) fn validate_pointer(
    state: &RegistryState,
    ptr: Option<NonNull<u8>>,
) -> Result<NonNull<u8>, PointerFault> {
    let ptr = ptr.ok_or(PointerFault::Null)?;
    let addr = ptr.as_ptr() as usize;
    if addr % MIN_ALIGN != 0 {
        return Err(PointerFault::Misaligned);
    }
    if !state.plausible(addr) {
        return Err(PointerFault::OutOfRange);
    }
    Ok(ptr)
}

/// Guard state of one block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct BlockCheck {
    pub underrun: bool,
    pub overrun: bool,
}

impl BlockCheck {
    #[must_use]
    pub const fn is_clean(self) -> bool {
        !self.underrun && !self.overrun
    }
}

pub(crate) fn check_block(block: GuardedBlock) -> BlockCheck {
    BlockCheck {
        underrun: block.underrun_guard() != MAGIC_KEY,
        overrun: !block.overrun_intact(),
    }
}

/// Result of one full-heap scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct ScanReport {
    /// Blocks the registry claims to hold.
    pub expected: usize,
    /// Blocks actually reached.
    pub visited: usize,
    /// Blocks with a damaged underrun guard.
    pub underruns: usize,
    /// Blocks with a damaged overrun guard.
    pub overruns: usize,
    /// Blocks with at least one damaged guard.
    pub corrupted_blocks: usize,
    /// The list itself does not match the live count.
    pub list_corrupted: bool,
}

impl ScanReport {
    /// Corrupted blocks, plus one if the list itself is damaged.
    #[must_use]
    pub const fn error_count(&self) -> usize {
        self.corrupted_blocks + self.list_corrupted as usize
    }

    #[must_use]
    pub const fn is_clean(&self) -> bool {
        self.error_count() == 0
    }
}

/// Check every reachable block; caller holds the registry lock.
pub(crate) fn scan(
    state: &RegistryState,
    site: CallSite,
    diagnostics: &mut Vec<Diagnostic>,
) -> ScanReport {
    let mut report = ScanReport {
        expected: state.count(),
        ..ScanReport::default()
    };

    let mut blocks = state.blocks();
    for block in blocks.by_ref() {
        report.visited += 1;
        let check = check_block(block);
        if check.is_clean() {
            continue;
        }
        report.corrupted_blocks += 1;
        let origin = block.site();
        let address = block.payload().as_ptr() as usize;
        if check.underrun {
            report.underruns += 1;
            diagnostics.push(
                Diagnostic::new(
                    Severity::Error,
                    DiagnosticKind::Underrun,
                    site,
                    format!("Memory allocated at {origin} was underrun, discovered at {site}"),
                )
                .with_origin(origin)
                .with_address(address),
            );
        }
        if check.overrun {
            report.overruns += 1;
            diagnostics.push(
                Diagnostic::new(
                    Severity::Error,
                    DiagnosticKind::Overrun,
                    site,
                    format!("Memory allocated at {origin} was overrun, discovered at '{site}'"),
                )
                .with_origin(origin)
                .with_address(address)
                .with_size(block.size()),
            );
        }
    }

    let (unvisited, continues) = blocks.leftover();
    if unvisited != 0 || continues {
        report.list_corrupted = true;
        diagnostics.push(Diagnostic::new(
            Severity::Error,
            DiagnosticKind::ListCorruption,
            site,
            format!(
                "Registry link list destroyed, discovered at '{site}' (count={}, visited={}, list continues={continues})",
                report.expected, report.visited
            ),
        ));
    }
    report
}
