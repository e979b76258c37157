//! Allocate / reallocate / deallocate over a guarded registry.
//!
//! Every operation follows the same shape: optional full scan, plausibility
//! check, raw allocator call outside the lock, bookkeeping under the lock,
//! statistics. Problems are returned as [`HeapError`] and reported to the
//! heap's [`DiagnosticSink`]; nothing here terminates the process.

#![allow(unsafe_code)]

use std::ffi::CStr;
use std::ptr::{self, NonNull};

use crate::block::{ALLOC_FILL, FREE_FILL, GuardedBlock, MAGIC_KEY};
use crate::config::HeapConfig;
use crate::diag::{Diagnostic, DiagnosticKind, DiagnosticSink, Severity, StderrSink};
use crate::error::{HeapError, Operation};
use crate::flags::AllocFlags;
use crate::metrics::{HeapMetrics, MetricsSnapshot};
use crate::raw::{RawAllocator, SystemAllocator};
use crate::registry::{HeapStats, Registry};
use crate::site::CallSite;
use crate::validator::{self, ScanReport};

/// A guarded heap: one registry, one wrapped allocator, one diagnostic sink.
pub struct GuardedHeap<A: RawAllocator = SystemAllocator> {
    pub(crate) registry: Registry,
    raw: A,
    sink: Box<dyn DiagnosticSink>,
    metrics: HeapMetrics,
}

impl GuardedHeap<SystemAllocator> {
    /// Heap over the system allocator reporting to standard error.
    #[must_use]
    pub fn new(config: HeapConfig) -> Self {
        Self::with_allocator(config, SystemAllocator, StderrSink)
    }

    /// Heap over the system allocator reporting to `sink`.
    #[must_use]
    pub fn with_sink(config: HeapConfig, sink: impl DiagnosticSink + 'static) -> Self {
        Self::with_allocator(config, SystemAllocator, sink)
    }
}

impl<A: RawAllocator> GuardedHeap<A> {
    /// Heap over an arbitrary raw allocator.
    #[must_use]
    pub fn with_allocator(config: HeapConfig, raw: A, sink: impl DiagnosticSink + 'static) -> Self {
        Self {
            registry: Registry::new(&config),
            raw,
            sink: Box::new(sink),
            metrics: HeapMetrics::new(),
        }
    }

    /// Current configuration, including runtime changes.
    #[must_use]
    pub fn config(&self) -> HeapConfig {
        let layout = self.registry.layout();
        let state = self.registry.lock();
        HeapConfig {
            byte_limit: state.byte_limit,
            quick_mode: state.quick_mode,
            pre_pad: layout.pre_pad(),
            post_pad: layout.post_pad(),
        }
    }

    pub fn set_quick_mode(&self, quick_mode: bool) {
        self.registry.lock().quick_mode = quick_mode;
    }

    pub fn set_byte_limit(&self, byte_limit: usize) {
        self.registry.lock().byte_limit = byte_limit;
    }

    #[must_use]
    pub fn stats(&self) -> HeapStats {
        self.registry.lock().stats()
    }

    #[must_use]
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub(crate) fn emit(&self, diagnostic: &Diagnostic) {
        self.sink.emit(diagnostic);
    }

    /// Scan every live block for guard damage and the list for consistency.
    pub fn sanity_check(&self, site: CallSite) -> ScanReport {
        let mut diagnostics = Vec::new();
        let report = {
            let state = self.registry.lock();
            validator::scan(&state, site, &mut diagnostics)
        };

        HeapMetrics::inc(&self.metrics.scans);
        HeapMetrics::add(&self.metrics.underruns, report.underruns as u64);
        HeapMetrics::add(&self.metrics.overruns, report.overruns as u64);
        if report.list_corrupted {
            HeapMetrics::inc(&self.metrics.list_corruptions);
        }
        for diagnostic in &diagnostics {
            self.emit(diagnostic);
        }
        report
    }

    /// Run the pre-operation scan unless disabled; returns the quick-mode flag.
    fn pre_scan(&self, site: CallSite, flags: AllocFlags) -> bool {
        let quick = self.registry.lock().quick_mode;
        if !quick && !flags.contains(AllocFlags::SKIP_SANITY) {
            self.sanity_check(site);
        }
        quick
    }

    /// Allocate `size` payload bytes attributed to `site`.
    pub fn allocate(
        &self,
        size: usize,
        site: CallSite,
        flags: AllocFlags,
    ) -> Result<NonNull<u8>, HeapError> {
        let quick = self.pre_scan(site, flags);

        let (reserved, in_use) = {
            let mut state = self.registry.lock();
            (state.reserve(size), state.current_bytes())
        };
        let layout = self.registry.layout();
        let raw = if reserved {
            layout
                .layout_for(size)
                .and_then(|alloc_layout| self.raw.allocate(alloc_layout))
        } else {
            None
        };
        let Some(raw) = raw else {
            if reserved {
                self.registry.lock().unreserve(size);
            }
            return Err(self.out_of_memory(size, in_use, site, flags));
        };

        // SAFETY: raw was just obtained for layout_for(size), aligned to MIN_ALIGN.
        let block = unsafe { GuardedBlock::init(raw, layout, size, site) };
        if flags.contains(AllocFlags::ZERO_FILL) {
            block.fill_payload(0);
        } else if !quick {
            block.fill_payload(ALLOC_FILL);
        }
        self.registry.lock().insert(block);

        HeapMetrics::inc(&self.metrics.allocations);
        Ok(block.payload())
    }

    fn out_of_memory(
        &self,
        size: usize,
        in_use: usize,
        site: CallSite,
        flags: AllocFlags,
    ) -> HeapError {
        HeapMetrics::inc(&self.metrics.oom_failures);
        let fatal = flags.contains(AllocFlags::FORCE_ABORT_ON_FAILURE);
        if flags.reports_failure() {
            let level = if fatal {
                Severity::Fatal
            } else {
                Severity::Error
            };
            self.emit(
                &Diagnostic::new(
                    level,
                    DiagnosticKind::OutOfMemory,
                    site,
                    format!(
                        "Out of memory at line {}, '{}': needed {size} byte ({}k), memory in use: {in_use} bytes ({}k)",
                        site.line,
                        site.file,
                        size.div_ceil(1024),
                        in_use.div_ceil(1024),
                    ),
                )
                .with_size(size),
            );
        }
        HeapError::OutOfMemory {
            requested: size,
            in_use,
            fatal,
        }
    }

    /// Find the live block behind `ptr`, or explain why there is none.
    fn locate(
        &self,
        ptr: Option<NonNull<u8>>,
        operation: Operation,
        site: CallSite,
    ) -> Result<GuardedBlock, HeapError> {
        let checked = validator::validate_pointer(&self.registry.lock(), ptr);
        let payload = match checked {
            Ok(payload) => payload,
            Err(fault) => {
                HeapMetrics::inc(&self.metrics.invalid_pointers);
                let mut diagnostic = Diagnostic::new(
                    Severity::Error,
                    DiagnosticKind::InvalidPointer,
                    site,
                    format!("{operation} {fault} at line {}, '{}'", site.line, site.file),
                );
                if let Some(ptr) = ptr {
                    diagnostic = diagnostic.with_address(ptr.as_ptr() as usize);
                }
                self.emit(&diagnostic);
                return Err(HeapError::InvalidPointer { operation, fault });
            }
        };

        let address = payload.as_ptr() as usize;
        // SAFETY: payload lies within the range of payloads handed out, so the
        // header offset stays inside memory this heap once owned.
        let block = unsafe { GuardedBlock::from_payload(payload, self.registry.layout()) };
        match block {
            Some(block) if block.underrun_guard() == MAGIC_KEY => Ok(block),
            _ => {
                let (kind, counter, err) = match operation {
                    Operation::Freeing => (
                        DiagnosticKind::InvalidFree,
                        &self.metrics.invalid_frees,
                        HeapError::InvalidFree { address },
                    ),
                    Operation::Reallocating => (
                        DiagnosticKind::InvalidRealloc,
                        &self.metrics.invalid_reallocs,
                        HeapError::InvalidRealloc { address },
                    ),
                };
                HeapMetrics::inc(counter);
                self.emit(
                    &Diagnostic::new(
                        Severity::Error,
                        kind,
                        site,
                        format!(
                            "{operation} unallocated data at line {}, '{}'",
                            site.line, site.file
                        ),
                    )
                    .with_address(address),
                );
                Err(err)
            }
        }
    }

    /// Unlink, poison and release a block that passed [`Self::locate`].
    fn retire(&self, block: GuardedBlock) {
        let quick = {
            let mut state = self.registry.lock();
            state.remove(block);
            state.quick_mode
        };
        if !quick {
            block.fill_payload(FREE_FILL);
        }
        block.set_underrun_guard(!MAGIC_KEY);
        if let Some(alloc_layout) = block.alloc_layout() {
            // SAFETY: the block was allocated from self.raw with this layout
            // and is no longer reachable through the registry.
            unsafe { self.raw.release(block.raw(), alloc_layout) };
        }
        HeapMetrics::inc(&self.metrics.deallocations);
    }

    /// Release the block behind `ptr`.
    ///
    /// A pointer whose block guard does not match (double free, stray
    /// pointer, never allocated, earlier underrun) is reported and left
    /// alone.
    pub fn deallocate(
        &self,
        ptr: Option<NonNull<u8>>,
        site: CallSite,
        flags: AllocFlags,
    ) -> Result<(), HeapError> {
        if ptr.is_none() && flags.contains(AllocFlags::ALLOW_ZERO_PTR_ON_FREE) {
            return Ok(());
        }
        self.pre_scan(site, flags);
        let block = self.locate(ptr, Operation::Freeing, site)?;
        self.retire(block);
        Ok(())
    }

    /// Move the contents of `ptr` into a fresh block of `size` bytes.
    ///
    /// Never resizes in place. On failure of the inner allocation the
    /// outcome depends on the flags:
    /// - `HOLD_ON_REALLOC_ERROR`: `Ok(ptr)`, the old block stays valid.
    /// - `FREE_ON_REALLOC_ERROR`: the old block is released, `Err`.
    /// - neither: `Err`, and the old block stays registered although the
    ///   caller is expected to drop its handle (leaks until reported).
    pub fn reallocate(
        &self,
        ptr: Option<NonNull<u8>>,
        size: usize,
        site: CallSite,
        flags: AllocFlags,
    ) -> Result<NonNull<u8>, HeapError> {
        if ptr.is_none() && flags.contains(AllocFlags::ALLOW_ZERO_PTR_ON_REALLOC) {
            return self.allocate(size, site, flags);
        }
        self.pre_scan(site, flags);
        let old = self.locate(ptr, Operation::Reallocating, site)?;

        match self.allocate(size, site, flags | AllocFlags::SKIP_SANITY) {
            Ok(new) => {
                let keep = old.size().min(size);
                // SAFETY: both payloads are valid for `keep` bytes and belong
                // to distinct blocks.
                unsafe { ptr::copy_nonoverlapping(old.payload().as_ptr(), new.as_ptr(), keep) };
                self.retire(old);
                HeapMetrics::inc(&self.metrics.reallocations);
                Ok(new)
            }
            Err(err) if flags.contains(AllocFlags::HOLD_ON_REALLOC_ERROR) => {
                if err.is_fatal() {
                    return Err(err);
                }
                Ok(old.payload())
            }
            Err(err) => {
                if flags.contains(AllocFlags::FREE_ON_REALLOC_ERROR) {
                    self.retire(old);
                }
                Err(err)
            }
        }
    }

    /// Copy `src` into a new block.
    pub fn memdup(
        &self,
        src: &[u8],
        site: CallSite,
        flags: AllocFlags,
    ) -> Result<NonNull<u8>, HeapError> {
        let ptr = self.allocate(src.len(), site, flags)?;
        // SAFETY: the new payload is valid for src.len() bytes.
        unsafe { ptr::copy_nonoverlapping(src.as_ptr(), ptr.as_ptr(), src.len()) };
        Ok(ptr)
    }

    /// Copy a C string, terminator included, into a new block.
    pub fn strdup(
        &self,
        src: &CStr,
        site: CallSite,
        flags: AllocFlags,
    ) -> Result<NonNull<u8>, HeapError> {
        self.memdup(src.to_bytes_with_nul(), site, flags)
    }

    /// Copy at most `max_len` bytes of `src` into a new block of that length
    /// plus one, and terminate it with NUL.
    pub fn strndup(
        &self,
        src: &[u8],
        max_len: usize,
        site: CallSite,
        flags: AllocFlags,
    ) -> Result<NonNull<u8>, HeapError> {
        let len = src.len().min(max_len);
        let Some(total) = len.checked_add(1) else {
            let in_use = self.registry.lock().current_bytes();
            return Err(self.out_of_memory(len, in_use, site, flags));
        };
        let ptr = self.allocate(total, site, flags)?;
        // SAFETY: the new payload is valid for len + 1 bytes.
        unsafe {
            ptr::copy_nonoverlapping(src.as_ptr(), ptr.as_ptr(), len);
            ptr.as_ptr().add(len).write(0);
        }
        Ok(ptr)
    }
}

impl<A: RawAllocator> Drop for GuardedHeap<A> {
    fn drop(&mut self) {
        for block in self.registry.get_mut().take_all() {
            if let Some(alloc_layout) = block.alloc_layout() {
                // SAFETY: every registered block came from self.raw with this layout.
                unsafe { self.raw.release(block.raw(), alloc_layout) };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::block::{GUARD_SIZE, OVERRUN_PATTERN};
    use crate::diag::MemorySink;
    use crate::raw::RetainingAllocator;

    fn heap() -> (GuardedHeap, Arc<MemorySink>) {
        let sink = Arc::new(MemorySink::new());
        (
            GuardedHeap::with_sink(HeapConfig::default(), Arc::clone(&sink)),
            sink,
        )
    }

    fn block_of<A: RawAllocator>(heap: &GuardedHeap<A>, ptr: NonNull<u8>) -> GuardedBlock {
        // SAFETY: tests only pass payloads handed out by `heap`.
        unsafe { GuardedBlock::from_payload(ptr, heap.registry.layout()) }.expect("block")
    }

    #[test]
    fn fresh_payload_is_sentinel_filled_and_guarded() {
        let (heap, sink) = heap();
        let ptr = heap
            .allocate(24, CallSite::here(), AllocFlags::empty())
            .expect("alloc");
        // SAFETY: ptr is a live 24-byte payload followed by the overrun guard.
        let (payload, guard) = unsafe {
            (
                std::slice::from_raw_parts(ptr.as_ptr(), 24),
                std::slice::from_raw_parts(ptr.as_ptr().add(24), GUARD_SIZE),
            )
        };
        assert!(payload.iter().all(|&b| b == ALLOC_FILL));
        assert_eq!(guard, OVERRUN_PATTERN);
        assert!(sink.is_empty());
    }

    #[test]
    fn free_poisons_payload_and_complements_guard() {
        let heap = GuardedHeap::with_allocator(
            HeapConfig::default(),
            RetainingAllocator::default(),
            MemorySink::new(),
        );
        let ptr = heap
            .allocate(12, CallSite::here(), AllocFlags::empty())
            .expect("alloc");
        let block = block_of(&heap, ptr);
        assert_eq!(block.underrun_guard(), MAGIC_KEY);

        heap.deallocate(Some(ptr), CallSite::here(), AllocFlags::empty())
            .expect("free");

        // Memory is still mapped by the retaining allocator.
        assert_eq!(block.underrun_guard(), !MAGIC_KEY);
        // SAFETY: retained memory, 12 payload bytes.
        let payload = unsafe { std::slice::from_raw_parts(ptr.as_ptr(), 12) };
        assert!(payload.iter().all(|&b| b == FREE_FILL));
        assert_eq!(heap.raw.retained(), 1);
    }

    #[test]
    fn quick_mode_skips_poison_fill() {
        let config = HeapConfig::default().with_quick_mode(true);
        let heap =
            GuardedHeap::with_allocator(config, RetainingAllocator::default(), MemorySink::new());
        let ptr = heap
            .allocate(8, CallSite::here(), AllocFlags::empty())
            .expect("alloc");
        // SAFETY: live 8-byte payload.
        unsafe { std::ptr::write_bytes(ptr.as_ptr(), 0x11, 8) };
        heap.deallocate(Some(ptr), CallSite::here(), AllocFlags::empty())
            .expect("free");
        // SAFETY: retained memory, 8 payload bytes.
        let payload = unsafe { std::slice::from_raw_parts(ptr.as_ptr(), 8) };
        assert!(payload.iter().all(|&b| b == 0x11));
        assert_eq!(heap.metrics().scans, 0);
    }

    #[test]
    fn broken_link_is_list_corruption() {
        let (heap, sink) = heap();
        let first = heap
            .allocate(8, CallSite::here(), AllocFlags::empty())
            .expect("alloc");
        let second = heap
            .allocate(8, CallSite::here(), AllocFlags::empty())
            .expect("alloc");
        let head = block_of(&heap, second);
        let saved = head.next();
        head.set_next(None);

        let report = heap.sanity_check(CallSite::here());
        assert!(report.list_corrupted);
        assert_eq!(report.visited, 1);
        assert_eq!(report.expected, 2);
        assert_eq!(report.corrupted_blocks, 0);
        assert_eq!(report.error_count(), 1);
        assert_eq!(sink.count(DiagnosticKind::ListCorruption), 1);

        head.set_next(saved);
        assert!(heap.sanity_check(CallSite::here()).is_clean());
        heap.deallocate(Some(first), CallSite::here(), AllocFlags::empty())
            .expect("free");
    }

    #[test]
    fn node_beyond_count_is_list_corruption() {
        let (heap, sink) = heap();
        let a = heap
            .allocate(4, CallSite::here(), AllocFlags::empty())
            .expect("alloc");
        let b = heap
            .allocate(4, CallSite::here(), AllocFlags::empty())
            .expect("alloc");
        let _c = heap
            .allocate(4, CallSite::here(), AllocFlags::empty())
            .expect("alloc");
        let (a_block, b_block) = (block_of(&heap, a), block_of(&heap, b));

        // c -> a, count 2, but a still points on to b.
        heap.registry.lock().remove(b_block);
        a_block.set_next(Some(b_block.header()));

        let report = heap.sanity_check(CallSite::here());
        assert!(report.list_corrupted);
        assert_eq!(report.visited, 2);
        assert_eq!(sink.count(DiagnosticKind::ListCorruption), 1);

        a_block.set_next(None);
        heap.registry.lock().insert(b_block);
        assert!(heap.sanity_check(CallSite::here()).is_clean());
    }
}
