use std::ptr::NonNull;
use std::sync::Arc;

use guardheap_core::block::ALLOC_FILL;
use guardheap_core::{
    AllocFlags, CallSite, DiagnosticKind, GuardedHeap, HeapConfig, HeapError, MemorySink,
    Operation, PointerFault,
};

const NONE: AllocFlags = AllocFlags::empty();

fn heap_with(config: HeapConfig) -> (GuardedHeap, Arc<MemorySink>) {
    let sink = Arc::new(MemorySink::new());
    (GuardedHeap::with_sink(config, Arc::clone(&sink)), sink)
}

fn write_ramp(ptr: NonNull<u8>, len: usize) {
    for i in 0..len {
        // SAFETY: callers pass live payloads of at least `len` bytes.
        unsafe { ptr.as_ptr().add(i).write(i as u8) };
    }
}

fn bytes(ptr: NonNull<u8>, len: usize) -> Vec<u8> {
    // SAFETY: callers pass live payloads of at least `len` bytes.
    unsafe { std::slice::from_raw_parts(ptr.as_ptr(), len).to_vec() }
}

fn ramp(len: usize) -> Vec<u8> {
    (0..len).map(|i| i as u8).collect()
}

#[test]
fn grow_preserves_prefix_and_fills_tail_with_sentinel() {
    let (heap, sink) = heap_with(HeapConfig::default());
    let old = heap.allocate(8, CallSite::here(), NONE).expect("alloc");
    write_ramp(old, 8);

    let new = heap
        .reallocate(Some(old), 32, CallSite::here(), NONE)
        .expect("grow");
    assert_ne!(new, old);
    let data = bytes(new, 32);
    assert_eq!(&data[..8], ramp(8).as_slice());
    assert!(data[8..].iter().all(|&b| b == ALLOC_FILL));

    let stats = heap.stats();
    assert_eq!(stats.live_blocks, 1);
    assert_eq!(stats.current_bytes, 32);
    assert_eq!(stats.peak_bytes, 40);
    assert_eq!(heap.metrics().reallocations, 1);
    assert!(sink.is_empty());
}

#[test]
fn grow_with_zero_fill_clears_tail() {
    let (heap, _sink) = heap_with(HeapConfig::default());
    let old = heap.allocate(4, CallSite::here(), NONE).expect("alloc");
    write_ramp(old, 4);

    let new = heap
        .reallocate(Some(old), 12, CallSite::here(), AllocFlags::ZERO_FILL)
        .expect("grow");
    let data = bytes(new, 12);
    assert_eq!(&data[..4], ramp(4).as_slice());
    assert_eq!(&data[4..], &[0; 8]);
}

#[test]
fn shrink_copies_only_new_size() {
    let (heap, _sink) = heap_with(HeapConfig::default());
    let old = heap.allocate(64, CallSite::here(), NONE).expect("alloc");
    write_ramp(old, 64);

    let site = CallSite::here();
    let new = heap.reallocate(Some(old), 5, site, NONE).expect("shrink");
    assert_eq!(bytes(new, 5), ramp(5));
    assert_eq!(heap.stats().current_bytes, 5);
    assert!(heap.sanity_check(CallSite::here()).is_clean());

    let found = heap.report_allocated(new.as_ptr() as usize).expect("live");
    assert_eq!(found.site, site);
    assert_eq!(found.size, 5);
}

#[test]
fn null_realloc_allocates_only_when_allowed() {
    let (heap, sink) = heap_with(HeapConfig::default());
    let ptr = heap
        .reallocate(None, 16, CallSite::here(), AllocFlags::ALLOW_ZERO_PTR_ON_REALLOC)
        .expect("behaves like allocate");
    assert_eq!(heap.stats().live_blocks, 1);

    let err = heap
        .reallocate(None, 16, CallSite::here(), NONE)
        .expect_err("null rejected");
    assert_eq!(
        err,
        HeapError::InvalidPointer {
            operation: Operation::Reallocating,
            fault: PointerFault::Null
        }
    );
    assert_eq!(sink.count(DiagnosticKind::InvalidPointer), 1);
    assert!(sink.records()[0].message.starts_with("Reallocating NULL pointer"));

    heap.deallocate(Some(ptr), CallSite::here(), NONE).expect("free");
}

#[test]
fn interior_pointer_is_an_invalid_realloc() {
    let (heap, sink) = heap_with(HeapConfig::default());
    let a = heap.allocate(64, CallSite::here(), NONE).expect("alloc");
    let b = heap.allocate(64, CallSite::here(), NONE).expect("alloc");
    let lower = a.min(b);
    // 16 bytes into a live payload: aligned and in range, but no guard there.
    let interior = NonNull::new(lower.as_ptr().wrapping_add(16)).expect("non-null");

    let err = heap
        .reallocate(Some(interior), 8, CallSite::here(), NONE)
        .expect_err("interior pointer");
    assert_eq!(
        err,
        HeapError::InvalidRealloc {
            address: interior.as_ptr() as usize
        }
    );
    assert_eq!(sink.count(DiagnosticKind::InvalidRealloc), 1);
    assert_eq!(heap.metrics().invalid_reallocs, 1);
    assert_eq!(heap.stats().live_blocks, 2);
    assert!(heap.sanity_check(CallSite::here()).is_clean());
}

fn limited() -> (GuardedHeap, Arc<MemorySink>, NonNull<u8>) {
    let (heap, sink) = heap_with(HeapConfig::default().with_byte_limit(100));
    let ptr = heap.allocate(60, CallSite::here(), NONE).expect("alloc");
    write_ramp(ptr, 60);
    (heap, sink, ptr)
}

#[test]
fn hold_on_error_keeps_old_block() {
    let (heap, _sink, ptr) = limited();
    let kept = heap
        .reallocate(
            Some(ptr),
            50,
            CallSite::here(),
            AllocFlags::HOLD_ON_REALLOC_ERROR,
        )
        .expect("old block handed back");
    assert_eq!(kept, ptr);
    assert_eq!(bytes(kept, 60), ramp(60));
    assert_eq!(heap.stats().live_blocks, 1);
    assert_eq!(heap.stats().current_bytes, 60);

    heap.deallocate(Some(kept), CallSite::here(), NONE).expect("free");
}

#[test]
fn hold_on_error_still_reports_a_fatal_failure() {
    let (heap, sink, ptr) = limited();
    let err = heap
        .reallocate(
            Some(ptr),
            50,
            CallSite::here(),
            AllocFlags::HOLD_ON_REALLOC_ERROR | AllocFlags::FORCE_ABORT_ON_FAILURE,
        )
        .expect_err("fatal");
    assert!(err.is_fatal());
    assert_eq!(sink.count(DiagnosticKind::OutOfMemory), 1);
    assert_eq!(heap.stats().live_blocks, 1);
}

#[test]
fn free_on_error_releases_old_block() {
    let (heap, sink, ptr) = limited();
    let err = heap
        .reallocate(
            Some(ptr),
            50,
            CallSite::here(),
            AllocFlags::FREE_ON_REALLOC_ERROR | AllocFlags::WARN_ON_FAILURE,
        )
        .expect_err("no room");
    assert_eq!(
        err,
        HeapError::OutOfMemory {
            requested: 50,
            in_use: 60,
            fatal: false
        }
    );
    assert_eq!(heap.stats().live_blocks, 0);
    assert_eq!(heap.stats().current_bytes, 0);
    assert_eq!(heap.metrics().deallocations, 1);

    let message = &sink.records()[0].message;
    assert!(message.starts_with("Out of memory at line"));
    assert!(message.ends_with("needed 50 byte (1k), memory in use: 60 bytes (1k)"));
}

/// Without a policy flag the old block stays registered while the caller is
/// expected to drop its pointer; the block shows up as a leak.
#[test]
fn failure_without_policy_leaks_old_block() {
    let (heap, sink, ptr) = limited();
    assert!(
        heap.reallocate(Some(ptr), 50, CallSite::here(), NONE)
            .is_err()
    );
    assert!(sink.is_empty());
    assert_eq!(heap.stats().live_blocks, 1);

    let report = heap.leak_report();
    assert_eq!(report.outstanding, 1);
    assert_eq!(report.blocks[0].address, ptr.as_ptr() as usize);
    assert_eq!(report.blocks[0].size, 60);
}

#[test]
fn example_scenario_reports_one_leak_and_peak() {
    let (heap, sink) = heap_with(HeapConfig::default());
    let ptr1 = heap.allocate(64, CallSite::here(), NONE).expect("alloc");
    // SAFETY: live 64-byte payload.
    unsafe { std::ptr::write_bytes(ptr1.as_ptr(), 0x42, 64) };
    assert_eq!(heap.sanity_check(CallSite::here()).error_count(), 0);

    let site2 = CallSite::here();
    let ptr2 = heap.allocate(32, site2, NONE).expect("alloc");
    heap.deallocate(Some(ptr1), CallSite::here(), NONE)
        .expect("free");
    assert_eq!(heap.sanity_check(CallSite::here()).error_count(), 0);

    let mut out = Vec::new();
    heap.terminate(&mut out, true).expect("terminate");
    let text = String::from_utf8(out).expect("utf8");
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines.len(), 4, "{text}");
    assert_eq!(lines[0], "Warning: Not freed memory segments: 1");
    assert_eq!(lines[1], "Warning: Memory that was not free'ed (32 bytes):");
    assert_eq!(
        lines[2],
        format!(
            "\t    32 bytes at {:#x}, allocated at line {:4} in '{}'",
            ptr2.as_ptr() as usize,
            site2.line,
            site2.file
        )
    );
    assert_eq!(lines[3], "Maximum memory usage: 96 bytes (1k)");
    assert!(sink.is_empty());

    // Terminate reports; it does not reclaim.
    assert_eq!(heap.stats().live_blocks, 1);
}
