//! The allocator being wrapped.

#![allow(unsafe_code)]

use std::alloc::{GlobalAlloc, Layout, System};
use std::ptr::NonNull;

use parking_lot::Mutex;

/// Source of raw memory for guarded blocks.
///
/// # Safety
///
/// A non-`None` result of `allocate` must be valid for reads and writes of
/// `layout.size()` bytes, aligned to `layout.align()`, and stay valid until
/// passed to `release` with the same layout.
pub unsafe trait RawAllocator: Send + Sync {
    /// Request memory; `None` means the allocator is exhausted.
    fn allocate(&self, layout: Layout) -> Option<NonNull<u8>>;

    /// Return memory obtained from `allocate`.
    ///
    /// # Safety
    ///
    /// `ptr` must come from `allocate` on this allocator with this `layout`
    /// and must not be used afterwards.
    unsafe fn release(&self, ptr: NonNull<u8>, layout: Layout);
}

/// The platform allocator.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemAllocator;

// SAFETY: forwards to `std::alloc::System`, which upholds the contract.
unsafe impl RawAllocator for SystemAllocator {
    fn allocate(&self, layout: Layout) -> Option<NonNull<u8>> {
        if layout.size() == 0 {
            return None;
        }
        // SAFETY: layout has non-zero size.
        NonNull::new(unsafe { System.alloc(layout) })
    }

    unsafe fn release(&self, ptr: NonNull<u8>, layout: Layout) {
        // SAFETY: caller guarantees ptr came from `allocate` with `layout`.
        unsafe { System.dealloc(ptr.as_ptr(), layout) }
    }
}

/// System allocator that defers every release until it is dropped.
///
/// Freed blocks stay mapped, so a stale pointer handed back to the heap
/// (double free, use after free) reads memory the process still owns and
/// the poison values written on release remain inspectable.
#[derive(Debug, Default)]
pub struct RetainingAllocator {
    retained: Mutex<Vec<(usize, Layout)>>,
}

impl RetainingAllocator {
    /// Releases deferred so far.
    #[must_use]
    pub fn retained(&self) -> usize {
        self.retained.lock().len()
    }
}

// SAFETY: memory comes from SystemAllocator and is returned to it only in Drop.
unsafe impl RawAllocator for RetainingAllocator {
    fn allocate(&self, layout: Layout) -> Option<NonNull<u8>> {
        SystemAllocator.allocate(layout)
    }

    unsafe fn release(&self, ptr: NonNull<u8>, layout: Layout) {
        self.retained.lock().push((ptr.as_ptr() as usize, layout));
    }
}

impl Drop for RetainingAllocator {
    fn drop(&mut self) {
        for (addr, layout) in self.retained.get_mut().drain(..) {
            if let Some(ptr) = NonNull::new(addr as *mut u8) {
                // SAFETY: every entry came from SystemAllocator with this layout.
                unsafe { SystemAllocator.release(ptr, layout) };
            }
        }
    }
}
