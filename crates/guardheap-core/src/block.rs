//! Physical layout of one guarded allocation.
//!
//! Every allocation is a single contiguous region obtained from the raw
//! allocator:
//!
//! ```text
//! raw ─► ┌──────────────┬──────────┬────────────┬─────────────┬──────────┬───────────┐
//!        │ BlockHeader  │ pre-pad  │ guard: u32 │ payload ... │ ovr[4]   │ post-pad  │
//!        └──────────────┴──────────┴────────────┴─────────────┴──────────┴───────────┘
//!                                               ▲
//!                                               └─ pointer handed to the caller
//! ```
//!
//! The underrun guard always occupies the 4 bytes directly in front of the
//! payload and the overrun guard the 4 bytes directly behind it. The header
//! sits at a fixed negative offset from the payload, so a payload pointer is
//! enough to recover the block.
//!
//! This module is the only place that performs the offset arithmetic.

#![allow(unsafe_code)]

use std::alloc::Layout;
use std::mem::size_of;
use std::ptr::{self, NonNull};

use crate::site::CallSite;

/// Value stored in the underrun guard of every live block.
pub const MAGIC_KEY: u32 = 0x1423_5296;

/// Byte pattern written directly after every payload.
pub const OVERRUN_PATTERN: [u8; GUARD_SIZE] = [0x68, 0x34, 0x7A, 0x15];

/// Size of each guard region in bytes.
pub const GUARD_SIZE: usize = 4;

/// Fill byte for freshly allocated payloads.
pub const ALLOC_FILL: u8 = 0xA5;

/// Fill byte for released payloads.
pub const FREE_FILL: u8 = 0x8F;

/// Minimum alignment of every payload handed out.
pub const MIN_ALIGN: usize = 16;

/// Bookkeeping stored at the start of each block.
#[repr(C)]
pub(crate) struct BlockHeader {
    file: &'static str,
    line: u32,
    size: usize,
    prev: Option<NonNull<BlockHeader>>,
    next: Option<NonNull<BlockHeader>>,
}

/// Header bytes including room for the underrun guard, rounded to alignment.
pub const HEADER_SIZE: usize =
    (size_of::<BlockHeader>() + GUARD_SIZE).next_multiple_of(MIN_ALIGN);

/// Pad configuration shared by every block of one heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BlockLayout {
    pre_pad: usize,
    post_pad: usize,
}

impl BlockLayout {
    /// Build a layout; the leading pad is rounded up to [`MIN_ALIGN`] so the
    /// payload stays aligned.
    #[must_use]
    pub fn new(pre_pad: usize, post_pad: usize) -> Self {
        let pre_pad = pre_pad
            .checked_next_multiple_of(MIN_ALIGN)
            .unwrap_or(usize::MAX & !(MIN_ALIGN - 1));
        Self { pre_pad, post_pad }
    }

    /// Extra bytes reserved between header and payload.
    #[must_use]
    pub const fn pre_pad(self) -> usize {
        self.pre_pad
    }

    /// Extra bytes reserved after the overrun guard.
    #[must_use]
    pub const fn post_pad(self) -> usize {
        self.post_pad
    }

    /// Distance from the start of the block to the payload.
    #[must_use]
    pub const fn payload_offset(self) -> usize {
        HEADER_SIZE + self.pre_pad
    }

    /// Total physical size for a payload of `payload` bytes.
    #[must_use]
    pub fn total_size(self, payload: usize) -> Option<usize> {
        self.payload_offset()
            .checked_add(payload)?
            .checked_add(GUARD_SIZE)?
            .checked_add(self.post_pad)
    }

    /// Raw allocator layout for a payload of `payload` bytes.
    #[must_use]
    pub fn layout_for(self, payload: usize) -> Option<Layout> {
        Layout::from_size_align(self.total_size(payload)?, MIN_ALIGN).ok()
    }
}

/// Handle to one block in raw memory.
///
/// A handle is only ever constructed for memory laid out by [`BlockLayout`]
/// that has not yet been returned to the raw allocator; every accessor relies
/// on that.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct GuardedBlock {
    header: NonNull<BlockHeader>,
    layout: BlockLayout,
}

impl GuardedBlock {
    /// Write a fresh header and both guards into `raw`.
    ///
    /// # Safety
    ///
    /// `raw` must be valid for writes of `layout.total_size(size)` bytes and
    /// aligned to [`MIN_ALIGN`].
    pub(crate) unsafe fn init(
        raw: NonNull<u8>,
        layout: BlockLayout,
        size: usize,
        site: CallSite,
    ) -> Self {
        let header = raw.cast::<BlockHeader>();
        // SAFETY: raw is aligned to MIN_ALIGN, which satisfies BlockHeader, and
        // is valid for at least HEADER_SIZE bytes.
        unsafe {
            header.as_ptr().write(BlockHeader {
                file: site.file,
                line: site.line,
                size,
                prev: None,
                next: None,
            });
        }
        let block = Self { header, layout };
        block.set_underrun_guard(MAGIC_KEY);
        // SAFETY: the overrun guard lies within the allocation (see total_size).
        unsafe {
            ptr::copy_nonoverlapping(
                OVERRUN_PATTERN.as_ptr(),
                block.payload().as_ptr().add(size),
                GUARD_SIZE,
            );
        }
        block
    }

    /// Recover the block that owns `payload`.
    ///
    /// # Safety
    ///
    /// `payload` must point at least `layout.payload_offset()` bytes into
    /// readable memory. Whether it is a real block is decided by the caller
    /// checking [`GuardedBlock::underrun_guard`] before any other accessor.
    pub(crate) unsafe fn from_payload(payload: NonNull<u8>, layout: BlockLayout) -> Option<Self> {
        let raw = payload.as_ptr().wrapping_sub(layout.payload_offset());
        NonNull::new(raw).map(|raw| Self {
            header: raw.cast(),
            layout,
        })
    }

    /// Wrap a header reached through registry links.
    ///
    /// # Safety
    ///
    /// `header` must belong to a live block laid out with `layout`.
    pub(crate) unsafe fn from_header(header: NonNull<BlockHeader>, layout: BlockLayout) -> Self {
        Self { header, layout }
    }

    pub(crate) fn header(self) -> NonNull<BlockHeader> {
        self.header
    }

    /// Start of the physical allocation.
    pub(crate) fn raw(self) -> NonNull<u8> {
        self.header.cast()
    }

    /// Pointer handed to the caller.
    pub(crate) fn payload(self) -> NonNull<u8> {
        // SAFETY: the payload offset lies within the block.
        unsafe { self.raw().add(self.layout.payload_offset()) }
    }

    pub(crate) fn size(self) -> usize {
        // SAFETY: handle invariant, the header is initialized.
        unsafe { (*self.header.as_ptr()).size }
    }

    /// Site that allocated this block.
    pub(crate) fn site(self) -> CallSite {
        // SAFETY: handle invariant, the header is initialized.
        let header = unsafe { &*self.header.as_ptr() };
        CallSite::new(header.file, header.line)
    }

    /// Physical layout used for this block, if its recorded size is still sane.
    pub(crate) fn alloc_layout(self) -> Option<Layout> {
        self.layout.layout_for(self.size())
    }

    pub(crate) fn prev(self) -> Option<NonNull<BlockHeader>> {
        // SAFETY: handle invariant.
        unsafe { (*self.header.as_ptr()).prev }
    }

    pub(crate) fn next(self) -> Option<NonNull<BlockHeader>> {
        // SAFETY: handle invariant.
        unsafe { (*self.header.as_ptr()).next }
    }

    pub(crate) fn set_prev(self, prev: Option<NonNull<BlockHeader>>) {
        // SAFETY: handle invariant.
        unsafe { (*self.header.as_ptr()).prev = prev }
    }

    pub(crate) fn set_next(self, next: Option<NonNull<BlockHeader>>) {
        // SAFETY: handle invariant.
        unsafe { (*self.header.as_ptr()).next = next }
    }

    fn guard_ptr(self) -> *mut u32 {
        self.payload()
            .as_ptr()
            .wrapping_sub(GUARD_SIZE)
            .cast::<u32>()
    }

    /// Current contents of the underrun guard.
    pub(crate) fn underrun_guard(self) -> u32 {
        // SAFETY: the guard sits inside the header/pad region of the block.
        unsafe { self.guard_ptr().read_unaligned() }
    }

    pub(crate) fn set_underrun_guard(self, value: u32) {
        // SAFETY: the guard sits inside the header/pad region of the block.
        unsafe { self.guard_ptr().write_unaligned(value) }
    }

    /// Whether the 4 bytes after the payload still hold [`OVERRUN_PATTERN`].
    pub(crate) fn overrun_intact(self) -> bool {
        let mut actual = [0u8; GUARD_SIZE];
        // SAFETY: the overrun guard lies within the allocation.
        unsafe {
            ptr::copy_nonoverlapping(
                self.payload().as_ptr().add(self.size()),
                actual.as_mut_ptr(),
                GUARD_SIZE,
            );
        }
        actual == OVERRUN_PATTERN
    }

    /// Overwrite the whole payload with `byte`.
    pub(crate) fn fill_payload(self, byte: u8) {
        // SAFETY: the payload is valid for `size` bytes.
        unsafe { ptr::write_bytes(self.payload().as_ptr(), byte, self.size()) }
    }

    /// Whether `addr` lies within `[payload, payload + size]`.
    pub(crate) fn covers(self, addr: usize) -> bool {
        let start = self.payload().as_ptr() as usize;
        start <= addr && addr <= start.saturating_add(self.size())
    }
}
