//! Live-allocation registry.
//!
//! An intrusive doubly linked list of every live block plus the usage
//! counters, all behind one `parking_lot::Mutex`. Insertion is LIFO at the
//! head. The registry owns `head`, each block owns its `next`, and `prev` is
//! a plain back reference used only to unlink in O(1).

#![allow(unsafe_code)]

use std::ptr::NonNull;

use parking_lot::{Mutex, MutexGuard};
use serde::Serialize;

use crate::block::{BlockHeader, BlockLayout, GuardedBlock};
use crate::config::HeapConfig;

/// Snapshot of the registry counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HeapStats {
    /// Number of live blocks.
    pub live_blocks: usize,
    /// Sum of live payload sizes.
    pub current_bytes: usize,
    /// Highest value `current_bytes` ever reached.
    pub peak_bytes: usize,
    /// Ceiling on `current_bytes`.
    pub byte_limit: usize,
    /// Lowest payload address ever handed out, if any.
    pub min_address: Option<usize>,
    /// Highest payload address ever handed out, if any.
    pub max_address: Option<usize>,
}

/// State guarded by the registry lock.
pub(crate) struct RegistryState {
    head: Option<NonNull<BlockHeader>>,
    count: usize,
    current_bytes: usize,
    /// Bytes admitted against the limit whose raw allocation is in flight.
    reserved: usize,
    peak_bytes: usize,
    min_address: usize,
    max_address: usize,
    layout: BlockLayout,
    pub(crate) byte_limit: usize,
    pub(crate) quick_mode: bool,
}

// SAFETY: the raw links are only dereferenced while the owning mutex is held.
unsafe impl Send for RegistryState {}

impl RegistryState {
    fn new(config: &HeapConfig) -> Self {
        Self {
            head: None,
            count: 0,
            current_bytes: 0,
            reserved: 0,
            peak_bytes: 0,
            min_address: usize::MAX,
            max_address: 0,
            layout: config.block_layout(),
            byte_limit: config.byte_limit,
            quick_mode: config.quick_mode,
        }
    }

    pub(crate) fn count(&self) -> usize {
        self.count
    }

    pub(crate) fn current_bytes(&self) -> usize {
        self.current_bytes
    }

    pub(crate) fn peak_bytes(&self) -> usize {
        self.peak_bytes
    }

    /// Whether `size` more live bytes stay within the byte limit, counting
    /// reservations not yet inserted.
    pub(crate) fn admits(&self, size: usize) -> bool {
        self.current_bytes
            .checked_add(self.reserved)
            .and_then(|total| total.checked_add(size))
            .is_some_and(|total| total <= self.byte_limit)
    }

    /// Claim `size` bytes of the limit for an allocation about to be made.
    ///
    /// The claim turns into live bytes at [`Self::insert`] or is handed back
    /// with [`Self::unreserve`].
    pub(crate) fn reserve(&mut self, size: usize) -> bool {
        if !self.admits(size) {
            return false;
        }
        self.reserved += size;
        true
    }

    pub(crate) fn unreserve(&mut self, size: usize) {
        self.reserved = self.reserved.saturating_sub(size);
    }

    /// Whether `addr` lies within the range of payloads ever handed out.
    pub(crate) fn plausible(&self, addr: usize) -> bool {
        self.min_address <= addr && addr <= self.max_address
    }

    /// Link a fresh block in at the head.
    pub(crate) fn insert(&mut self, block: GuardedBlock) {
        block.set_prev(None);
        block.set_next(self.head);
        if let Some(head) = self.head {
            // SAFETY: head is a live block of this registry.
            unsafe { GuardedBlock::from_header(head, self.layout) }.set_prev(Some(block.header()));
        }
        self.head = Some(block.header());

        self.count += 1;
        self.reserved = self.reserved.saturating_sub(block.size());
        self.current_bytes = self.current_bytes.saturating_add(block.size());
        self.peak_bytes = self.peak_bytes.max(self.current_bytes);

        let addr = block.payload().as_ptr() as usize;
        self.min_address = self.min_address.min(addr);
        self.max_address = self.max_address.max(addr);
    }

    /// Unlink a block.
    pub(crate) fn remove(&mut self, block: GuardedBlock) {
        let prev = block.prev();
        let next = block.next();
        match prev {
            // SAFETY: links of a live block point at live blocks.
            Some(prev) => unsafe { GuardedBlock::from_header(prev, self.layout) }.set_next(next),
            None => self.head = next,
        }
        if let Some(next) = next {
            // SAFETY: links of a live block point at live blocks.
            unsafe { GuardedBlock::from_header(next, self.layout) }.set_prev(prev);
        }
        block.set_prev(None);
        block.set_next(None);

        self.count = self.count.saturating_sub(1);
        self.current_bytes = self.current_bytes.saturating_sub(block.size());
    }

    /// Walk at most `count` blocks from the head.
    pub(crate) fn blocks(&self) -> Blocks<'_> {
        Blocks {
            next: self.head,
            remaining: self.count,
            layout: self.layout,
            _state: self,
        }
    }

    pub(crate) fn stats(&self) -> HeapStats {
        let seen = self.min_address <= self.max_address;
        HeapStats {
            live_blocks: self.count,
            current_bytes: self.current_bytes,
            peak_bytes: self.peak_bytes,
            byte_limit: self.byte_limit,
            min_address: seen.then_some(self.min_address),
            max_address: seen.then_some(self.max_address),
        }
    }

    /// Forget every block without touching memory; returns the headers that
    /// were reachable.
    pub(crate) fn take_all(&mut self) -> Vec<GuardedBlock> {
        let blocks: Vec<GuardedBlock> = self.blocks().collect();
        self.head = None;
        self.count = 0;
        self.current_bytes = 0;
        blocks
    }
}

/// Bounded traversal of the registry list.
///
/// Stops after `count` blocks even if the list continues; what is left over
/// is reported by [`Blocks::leftover`].
pub(crate) struct Blocks<'a> {
    next: Option<NonNull<BlockHeader>>,
    remaining: usize,
    layout: BlockLayout,
    _state: &'a RegistryState,
}

impl Blocks<'_> {
    /// After exhaustion: `(unvisited_budget, list_continues)`.
    pub(crate) fn leftover(&self) -> (usize, bool) {
        (self.remaining, self.next.is_some())
    }
}

impl Iterator for Blocks<'_> {
    type Item = GuardedBlock;

    fn next(&mut self) -> Option<GuardedBlock> {
        if self.remaining == 0 {
            return None;
        }
        let header = self.next?;
        // SAFETY: registry links only reference live blocks.
        let block = unsafe { GuardedBlock::from_header(header, self.layout) };
        self.next = block.next();
        self.remaining -= 1;
        Some(block)
    }
}

/// The mutex-protected registry.
pub(crate) struct Registry {
    state: Mutex<RegistryState>,
    layout: BlockLayout,
}

impl Registry {
    pub(crate) fn new(config: &HeapConfig) -> Self {
        Self {
            state: Mutex::new(RegistryState::new(config)),
            layout: config.block_layout(),
        }
    }

    pub(crate) fn layout(&self) -> BlockLayout {
        self.layout
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock()
    }

    pub(crate) fn get_mut(&mut self) -> &mut RegistryState {
        self.state.get_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::site::CallSite;

    struct Arena {
        blocks: Vec<(NonNull<u8>, std::alloc::Layout)>,
        layout: BlockLayout,
    }

    impl Arena {
        fn new() -> Self {
            Self {
                blocks: Vec::new(),
                layout: BlockLayout::default(),
            }
        }

        fn block(&mut self, size: usize) -> GuardedBlock {
            let alloc_layout = self.layout.layout_for(size).expect("layout");
            // SAFETY: non-zero layout.
            let raw = NonNull::new(unsafe { std::alloc::alloc(alloc_layout) }).expect("alloc");
            self.blocks.push((raw, alloc_layout));
            // SAFETY: raw is valid for the layout.
            unsafe { GuardedBlock::init(raw, self.layout, size, CallSite::here()) }
        }
    }

    impl Drop for Arena {
        fn drop(&mut self) {
            for (raw, layout) in self.blocks.drain(..) {
                // SAFETY: allocated above with this layout.
                unsafe { std::alloc::dealloc(raw.as_ptr(), layout) };
            }
        }
    }

    #[test]
    fn insert_is_lifo_and_tracks_peak() {
        let mut arena = Arena::new();
        let mut state = RegistryState::new(&HeapConfig::default());
        let a = arena.block(10);
        let b = arena.block(20);
        state.insert(a);
        state.insert(b);

        let order: Vec<usize> = state.blocks().map(GuardedBlock::size).collect();
        assert_eq!(order, vec![20, 10]);
        assert_eq!(state.count(), 2);
        assert_eq!(state.current_bytes(), 30);

        state.remove(b);
        assert_eq!(state.current_bytes(), 10);
        assert_eq!(state.peak_bytes(), 30);
    }

    #[test]
    fn remove_middle_relinks_neighbours() {
        let mut arena = Arena::new();
        let mut state = RegistryState::new(&HeapConfig::default());
        let blocks: Vec<GuardedBlock> = (1..=3).map(|n| arena.block(n)).collect();
        for block in &blocks {
            state.insert(*block);
        }
        state.remove(blocks[1]);

        let sizes: Vec<usize> = state.blocks().map(GuardedBlock::size).collect();
        assert_eq!(sizes, vec![3, 1]);
        assert_eq!(blocks[2].next(), Some(blocks[0].header()));
        assert_eq!(blocks[0].prev(), Some(blocks[2].header()));

        let mut iter = state.blocks();
        assert_eq!(iter.by_ref().count(), 2);
        assert_eq!(iter.leftover(), (0, false));
    }

    #[test]
    fn byte_limit_admission() {
        let mut arena = Arena::new();
        let mut state = RegistryState::new(&HeapConfig::default().with_byte_limit(100));
        assert!(state.admits(100));
        assert!(!state.admits(101));
        state.insert(arena.block(60));
        assert!(state.admits(40));
        assert!(!state.admits(41));
    }

    #[test]
    fn reservations_count_against_the_limit() {
        let mut arena = Arena::new();
        let mut state = RegistryState::new(&HeapConfig::default().with_byte_limit(100));
        assert!(state.reserve(60));
        assert!(!state.reserve(60));
        assert!(state.reserve(40));
        assert!(!state.admits(1));

        state.unreserve(40);
        assert!(state.admits(40));

        state.insert(arena.block(60));
        assert_eq!(state.current_bytes(), 60);
        assert!(state.reserve(40));
        assert!(!state.reserve(1));
    }

    #[test]
    fn observed_bounds_cover_every_payload() {
        let mut arena = Arena::new();
        let mut state = RegistryState::new(&HeapConfig::default());
        assert_eq!(state.stats().min_address, None);

        let a = arena.block(8);
        let b = arena.block(8);
        state.insert(a);
        state.insert(b);
        for block in [a, b] {
            assert!(state.plausible(block.payload().as_ptr() as usize));
        }
        assert!(!state.plausible(0));
    }
}
