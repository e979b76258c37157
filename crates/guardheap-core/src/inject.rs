//! Deliberate registry damage for exercising the scanner from other crates.
//!
//! Only compiled with the `fault-injection` feature.

#![allow(unsafe_code)]

use std::ptr::NonNull;

use crate::block::{BlockHeader, GuardedBlock};
use crate::heap::GuardedHeap;
use crate::raw::RawAllocator;

/// A link cut by [`GuardedHeap::sever_list_after_head`].
///
/// Hand it back to [`GuardedHeap::restore_link`] before the heap is dropped,
/// or the blocks past the cut are never released.
#[derive(Debug)]
pub struct SeveredLink {
    block: GuardedBlock,
    saved: NonNull<BlockHeader>,
}

impl<A: RawAllocator> GuardedHeap<A> {
    /// Terminate the registry list right after its most recent block.
    ///
    /// `None` when fewer than two blocks are live.
    pub fn sever_list_after_head(&self) -> Option<SeveredLink> {
        let state = self.registry.lock();
        let head = state.blocks().next()?;
        let saved = head.next()?;
        head.set_next(None);
        Some(SeveredLink { block: head, saved })
    }

    /// Undo [`Self::sever_list_after_head`].
    pub fn restore_link(&self, link: SeveredLink) {
        let _state = self.registry.lock();
        link.block.set_next(Some(link.saved));
    }
}
