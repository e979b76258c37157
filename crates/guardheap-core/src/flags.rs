//! Per-call behavior flags.

use bitflags::bitflags;

bitflags! {
    /// Flags accepted by every allocator operation.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct AllocFlags: u32 {
        /// Out-of-memory is fatal; the error is marked for process termination.
        const FORCE_ABORT_ON_FAILURE = 1 << 0;
        /// Emit a diagnostic when an allocation fails.
        const WARN_ON_FAILURE = 1 << 1;
        /// Zero new memory instead of filling it with the allocation sentinel.
        const ZERO_FILL = 1 << 2;
        /// Freeing a null pointer is a silent no-op.
        const ALLOW_ZERO_PTR_ON_FREE = 1 << 3;
        /// Reallocating a null pointer behaves as a fresh allocation.
        const ALLOW_ZERO_PTR_ON_REALLOC = 1 << 4;
        /// When reallocation fails, hand back the original pointer.
        const HOLD_ON_REALLOC_ERROR = 1 << 5;
        /// When reallocation fails, release the original block.
        const FREE_ON_REALLOC_ERROR = 1 << 6;
        /// Skip the pre-operation sanity scan for this call only.
        const SKIP_SANITY = 1 << 7;
    }
}

impl AllocFlags {
    /// Whether a failed allocation should produce a diagnostic.
    #[must_use]
    pub const fn reports_failure(self) -> bool {
        self.intersects(Self::FORCE_ABORT_ON_FAILURE.union(Self::WARN_ON_FAILURE))
    }
}
