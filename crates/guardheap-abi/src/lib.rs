//! # guardheap-abi
//!
//! `extern "C"` boundary over one process-wide guarded heap.
//!
//! The heap is configured from the environment on first use (see
//! `guardheap_core::config`). Every entry point takes the caller's file name
//! and line so diagnostics and leak reports point at the allocating source
//! line; C callers normally pass `__FILE__` and `__LINE__` through a macro.
//!
//! # Architecture
//!
//! ```text
//! C caller -> ABI entry (this crate) -> GuardedHeap -> system allocator
//! ```
//!
//! The core never terminates the process. This layer does, exactly once:
//! an out-of-memory error raised with the force-abort flag exits with
//! status 1 after its diagnostic has been written.

pub mod heap_state;
pub mod malloc_abi;
pub mod report_abi;
