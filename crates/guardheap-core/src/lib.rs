//! Guarded heap: a diagnostic layer over a raw allocator.
//!
//! Every allocation becomes a guarded block: a header recording the call
//! site, a 32-bit underrun guard in front of the payload and a 4-byte overrun
//! guard behind it. Live blocks sit in one mutex-protected registry that
//! supports full-heap corruption scans, leak reports and usage statistics.
//!
//! # Architecture
//!
//! - **Block layout** (`block`): physical shape, sentinel constants, offsets
//! - **Registry** (`registry`): intrusive list of live blocks plus counters
//! - **Validator** (`validator`): pointer plausibility, guard checks, scans
//! - **Heap** (`heap`): allocate / reallocate / deallocate and the dup helpers
//! - **Reporter** (`report`): leak dump and address-to-site lookup
//! - **Diagnostics** (`diag`): structured records and sinks
//! - **Configuration** (`config`): limits, quick mode, padding
//! - **Metrics** (`metrics`): atomic counters for observability
//! - **Fault injection** (`inject`, feature `fault-injection`): cut the list
//!
//! This is a detection tool: it is strictly slower than the allocator it
//! wraps, never resizes in place and never repairs a damaged block.

#![deny(unsafe_code)]

pub mod block;
pub mod config;
pub mod diag;
pub mod error;
pub mod flags;
pub mod heap;
#[cfg(feature = "fault-injection")]
pub mod inject;
pub mod metrics;
pub mod raw;
pub mod registry;
pub mod report;
pub mod site;
pub mod validator;

pub use config::HeapConfig;
pub use diag::{
    Diagnostic, DiagnosticKind, DiagnosticSink, JsonLinesSink, MemorySink, NullSink, Severity,
    StderrSink,
};
pub use error::{HeapError, Operation, PointerFault};
pub use flags::AllocFlags;
pub use heap::GuardedHeap;
pub use metrics::{HeapMetrics, MetricsSnapshot};
pub use raw::{RawAllocator, RetainingAllocator, SystemAllocator};
pub use registry::HeapStats;
pub use report::{AllocationSite, LeakReport};
pub use site::CallSite;
pub use validator::{BlockCheck, ScanReport};
