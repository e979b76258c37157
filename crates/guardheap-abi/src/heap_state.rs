//! Process-wide heap instance and the conversions shared by every entry point.

use std::ffi::{CStr, c_char};
use std::sync::OnceLock;

use guardheap_core::config::parse_bool_loose;
use guardheap_core::{
    AllocFlags, CallSite, DiagnosticSink, GuardedHeap, HeapConfig, HeapError, JsonLinesSink,
    StderrSink,
};

/// The heap behind every `guardheap_*` symbol.
///
/// Built on first use from `HeapConfig::from_env`. Diagnostics go to standard
/// error, as JSON lines when `GUARDHEAP_JSON` is set.
pub fn global_heap() -> &'static GuardedHeap {
    static HEAP: OnceLock<GuardedHeap> = OnceLock::new();
    HEAP.get_or_init(|| GuardedHeap::with_sink(HeapConfig::from_env(), env_sink()))
}

fn env_sink() -> Box<dyn DiagnosticSink> {
    let json = std::env::var("GUARDHEAP_JSON")
        .ok()
        .and_then(|raw| parse_bool_loose(&raw))
        .unwrap_or(false);
    if json {
        Box::new(JsonLinesSink::new(std::io::stderr()))
    } else {
        Box::new(StderrSink)
    }
}

/// Call site from a C file name and line.
///
/// # Safety
///
/// `file` must be null or a NUL-terminated string that outlives the process,
/// such as a `__FILE__` literal.
pub unsafe fn site_from(file: *const c_char, line: u32) -> CallSite {
    if file.is_null() {
        return CallSite::unknown_at(line);
    }
    // SAFETY: caller guarantees a static NUL-terminated string.
    let name: &'static CStr = unsafe { CStr::from_ptr(file) };
    match name.to_str() {
        Ok(name) => CallSite::new(name, line),
        Err(_) => CallSite::unknown_at(line),
    }
}

#[must_use]
pub fn flags_from(bits: u32) -> AllocFlags {
    AllocFlags::from_bits_truncate(bits)
}

/// Turn a core error into the C convention: null, or exit for a fatal OOM.
///
/// The diagnostic has already been emitted by the heap.
pub(crate) fn fail<T>(err: HeapError) -> *mut T {
    if err.is_fatal() {
        std::process::exit(1);
    }
    std::ptr::null_mut()
}
