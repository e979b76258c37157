//! Scan, report and tuning entry points.

use std::ffi::{c_char, c_int, c_void};
use std::io::{self, Write};

use guardheap_core::ScanReport;

use crate::heap_state::{global_heap, site_from};

/// Writes into a raw file descriptor without taking ownership of it.
struct FdWriter(c_int);

impl Write for FdWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        // SAFETY: buf is valid for buf.len() bytes; an invalid fd yields EBADF.
        let n = unsafe { libc::write(self.0, buf.as_ptr().cast(), buf.len()) };
        if n < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(n as usize)
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Force creation of the process-wide heap. Always returns 0.
#[unsafe(no_mangle)]
pub extern "C" fn guardheap_init() -> c_int {
    let _ = global_heap();
    0
}

/// Scan every live block. Returns the number of blocks with a damaged
/// guard, 0 when clean, or -1 when the registry list itself is damaged (the
/// block count is then incomplete).
///
/// # Safety
///
/// `file` must be null or a static NUL-terminated string.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn guardheap_sanity(file: *const c_char, line: u32) -> c_int {
    // SAFETY: forwarded caller contract.
    let site = unsafe { site_from(file, line) };
    sanity_status(&global_heap().sanity_check(site))
}

fn sanity_status(report: &ScanReport) -> c_int {
    if report.list_corrupted {
        -1
    } else {
        c_int::try_from(report.corrupted_blocks).unwrap_or(c_int::MAX)
    }
}

/// Write the leak report to `fd`, with the peak usage line when
/// `include_stats` is non-zero. A negative `fd` writes nothing.
///
/// Returns 0, or -1 if writing failed.
#[unsafe(no_mangle)]
pub extern "C" fn guardheap_terminate(fd: c_int, include_stats: c_int) -> c_int {
    if fd < 0 {
        return 0;
    }
    match global_heap().terminate(&mut FdWriter(fd), include_stats != 0) {
        Ok(()) => 0,
        Err(_) => -1,
    }
}

/// Print where the block containing `addr` was allocated, on standard
/// output. Returns 1 when a block was found, 0 otherwise.
#[unsafe(no_mangle)]
pub extern "C" fn guardheap_report_allocated(addr: *const c_void) -> c_int {
    match global_heap().report_allocated(addr as usize) {
        Some(block) => {
            let mut out = io::stdout().lock();
            let _ = writeln!(out, "{block}");
            let _ = out.flush();
            1
        }
        None => 0,
    }
}

/// Turn quick mode on (non-zero) or off.
#[unsafe(no_mangle)]
pub extern "C" fn guardheap_set_quick_mode(enabled: c_int) {
    global_heap().set_quick_mode(enabled != 0);
}

/// Cap the live payload bytes; 0 means unlimited.
#[unsafe(no_mangle)]
pub extern "C" fn guardheap_set_byte_limit(limit: usize) {
    let limit = if limit == 0 { usize::MAX } else { limit };
    global_heap().set_byte_limit(limit);
}

/// Live block count and current/peak payload bytes.
///
/// # Safety
///
/// Each out-pointer must be null or valid for a write.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn guardheap_stats(
    live_blocks: *mut usize,
    current_bytes: *mut usize,
    peak_bytes: *mut usize,
) {
    let stats = global_heap().stats();
    for (out, value) in [
        (live_blocks, stats.live_blocks),
        (current_bytes, stats.current_bytes),
        (peak_bytes, stats.peak_bytes),
    ] {
        if !out.is_null() {
            // SAFETY: caller guarantees non-null out-pointers are writable.
            unsafe { out.write(value) };
        }
    }
}
