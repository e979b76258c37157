//! Leak reporting and address lookup.

use std::fmt;
use std::io::{self, Write};

use serde::Serialize;

use crate::heap::GuardedHeap;
use crate::raw::RawAllocator;
use crate::site::CallSite;

/// One live block as seen by the reporter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AllocationSite {
    /// Where the block was allocated.
    pub site: CallSite,
    /// Payload address.
    pub address: usize,
    /// Payload size.
    pub size: usize,
}

impl fmt::Display for AllocationSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} bytes at {:#x}, allocated at line {} in '{}'",
            self.size, self.address, self.site.line, self.site.file
        )
    }
}

/// Every block still live, most recently allocated first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LeakReport {
    pub outstanding: usize,
    pub bytes: usize,
    pub peak_bytes: usize,
    pub blocks: Vec<AllocationSite>,
}

impl LeakReport {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.outstanding == 0 && self.blocks.is_empty()
    }

    /// Write the report in the classic text form.
    pub fn write_to<W: Write + ?Sized>(&self, out: &mut W, include_stats: bool) -> io::Result<()> {
        if self.outstanding != 0 {
            writeln!(out, "Warning: Not freed memory segments: {}", self.outstanding)?;
        }
        if !self.blocks.is_empty() {
            writeln!(out, "Warning: Memory that was not free'ed ({} bytes):", self.bytes)?;
            for block in &self.blocks {
                writeln!(
                    out,
                    "\t{:6} bytes at {:#x}, allocated at line {:4} in '{}'",
                    block.size, block.address, block.site.line, block.site.file
                )?;
            }
        }
        if include_stats {
            writeln!(
                out,
                "Maximum memory usage: {} bytes ({}k)",
                self.peak_bytes,
                self.peak_bytes.div_ceil(1024)
            )?;
        }
        out.flush()
    }
}

impl<A: RawAllocator> GuardedHeap<A> {
    /// Snapshot of every live block, taken under the registry lock.
    #[must_use]
    pub fn leak_report(&self) -> LeakReport {
        let state = self.registry.lock();
        LeakReport {
            outstanding: state.count(),
            bytes: state.current_bytes(),
            peak_bytes: state.peak_bytes(),
            blocks: state
                .blocks()
                .map(|block| AllocationSite {
                    site: block.site(),
                    address: block.payload().as_ptr() as usize,
                    size: block.size(),
                })
                .collect(),
        }
    }

    /// Report every block that is still live, and optionally the peak usage.
    ///
    /// Live blocks stay allocated; reclaiming them is left to teardown.
    pub fn terminate<W: Write + ?Sized>(&self, out: &mut W, include_stats: bool) -> io::Result<()> {
        self.leak_report().write_to(out, include_stats)
    }

    /// Find the live block whose payload range `[start, start + size]`
    /// contains `address`.
    #[must_use]
    pub fn report_allocated(&self, address: usize) -> Option<AllocationSite> {
        let state = self.registry.lock();
        state
            .blocks()
            .find(|block| block.covers(address))
            .map(|block| AllocationSite {
                site: block.site(),
                address: block.payload().as_ptr() as usize,
                size: block.size(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report() -> LeakReport {
        LeakReport {
            outstanding: 1,
            bytes: 32,
            peak_bytes: 96,
            blocks: vec![AllocationSite {
                site: CallSite::new("src/main.rs", 12),
                address: 0x1000,
                size: 32,
            }],
        }
    }

    #[test]
    fn text_form_lists_blocks_and_peak() {
        let mut out = Vec::new();
        report().write_to(&mut out, true).expect("write");
        let text = String::from_utf8(out).expect("utf8");
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(
            lines,
            vec![
                "Warning: Not freed memory segments: 1",
                "Warning: Memory that was not free'ed (32 bytes):",
                "\t    32 bytes at 0x1000, allocated at line   12 in 'src/main.rs'",
                "Maximum memory usage: 96 bytes (1k)",
            ]
        );
    }

    #[test]
    fn allocation_site_display_names_origin() {
        let block = report().blocks[0];
        assert_eq!(
            block.to_string(),
            "32 bytes at 0x1000, allocated at line 12 in 'src/main.rs'"
        );
    }

    #[test]
    fn empty_report_without_stats_is_silent() {
        let empty = LeakReport {
            outstanding: 0,
            bytes: 0,
            peak_bytes: 10,
            blocks: Vec::new(),
        };
        assert!(empty.is_empty());
        let mut out = Vec::new();
        empty.write_to(&mut out, false).expect("write");
        assert!(out.is_empty());
    }
}
