//! Call-site provenance recorded for every guarded allocation.

use std::fmt;
use std::panic::Location;

use serde::Serialize;

/// Source location that requested (or detected a problem with) an allocation.
///
/// The file name is borrowed for `'static`: it is never owned by the block
/// that records it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct CallSite {
    /// Source file of the call.
    pub file: &'static str,
    /// Line number of the call.
    pub line: u32,
}

impl CallSite {
    /// Build a call site from an explicit file/line pair.
    #[must_use]
    pub const fn new(file: &'static str, line: u32) -> Self {
        Self { file, line }
    }

    /// The location of the caller of this function.
    #[must_use]
    #[track_caller]
    pub fn here() -> Self {
        let location = Location::caller();
        Self::new(location.file(), location.line())
    }

    /// Placeholder site used when the caller could not name one.
    #[must_use]
    pub const fn unknown() -> Self {
        Self::unknown_at(0)
    }

    /// Placeholder file with a known line.
    #[must_use]
    pub const fn unknown_at(line: u32) -> Self {
        Self::new("<unknown>", line)
    }
}

impl fmt::Display for CallSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.line)
    }
}
