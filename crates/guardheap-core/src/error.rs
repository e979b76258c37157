//! Error values returned by allocator operations.

use std::fmt;

use serde::Serialize;
use thiserror::Error;

/// Operation that was handed a bad pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Freeing,
    Reallocating,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Freeing => "Freeing",
            Self::Reallocating => "Reallocating",
        })
    }
}

/// Why a pointer failed the plausibility filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PointerFault {
    /// Null where null is not allowed.
    Null,
    /// Not aligned to the minimum allocation alignment.
    Misaligned,
    /// Outside the range of payload addresses ever handed out.
    OutOfRange,
}

impl fmt::Display for PointerFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Null => "NULL pointer",
            Self::Misaligned => "wrong aligned pointer",
            Self::OutOfRange => "pointer out of range",
        })
    }
}

/// Failure of an allocator operation.
///
/// Everything here is recovered locally; only an [`HeapError::OutOfMemory`]
/// with `fatal` set asks the caller to end the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum HeapError {
    #[error("out of memory: needed {requested} bytes, {in_use} bytes in use")]
    OutOfMemory {
        requested: usize,
        in_use: usize,
        fatal: bool,
    },
    #[error("{operation} {fault}")]
    InvalidPointer {
        operation: Operation,
        fault: PointerFault,
    },
    #[error("freeing unallocated data at {address:#x}")]
    InvalidFree { address: usize },
    #[error("reallocating unallocated data at {address:#x}")]
    InvalidRealloc { address: usize },
}

impl HeapError {
    /// Whether the caller asked for this failure to terminate the process.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::OutOfMemory { fatal: true, .. })
    }
}
