//! Harness error type.

use guardheap_core::HeapError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("heap operation failed: {0}")]
    Heap(#[from] HeapError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid seed '{0}' (expected decimal or 0x-prefixed hex)")]
    InvalidSeed(String),
    #[error("stress worker {0} panicked")]
    WorkerPanicked(usize),
    #[error("{kind} corruption was not detected")]
    Undetected { kind: String },
}
