//! Structured diagnostics.
//!
//! Every problem the heap notices becomes one [`Diagnostic`] record handed to
//! the heap's [`DiagnosticSink`]. Sinks are always invoked with the registry
//! lock released, so a sink may inspect the heap it reports on.
//!
//! Provided sinks:
//! - [`StderrSink`]: one human-readable line per record.
//! - [`JsonLinesSink`]: one JSON object per line.
//! - [`MemorySink`]: keeps records in memory (tests, tooling).
//! - [`NullSink`]: drops everything.

use std::fmt;
use std::io::Write;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;

use crate::site::CallSite;

/// Severity of a diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Error,
    Fatal,
}

/// Class of problem detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticKind {
    OutOfMemory,
    InvalidPointer,
    Underrun,
    Overrun,
    ListCorruption,
    InvalidFree,
    InvalidRealloc,
}

/// One diagnostic record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Diagnostic {
    pub level: Severity,
    pub kind: DiagnosticKind,
    /// Where the problem was detected.
    pub site: CallSite,
    /// Where the affected block was allocated, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub origin: Option<CallSite>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<usize>,
    pub message: String,
}

impl Diagnostic {
    #[must_use]
    pub fn new(
        level: Severity,
        kind: DiagnosticKind,
        site: CallSite,
        message: impl Into<String>,
    ) -> Self {
        Self {
            level,
            kind,
            site,
            origin: None,
            address: None,
            size: None,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn with_origin(mut self, origin: CallSite) -> Self {
        self.origin = Some(origin);
        self
    }

    #[must_use]
    pub fn with_address(mut self, address: usize) -> Self {
        self.address = Some(address);
        self
    }

    #[must_use]
    pub fn with_size(mut self, size: usize) -> Self {
        self.size = Some(size);
        self
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self.level {
            Severity::Warning => "Warning",
            Severity::Error => "Error",
            Severity::Fatal => "Fatal",
        };
        write!(f, "{label}: {}", self.message)
    }
}

/// Destination for diagnostics.
pub trait DiagnosticSink: Send + Sync {
    fn emit(&self, diagnostic: &Diagnostic);
}

impl<S: DiagnosticSink + ?Sized> DiagnosticSink for Arc<S> {
    fn emit(&self, diagnostic: &Diagnostic) {
        (**self).emit(diagnostic);
    }
}

impl<S: DiagnosticSink + ?Sized> DiagnosticSink for Box<S> {
    fn emit(&self, diagnostic: &Diagnostic) {
        (**self).emit(diagnostic);
    }
}

/// Writes `Error: ...` lines to standard error.
#[derive(Debug, Default, Clone, Copy)]
pub struct StderrSink;

impl DiagnosticSink for StderrSink {
    fn emit(&self, diagnostic: &Diagnostic) {
        let mut err = std::io::stderr().lock();
        let _ = writeln!(err, "{diagnostic}");
        let _ = err.flush();
    }
}

/// Discards every diagnostic.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl DiagnosticSink for NullSink {
    fn emit(&self, _diagnostic: &Diagnostic) {}
}

/// Writes one JSON object per diagnostic.
pub struct JsonLinesSink<W> {
    writer: Mutex<W>,
}

impl<W: Write + Send> JsonLinesSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    /// Recover the underlying writer.
    pub fn into_inner(self) -> W {
        self.writer.into_inner()
    }
}

impl<W: Write + Send> DiagnosticSink for JsonLinesSink<W> {
    fn emit(&self, diagnostic: &Diagnostic) {
        let mut writer = self.writer.lock();
        if serde_json::to_writer(&mut *writer, diagnostic).is_ok() {
            let _ = writer.write_all(b"\n");
            let _ = writer.flush();
        }
    }
}

/// Keeps every diagnostic in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    records: Mutex<Vec<Diagnostic>>,
}

impl MemorySink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of everything recorded so far.
    #[must_use]
    pub fn records(&self) -> Vec<Diagnostic> {
        self.records.lock().clone()
    }

    /// Number of records of one kind.
    #[must_use]
    pub fn count(&self, kind: DiagnosticKind) -> usize {
        self.records.lock().iter().filter(|d| d.kind == kind).count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    /// Take all records, leaving the sink empty.
    pub fn drain(&self) -> Vec<Diagnostic> {
        std::mem::take(&mut *self.records.lock())
    }
}

impl DiagnosticSink for MemorySink {
    fn emit(&self, diagnostic: &Diagnostic) {
        self.records.lock().push(diagnostic.clone());
    }
}
