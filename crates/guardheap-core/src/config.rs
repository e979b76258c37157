//! Heap tunables.
//!
//! A heap is configured once at construction. Quick mode and the byte limit
//! can be changed afterwards through [`crate::GuardedHeap`]; the pads are
//! fixed for the lifetime of the heap because every live block depends on
//! them.
//!
//! Environment variables read by [`HeapConfig::from_env`]:
//! - `GUARDHEAP_QUICK`: `1`/`true`/`on`/`yes` skips pre-operation scans and
//!   poison fills.
//! - `GUARDHEAP_LIMIT`: ceiling on live payload bytes, with optional
//!   `k`/`m`/`g` suffix. `unlimited`/`off` means no ceiling.
//! - `GUARDHEAP_PREPAD`, `GUARDHEAP_POSTPAD`: extra bytes around the guarded
//!   region.

use crate::block::BlockLayout;

/// Construction-time configuration of a [`crate::GuardedHeap`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapConfig {
    /// Maximum sum of live payload sizes.
    pub byte_limit: usize,
    /// Skip pre-operation scans and poison fills.
    pub quick_mode: bool,
    /// Extra bytes between header and payload (rounded to alignment).
    pub pre_pad: usize,
    /// Extra bytes after the overrun guard.
    pub post_pad: usize,
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self {
            byte_limit: usize::MAX,
            quick_mode: false,
            pre_pad: 0,
            post_pad: 0,
        }
    }
}

impl HeapConfig {
    #[must_use]
    pub fn with_byte_limit(mut self, byte_limit: usize) -> Self {
        self.byte_limit = byte_limit;
        self
    }

    #[must_use]
    pub fn with_quick_mode(mut self, quick_mode: bool) -> Self {
        self.quick_mode = quick_mode;
        self
    }

    #[must_use]
    pub fn with_padding(mut self, pre_pad: usize, post_pad: usize) -> Self {
        self.pre_pad = pre_pad;
        self.post_pad = post_pad;
        self
    }

    /// Block layout implied by the pad settings.
    #[must_use]
    pub fn block_layout(&self) -> BlockLayout {
        BlockLayout::new(self.pre_pad, self.post_pad)
    }

    /// Read configuration from the process environment.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read configuration through an arbitrary key lookup.
    ///
    /// Unparseable values fall back to the default for that field.
    #[must_use]
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            byte_limit: lookup("GUARDHEAP_LIMIT")
                .and_then(|v| parse_limit_loose(&v))
                .unwrap_or(defaults.byte_limit),
            quick_mode: lookup("GUARDHEAP_QUICK")
                .and_then(|v| parse_bool_loose(&v))
                .unwrap_or(defaults.quick_mode),
            pre_pad: lookup("GUARDHEAP_PREPAD")
                .and_then(|v| parse_size_loose(&v))
                .unwrap_or(defaults.pre_pad),
            post_pad: lookup("GUARDHEAP_POSTPAD")
                .and_then(|v| parse_size_loose(&v))
                .unwrap_or(defaults.post_pad),
        }
    }
}

/// Parse a boolean switch (case-insensitive).
#[must_use]
pub fn parse_bool_loose(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "on" | "yes" | "quick" => Some(true),
        "0" | "false" | "off" | "no" | "full" => Some(false),
        _ => None,
    }
}

/// Parse a byte count with an optional `k`/`m`/`g` suffix.
#[must_use]
pub fn parse_size_loose(s: &str) -> Option<usize> {
    let s = s.trim().to_ascii_lowercase();
    let (digits, shift) = match s.as_bytes().last()? {
        b'k' => (&s[..s.len() - 1], 10),
        b'm' => (&s[..s.len() - 1], 20),
        b'g' => (&s[..s.len() - 1], 30),
        _ => (s.as_str(), 0),
    };
    let value: usize = digits.trim().parse().ok()?;
    value.checked_mul(1usize.checked_shl(shift)?)
}

fn parse_limit_loose(s: &str) -> Option<usize> {
    match s.trim().to_ascii_lowercase().as_str() {
        "unlimited" | "off" | "none" | "max" => Some(usize::MAX),
        other => parse_size_loose(other),
    }
}
