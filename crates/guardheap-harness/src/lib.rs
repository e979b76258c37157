//! Self-test harness for guardheap.
//!
//! This crate provides:
//! - Scenario: the reference allocate / scan / free / terminate walk-through
//! - Stress: balanced multi-threaded allocate/free with a JSON summary
//! - Corruption drills: deliberately damage a block or the registry and
//!   confirm the scanner reports it

pub mod corrupt;
pub mod error;
pub mod scenario;
pub mod stress;

pub use corrupt::{CorruptionKind, CorruptionOutcome};
pub use error::HarnessError;
pub use scenario::ScenarioOutcome;
pub use stress::{StressConfig, StressSummary};

/// Parse a seed given in decimal or as `0x...`, underscores allowed.
pub fn parse_seed(raw: &str) -> Result<u64, HarnessError> {
    let cleaned: String = raw.trim().chars().filter(|&c| c != '_').collect();
    let parsed = match cleaned
        .strip_prefix("0x")
        .or_else(|| cleaned.strip_prefix("0X"))
    {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => cleaned.parse::<u64>(),
    };
    parsed.map_err(|_| HarnessError::InvalidSeed(raw.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seeds_parse_in_both_bases() {
        assert_eq!(parse_seed("42").expect("decimal"), 42);
        assert_eq!(parse_seed("0xDEAD_BEEF").expect("hex"), 0xDEAD_BEEF);
        assert!(matches!(
            parse_seed("zz"),
            Err(HarnessError::InvalidSeed(_))
        ));
    }
}
