//! Utility functions and helpers.
//!
//! Environment variable handling and wall-clock helpers.

pub mod env;

pub use env::{get_env_parsed, get_env_with_prefix};

/// Seconds in one day.
pub const SECONDS_PER_DAY: u64 = 86_400;

/// Current Unix time in seconds.
pub fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
