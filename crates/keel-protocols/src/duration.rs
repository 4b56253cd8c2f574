//! Single-unit duration string parsing.
//!
//! Durations are configured as a number with exactly one unit suffix
//! (`"500ms"`, `"1s"`, `"5m"`, `"1h"`, `"2d"`). Multi-unit strings are a
//! configuration error at declaration time, never at run time.

use std::time::Duration;

use crate::error::DurationError;

/// Parse a single-unit duration string.
pub fn parse_duration(input: &str) -> Result<Duration, DurationError> {
    let input = input.trim();
    if input.is_empty() {
        return Err(DurationError::Empty);
    }

    let split = input
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(|| DurationError::MissingUnit(input.to_string()))?;

    let (digits, unit) = input.split_at(split);
    if digits.is_empty() {
        return Err(DurationError::Invalid(input.to_string()));
    }

    let value: u64 = digits
        .parse()
        .map_err(|_| DurationError::Invalid(input.to_string()))?;

    let scaled = |factor: u64| {
        value
            .checked_mul(factor)
            .map(Duration::from_secs)
            .ok_or_else(|| DurationError::Invalid(input.to_string()))
    };

    match unit {
        "ms" => Ok(Duration::from_millis(value)),
        "s" => Ok(Duration::from_secs(value)),
        "m" => scaled(60),
        "h" => scaled(3600),
        "d" => scaled(86400),
        other if other.contains(|c: char| c.is_ascii_digit()) => {
            // A digit after the unit means a multi-unit string like "1h30m".
            Err(DurationError::MultiUnit(input.to_string()))
        }
        other => Err(DurationError::UnknownUnit(other.to_string())),
    }
}
