//! Size and duration literal parsing.
//!
//! Policies and the expression language accept human-friendly literals
//! (`15M`, `1.5GB`, `192k`, `90m`, `2h`). Everything is resolved to bytes
//! or seconds at policy-load time so evaluation never re-parses strings.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{ModelError, Result};

static SIZE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?P<num>\d+(?:\.\d+)?)\s*(?P<unit>[kKmMgGtT]?)(?:i?[bB])?$")
        .expect("size literal regex")
});

static DURATION_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?P<num>\d+(?:\.\d+)?)\s*(?P<unit>[smhd]?)$")
        .expect("duration literal regex")
});

/// Parse a size literal into bytes. `15M` -> 15_728_640, `192k` -> 196_608.
pub fn parse_size_literal(raw: &str) -> Result<u64> {
    let caps = SIZE_RE.captures(raw.trim()).ok_or_else(|| {
        ModelError::InvalidLiteral(format!(
            "invalid size literal {raw:?}; expected forms like 500M, 1.5GB, 192k"
        ))
    })?;
    let num: f64 = caps["num"]
        .parse()
        .map_err(|_| ModelError::InvalidLiteral(format!("invalid size number in {raw:?}")))?;
    let multiplier: f64 = match caps["unit"].to_ascii_lowercase().as_str() {
        "" => 1.0,
        "k" => 1024.0,
        "m" => 1024.0 * 1024.0,
        "g" => 1024.0 * 1024.0 * 1024.0,
        "t" => 1024.0 * 1024.0 * 1024.0 * 1024.0,
        _ => unreachable!("regex limits units"),
    };
    Ok((num * multiplier) as u64)
}

/// Parse a duration literal into whole seconds. `90m` -> 5400, `2h` -> 7200.
/// A bare number is seconds.
pub fn parse_duration_literal(raw: &str) -> Result<u64> {
    let caps = DURATION_RE.captures(raw.trim()).ok_or_else(|| {
        ModelError::InvalidLiteral(format!(
            "invalid duration literal {raw:?}; expected forms like 45s, 90m, 2h"
        ))
    })?;
    let num: f64 = caps["num"]
        .parse()
        .map_err(|_| ModelError::InvalidLiteral(format!("invalid duration number in {raw:?}")))?;
    let multiplier: f64 = match &caps["unit"] {
        "" | "s" => 1.0,
        "m" => 60.0,
        "h" => 3600.0,
        "d" => 86400.0,
        _ => unreachable!("regex limits units"),
    };
    Ok((num * multiplier) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_literals() {
        assert_eq!(parse_size_literal("512").unwrap(), 512);
        assert_eq!(parse_size_literal("192k").unwrap(), 192 * 1024);
        assert_eq!(parse_size_literal("15M").unwrap(), 15 * 1024 * 1024);
        assert_eq!(
            parse_size_literal("1.5GB").unwrap(),
            (1.5 * 1024.0 * 1024.0 * 1024.0) as u64
        );
        assert_eq!(parse_size_literal("2GiB").unwrap(), 2 * 1024 * 1024 * 1024);
    }

    #[test]
    fn size_literal_rejects_garbage() {
        assert!(parse_size_literal("fifteen megs").is_err());
        assert!(parse_size_literal("15X").is_err());
        assert!(parse_size_literal("").is_err());
    }

    #[test]
    fn duration_literals() {
        assert_eq!(parse_duration_literal("45").unwrap(), 45);
        assert_eq!(parse_duration_literal("45s").unwrap(), 45);
        assert_eq!(parse_duration_literal("90m").unwrap(), 5400);
        assert_eq!(parse_duration_literal("2h").unwrap(), 7200);
    }

    #[test]
    fn duration_literal_rejects_garbage() {
        assert!(parse_duration_literal("90 minutes").is_err());
        assert!(parse_duration_literal("-5m").is_err());
    }
}
