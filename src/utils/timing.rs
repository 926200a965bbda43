//! Duration literal parsing
//!
//! Options carry timeouts as strings such as `"5s"` or `"1m30s"`. They are
//! parsed once when an entry is created.

use std::time::Duration;

/// Parse a Go style duration literal (`300ms`, `5s`, `1m30s`, `1.5h`).
///
/// A bare `0` is accepted. Negative values and unknown units are rejected.
pub fn parse_duration(input: &str) -> Result<Duration, String> {
    let s = input.trim();
    if s.is_empty() {
        return Err("empty duration".to_string());
    }
    if s == "0" {
        return Ok(Duration::ZERO);
    }
    if s.starts_with('-') {
        return Err(format!("negative duration: {}", input));
    }

    let s = s.strip_prefix('+').unwrap_or(s);
    let mut total_nanos = 0f64;
    let mut rest = s;

    while !rest.is_empty() {
        let number_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .ok_or_else(|| format!("missing unit in duration: {}", input))?;
        if number_len == 0 {
            return Err(format!("invalid duration: {}", input));
        }
        let value: f64 = rest[..number_len]
            .parse()
            .map_err(|_| format!("invalid number in duration: {}", input))?;
        rest = &rest[number_len..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let nanos_per_unit = match &rest[..unit_len] {
            "ns" => 1.0,
            "us" | "µs" | "μs" => 1e3,
            "ms" => 1e6,
            "s" => 1e9,
            "m" => 60e9,
            "h" => 3600e9,
            other => return Err(format!("unknown unit '{}' in duration: {}", other, input)),
        };
        rest = &rest[unit_len..];

        total_nanos += value * nanos_per_unit;
    }

    if !total_nanos.is_finite() || total_nanos >= u64::MAX as f64 {
        return Err(format!("duration out of range: {}", input));
    }

    Ok(Duration::from_nanos(total_nanos.round() as u64))
}

/// Parse a duration literal, using `default` for an empty string
pub fn parse_duration_or(input: &str, default: Duration) -> Result<Duration, String> {
    if input.trim().is_empty() {
        Ok(default)
    } else {
        parse_duration(input)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simple_units() {
        assert_eq!(parse_duration("5s").unwrap(), Duration::from_secs(5));
        assert_eq!(parse_duration("300ms").unwrap(), Duration::from_millis(300));
        assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
    }

    #[test]
    fn test_compound_and_fractional() {
        assert_eq!(parse_duration("1m30s").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("1.5s").unwrap(), Duration::from_millis(1500));
        assert_eq!(parse_duration("0").unwrap(), Duration::ZERO);
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("5").is_err());
        assert!(parse_duration("five seconds").is_err());
        assert!(parse_duration("-5s").is_err());
        assert!(parse_duration("5d").is_err());
    }

    #[test]
    fn test_default_for_empty() {
        let d = parse_duration_or("", Duration::from_secs(7)).unwrap();
        assert_eq!(d, Duration::from_secs(7));
    }
}
