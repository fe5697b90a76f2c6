//! TTL duration parsing.
//!
//! TTLs arrive as natural-language duration strings ("10m", "1h30m") and are
//! stored verbatim on the run; parsing happens at trigger time and again when
//! the expiry callback computes its schedule.

use thiserror::Error;

/// Errors raised while parsing a TTL string.
#[derive(Debug, Error)]
pub enum TtlError {
    /// The string is not a valid duration expression.
    #[error("Invalid TTL \"{input}\": {reason}")]
    Unparseable { input: String, reason: String },

    /// Zero or sub-second TTLs are rejected; they would expire runs before
    /// any worker could pick them up.
    #[error("TTL \"{0}\" is shorter than one second")]
    TooShort(String),
}

/// Parse a natural-language TTL string into a duration.
pub fn parse_ttl(input: &str) -> Result<chrono::Duration, TtlError> {
    let parsed = humantime::parse_duration(input.trim()).map_err(|e| TtlError::Unparseable {
        input: input.to_owned(),
        reason: e.to_string(),
    })?;

    if parsed.as_secs() == 0 {
        return Err(TtlError::TooShort(input.to_owned()));
    }

    chrono::Duration::from_std(parsed).map_err(|e| TtlError::Unparseable {
        input: input.to_owned(),
        reason: e.to_string(),
    })
}

/// Format a duration back into a compact human-readable string for logs.
pub fn format_ttl(duration: chrono::Duration) -> String {
    match duration.to_std() {
        Ok(std) => humantime::format_duration(std).to_string(),
        Err(_) => duration.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minutes() {
        assert_eq!(parse_ttl("10m").unwrap(), chrono::Duration::minutes(10));
    }

    #[test]
    fn test_parse_compound() {
        assert_eq!(
            parse_ttl("1h 30m").unwrap(),
            chrono::Duration::minutes(90)
        );
    }

    #[test]
    fn test_reject_garbage() {
        assert!(matches!(
            parse_ttl("soon"),
            Err(TtlError::Unparseable { .. })
        ));
    }

    #[test]
    fn test_reject_zero() {
        assert!(matches!(parse_ttl("0s"), Err(TtlError::TooShort(_))));
        assert!(matches!(parse_ttl("500ms"), Err(TtlError::TooShort(_))));
    }

    #[test]
    fn test_format_round_trip() {
        let d = parse_ttl("90m").unwrap();
        assert_eq!(format_ttl(d), "1h 30m");
    }
}
