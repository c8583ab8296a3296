use chrono::{DateTime, SecondsFormat, Utc};

/// Returns the current Unix timestamp in milliseconds.
pub fn current_unix_timestamp_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}

/// Returns the current Unix timestamp in seconds.
pub fn current_unix_timestamp() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Returns true when `timestamp_ms` lies at least `age_ms` before `now_ms`.
pub fn is_older_than_unix_ms(timestamp_ms: u64, age_ms: u64, now_ms: u64) -> bool {
    now_ms.saturating_sub(timestamp_ms) >= age_ms
}

/// Formats a Unix millisecond timestamp as an RFC 3339 / ISO 8601 UTC string.
pub fn format_unix_ms_rfc3339(timestamp_ms: u64) -> String {
    let millis = i64::try_from(timestamp_ms).unwrap_or(i64::MAX);
    DateTime::<Utc>::from_timestamp_millis(millis)
        .unwrap_or_default()
        .to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parses an RFC 3339 timestamp into Unix milliseconds, clamping pre-epoch values to zero.
pub fn parse_rfc3339_unix_ms(raw: &str) -> Option<u64> {
    let parsed = DateTime::parse_from_rfc3339(raw.trim()).ok()?;
    Some(u64::try_from(parsed.timestamp_millis()).unwrap_or(0))
}

#[cfg(test)]
mod tests {
    use super::{format_unix_ms_rfc3339, is_older_than_unix_ms, parse_rfc3339_unix_ms};

    #[test]
    fn unit_rfc3339_formatting_round_trips_millisecond_precision() {
        let formatted = format_unix_ms_rfc3339(1_700_000_000_123);
        assert_eq!(formatted, "2023-11-14T22:13:20.123Z");
        assert_eq!(parse_rfc3339_unix_ms(&formatted), Some(1_700_000_000_123));
    }

    #[test]
    fn unit_rfc3339_parse_accepts_offsets_and_rejects_garbage() {
        assert_eq!(
            parse_rfc3339_unix_ms("2023-11-14T23:13:20+01:00"),
            Some(1_700_000_000_000)
        );
        assert_eq!(parse_rfc3339_unix_ms("yesterday"), None);
    }

    #[test]
    fn unit_age_check_is_inclusive_and_saturating() {
        assert!(is_older_than_unix_ms(1_000, 500, 1_500));
        assert!(!is_older_than_unix_ms(1_000, 501, 1_500));
        assert!(!is_older_than_unix_ms(2_000, 1, 1_000));
    }
}
