//! Timestamp helpers shared by storage, protocol DTOs, and the detection
//! pipeline's temporal smoother.

/// Returns the current Unix timestamp in seconds.
pub fn now_timestamp() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Returns the current Unix timestamp in milliseconds.
pub fn now_timestamp_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Returns the current instant as an RFC 3339 UTC string, for DTOs that
/// carry a human-inspectable `*Utc` field.
pub fn now_iso8601() -> String {
    chrono::Utc::now().to_rfc3339()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_timestamp_is_reasonable() {
        let ts = now_timestamp();
        assert!(ts > 1_704_067_200, "timestamp {} is too old", ts);
        assert!(ts < 4_102_444_800, "timestamp {} is too far in future", ts);
    }

    #[test]
    fn test_now_timestamp_millis_is_reasonable() {
        let ts = now_timestamp_millis();
        assert!(ts > 1_704_067_200_000);
    }

    #[test]
    fn test_now_iso8601_parses() {
        let s = now_iso8601();
        assert!(chrono::DateTime::parse_from_rfc3339(&s).is_ok());
    }
}
