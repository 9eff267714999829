//! Small shared helpers.

use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall-clock time in milliseconds since the Unix epoch.
pub(crate) fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as i64)
        .unwrap_or(0)
}

/// Parse a fractional-seconds header value into milliseconds.
///
/// `"5.250"` is 5250 ms. Absent or malformed values are 0.
pub(crate) fn seconds_to_ms(input: Option<&str>) -> i64 {
    input
        .and_then(|value| value.parse::<f64>().ok())
        .map(|seconds| (seconds * 1000.0) as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seconds_to_ms() {
        assert_eq!(seconds_to_ms(Some("5.250")), 5250);
        assert_eq!(seconds_to_ms(Some("2")), 2000);
        assert_eq!(seconds_to_ms(Some("bogus")), 0);
        assert_eq!(seconds_to_ms(None), 0);
    }

    #[test]
    fn test_now_ms_is_recent() {
        // Sanity bound: after 2020-01-01.
        assert!(now_ms() > 1_577_836_800_000);
    }
}
