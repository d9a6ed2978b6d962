//! Small shared helpers used across components.

use chrono::{DateTime, Utc};

/// Current UTC time in milliseconds since the epoch.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Formats a millisecond timestamp for logs and error messages.
pub fn format_timestamp_ms(timestamp_ms: i64) -> String {
    match DateTime::<Utc>::from_timestamp_millis(timestamp_ms) {
        Some(dt) => dt.format("%Y-%m-%d %H:%M:%S%.3f UTC").to_string(),
        None => format!("invalid timestamp {timestamp_ms}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_known_timestamp() {
        assert_eq!(format_timestamp_ms(1_700_000_000_000), "2023-11-14 22:13:20.000 UTC");
    }

    #[test]
    fn now_ms_is_plausible() {
        // sanity bound: some time after this crate was written.
        assert!(now_ms() > 1_700_000_000_000);
    }
}
