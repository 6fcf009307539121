//! Timestamp helpers for manifest `modified_on` values and activity records.

use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, SecondsFormat, Utc};

/// Format seconds since the Unix epoch as an ISO-8601 UTC timestamp.
///
/// Sub-second precision is kept to microseconds. Values that cannot be
/// represented fall back to the epoch.
///
/// # Arguments
/// * `timestamp` - Seconds since the epoch, possibly fractional
pub fn float_to_iso_datetime_string(timestamp: f64) -> String {
    let secs: i64 = timestamp.floor() as i64;
    let micros: u32 = ((timestamp - timestamp.floor()) * 1_000_000.0).round() as u32;
    let nanos: u32 = micros.min(999_999) * 1_000;
    let datetime: DateTime<Utc> = DateTime::<Utc>::from_timestamp(secs, nanos).unwrap_or_default();
    datetime.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Format a file's modification time for the manifest.
pub fn system_time_to_iso_string(time: SystemTime) -> String {
    let secs: f64 = match time.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_secs_f64(),
        Err(e) => -e.duration().as_secs_f64(),
    };
    float_to_iso_datetime_string(secs)
}

/// Current time as an ISO-8601 UTC timestamp.
pub fn now_iso_string() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Current Unix timestamp in seconds.
pub fn current_epoch_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_float_to_iso_epoch() {
        assert_eq!(float_to_iso_datetime_string(0.0), "1970-01-01T00:00:00.000000Z");
    }

    #[test]
    fn test_float_to_iso_fractional() {
        assert_eq!(
            float_to_iso_datetime_string(1_700_000_000.25),
            "2023-11-14T22:13:20.250000Z"
        );
    }

    #[test]
    fn test_system_time_matches_float() {
        let time: SystemTime = UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        assert_eq!(
            system_time_to_iso_string(time),
            float_to_iso_datetime_string(1_700_000_000.0)
        );
    }

    #[test]
    fn test_current_epoch_seconds_nonzero() {
        assert!(current_epoch_seconds() > 1_600_000_000);
    }
}
