//! Utility functions that are typically used for one situation in multiple places.

use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Datelike, TimeZone, Timelike, Utc};

use crate::prelude::EngineError;

pub mod config;

/// The epoch since the UNIX epoch in ms.
#[must_use]
pub fn get_epoch_ms() -> u64 {
    let start = SystemTime::now();
    let since_the_epoch = start
        .duration_since(UNIX_EPOCH)
        .expect("Time went backwards");

    since_the_epoch.as_secs() * 1000 + u64::from(since_the_epoch.subsec_nanos()) / 1_000_000
}

/// Parse an exchange timestamp (RFC3339, nanosecond precision) into UTC.
///
/// # Errors
///
/// Will return [`EngineError::Invalid`] if the timestamp is malformed.
pub fn parse_rfc3339(value: &str) -> Result<DateTime<Utc>, EngineError> {
    Ok(DateTime::parse_from_rfc3339(value)?.with_timezone(&Utc))
}

/// Format the `YYYY-MM-DD/HH` suffix of an hourly bucket key.
#[must_use]
pub fn hour_suffix(t: DateTime<Utc>) -> String {
    format!(
        "{:04}-{:02}-{:02}/{:02}",
        t.year(),
        t.month(),
        t.day(),
        t.hour()
    )
}

/// Parse a `YYYY-MM-DD/HH` bucket suffix back into the start of that hour.
#[must_use]
pub fn parse_hour_suffix(suffix: &str) -> Option<DateTime<Utc>> {
    let (date, hour) = suffix.split_once('/')?;
    let mut date_parts = date.splitn(3, '-');
    let year: i32 = date_parts.next()?.parse().ok()?;
    let month: u32 = date_parts.next()?.parse().ok()?;
    let day: u32 = date_parts.next()?.parse().ok()?;
    let hour: u32 = hour.parse().ok()?;

    Utc.with_ymd_and_hms(year, month, day, hour, 0, 0).single()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hour_suffix_round_trips() {
        let t = Utc.with_ymd_and_hms(2024, 3, 7, 9, 0, 0).unwrap();
        assert_eq!(hour_suffix(t), "2024-03-07/09");
        assert_eq!(parse_hour_suffix("2024-03-07/09"), Some(t));

        // Any time within the hour maps to the hour's start key.
        let late = Utc.with_ymd_and_hms(2024, 3, 7, 9, 59, 59).unwrap();
        assert_eq!(parse_hour_suffix(&hour_suffix(late)), Some(t));
    }

    #[test]
    fn hour_suffix_rejects_garbage() {
        assert_eq!(parse_hour_suffix("not-a-key"), None);
        assert_eq!(parse_hour_suffix("2024-13-01/00"), None);
        assert_eq!(parse_hour_suffix("2024-01-01"), None);
    }
}
