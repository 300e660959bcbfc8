//! Key paths of every persisted record.

use chrono::{DateTime, Utc};

use crate::utils::{hour_suffix, parse_hour_suffix};

/// Prefix of job records.
pub const JOBS: &str = "/jobs/";
/// Prefix of limiter checkpoints.
pub const LIMITERS: &str = "/limiters/";
/// Prefix of looper checkpoints.
pub const LOOPERS: &str = "/loopers/";
/// Prefix of waller checkpoints.
pub const WALLERS: &str = "/wallers/";
/// Prefix of raw exchange order records.
pub const ORDERS: &str = "/coinbase/orders/";
/// Prefix of hourly filled-order buckets.
pub const FILLED: &str = "/coinbase/filled/";
/// Prefix of hourly candle buckets.
pub const CANDLES: &str = "/coinbase/candles/";

/// `/jobs/{uid}`
#[must_use]
pub fn job(uid: &str) -> String {
    format!("{JOBS}{uid}")
}

/// `/limiters/{uid}`
#[must_use]
pub fn limiter(uid: &str) -> String {
    format!("{LIMITERS}{uid}")
}

/// `/loopers/{uid}`
#[must_use]
pub fn looper(uid: &str) -> String {
    format!("{LOOPERS}{uid}")
}

/// `/wallers/{uid}`
#[must_use]
pub fn waller(uid: &str) -> String {
    format!("{WALLERS}{uid}")
}

/// `/coinbase/orders/{serverID}`
#[must_use]
pub fn order(server_id: &str) -> String {
    format!("{ORDERS}{server_id}")
}

/// `/coinbase/filled/YYYY-MM-DD/HH`
#[must_use]
pub fn filled_hour(t: DateTime<Utc>) -> String {
    format!("{FILLED}{}", hour_suffix(t))
}

/// `/coinbase/candles/YYYY-MM-DD/HH`
#[must_use]
pub fn candles_hour(t: DateTime<Utc>) -> String {
    format!("{CANDLES}{}", hour_suffix(t))
}

/// Recover the hour from a full bucket key with the given prefix.
#[must_use]
pub fn parse_hour_key(prefix: &str, key: &str) -> Option<DateTime<Utc>> {
    parse_hour_suffix(key.strip_prefix(prefix)?)
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn bucket_keys_round_trip() {
        let t = Utc.with_ymd_and_hms(2023, 11, 5, 17, 42, 1).unwrap();
        let hour = Utc.with_ymd_and_hms(2023, 11, 5, 17, 0, 0).unwrap();

        assert_eq!(filled_hour(t), "/coinbase/filled/2023-11-05/17");
        assert_eq!(parse_hour_key(FILLED, &filled_hour(t)), Some(hour));
        assert_eq!(parse_hour_key(CANDLES, &candles_hour(t)), Some(hour));
        assert_eq!(parse_hour_key(FILLED, "/jobs/abc"), None);
    }
}
