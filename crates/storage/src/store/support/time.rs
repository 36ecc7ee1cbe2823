#![forbid(unsafe_code)]

use chrono::{DateTime, Utc};

#[derive(Debug, thiserror::Error)]
#[error("timestamp out of range: {0}ms")]
pub(in crate::store) struct TimestampOutOfRange(pub i64);

pub(in crate::store) fn now_ms() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};

    let now = match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(duration) => duration,
        Err(_) => return 0,
    };

    i64::try_from(now.as_millis()).unwrap_or(i64::MAX)
}

pub(in crate::store) fn seconds_to_ms(seconds: u64) -> i64 {
    i64::try_from(seconds.saturating_mul(1_000)).unwrap_or(i64::MAX)
}

pub(in crate::store) fn ms_to_dt(ms: i64) -> Result<DateTime<Utc>, TimestampOutOfRange> {
    DateTime::<Utc>::from_timestamp_millis(ms).ok_or(TimestampOutOfRange(ms))
}

pub(in crate::store) fn dt_to_ms(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}
