/// Time utilities for hourly bucketing
use chrono::{DateTime, TimeZone, Timelike, Utc};

/// Convert a zoned timestamp to UTC
pub fn normalize_to_utc<Tz: TimeZone>(ts: DateTime<Tz>) -> DateTime<Utc> {
    ts.with_timezone(&Utc)
}

/// Start of the UTC hour containing `ts`
pub fn truncate_to_hour(ts: DateTime<Utc>) -> DateTime<Utc> {
    let naive = ts
        .date_naive()
        .and_hms_opt(ts.hour(), 0, 0)
        .unwrap_or_else(|| ts.naive_utc());
    Utc.from_utc_datetime(&naive)
}

/// Milliseconds since the Unix epoch to an absolute UTC instant
pub fn from_epoch_millis(ms: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
}
