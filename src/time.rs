use chrono::{Datelike, NaiveDate, TimeZone, Utc};

pub fn now_ms() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

pub fn now_s() -> i64 {
    now_ms() / 1000
}

/// UTC calendar date bucket for a unix-ms timestamp, e.g. "2026-08-02".
pub fn utc_day_bucket(ts_ms: i64) -> String {
    let Some(dt) = Utc.timestamp_millis_opt(ts_ms).single() else {
        return "1970-01-01".to_string();
    };
    format!("{:04}-{:02}-{:02}", dt.year(), dt.month(), dt.day())
}

/// Unix-ms of the next UTC midnight strictly after `ts_ms`.
pub fn next_utc_midnight_ms(ts_ms: i64) -> i64 {
    let Some(dt) = Utc.timestamp_millis_opt(ts_ms).single() else {
        return ts_ms + 86_400_000;
    };
    let next: NaiveDate = dt.date_naive().succ_opt().unwrap_or(dt.date_naive());
    match next.and_hms_opt(0, 0, 0) {
        Some(midnight) => Utc.from_utc_datetime(&midnight).timestamp_millis(),
        None => ts_ms + 86_400_000,
    }
}
