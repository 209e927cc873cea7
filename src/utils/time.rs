use chrono::{DateTime, Duration, Utc};

pub fn time_millis() -> i64 {
    let time: DateTime<Utc> = Utc::now();
    time.timestamp_millis()
}

/// Now plus `millis`, saturating on overflow.
pub fn after_millis(millis: u64) -> DateTime<Utc> {
    let delta = Duration::try_milliseconds(millis.min(i64::MAX as u64) as i64).unwrap_or(Duration::MAX);
    Utc::now().checked_add_signed(delta).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// `secs` as a chrono duration, `None` when chrono cannot represent it.
pub fn try_secs(secs: u64) -> Option<Duration> {
    i64::try_from(secs).ok().and_then(Duration::try_seconds)
}

/// `at` minus `secs`, saturating at the earliest representable instant.
pub fn before_secs(
    at: DateTime<Utc>,
    secs: u64,
) -> DateTime<Utc> {
    try_secs(secs).and_then(|delta| at.checked_sub_signed(delta)).unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Milliseconds elapsed since `since`, zero when `since` lies in the future.
pub fn elapsed_millis(since: DateTime<Utc>) -> u64 {
    (Utc::now() - since).num_milliseconds().max(0) as u64
}
