use chrono::{DateTime, SecondsFormat, Utc};

/// Returns the current time as milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Format epoch milliseconds as RFC 3339 UTC with millisecond precision and a `Z` suffix,
/// e.g. `2026-03-01T12:30:05.123Z`.
pub fn rfc3339_ms(ms: u64) -> String {
    let dt = DateTime::<Utc>::from_timestamp_millis(ms as i64).unwrap_or_default();
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Current time formatted with [`rfc3339_ms`].
pub fn now_rfc3339_ms() -> String {
    rfc3339_ms(now_ms())
}
