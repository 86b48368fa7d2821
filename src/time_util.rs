use chrono::{DateTime, TimeZone, Utc};

/// Epoch milliseconds to a UTC timestamp. Out-of-range values clamp to the epoch.
pub fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

pub fn to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

/// Parse a chat timestamp of the form `"1700000000.000200"` (seconds with a
/// microsecond suffix). The suffix keeps messages within one second unique,
/// so callers keep the raw string as the message id.
pub fn parse_chat_ts(ts: &str) -> Option<DateTime<Utc>> {
    let (secs, frac) = match ts.split_once('.') {
        Some((s, f)) => (s, f),
        None => (ts, "0"),
    };
    let secs: i64 = secs.parse().ok()?;
    let mut micros = String::from(frac);
    micros.truncate(6);
    while micros.len() < 6 {
        micros.push('0');
    }
    let micros: i64 = micros.parse().ok()?;
    let total = secs.checked_mul(1_000_000)?.checked_add(micros)?;
    Utc.timestamp_micros(total).single()
}

/// Render a timestamp in the chat format, for read markers.
pub fn format_chat_ts(ts: DateTime<Utc>) -> String {
    let micros = ts.timestamp_micros();
    format!("{}.{:06}", micros.div_euclid(1_000_000), micros.rem_euclid(1_000_000))
}

/// Graph API times look like `2024-05-01T10:00:00+0000`; RFC 3339 is
/// accepted as well.
pub fn parse_graph_time(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%z")
        .or_else(|_| DateTime::parse_from_rfc3339(s))
        .ok()
        .map(|d| d.with_timezone(&Utc))
}
