//! Event-time parsing and correction helpers.
//!
//! The upstream API mixes epoch-millisecond integers with ISO-8601 text in
//! its time fields, and some historical resources carry a local UTC offset
//! on values that are actually UTC. Everything internal works in f64 epoch
//! seconds.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::Value;

/// Current wall-clock time in epoch seconds.
pub fn now_secs() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Epoch values above this are interpreted as milliseconds.
const MILLIS_CUTOVER: f64 = 100_000_000_000.0;

/// Convert an event-time value to epoch seconds.
///
/// Accepts epoch seconds or milliseconds as numbers (or numeric text), and
/// ISO-8601 text with or without an offset. Returns `None` for anything
/// else, including JSON null.
pub fn event_secs(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64().map(normalize_epoch),
        Value::String(s) => {
            if let Ok(n) = s.parse::<f64>() {
                return Some(normalize_epoch(n));
            }
            parse_iso(s).map(|dt| dt.timestamp_millis() as f64 / 1000.0)
        }
        _ => None,
    }
}

fn normalize_epoch(n: f64) -> f64 {
    if n > MILLIS_CUTOVER { n / 1000.0 } else { n }
}

fn parse_iso(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f%z", "%Y-%m-%d %H:%M:%S%.f%z"] {
        if let Ok(dt) = DateTime::parse_from_str(s, fmt) {
            return Some(dt.with_timezone(&Utc));
        }
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(naive.and_utc());
        }
    }
    None
}

/// Correct a timestamp whose offset suffix mislabels a UTC value.
///
/// Fields declared as corrected timestamps carry wall-clock UTC digits with
/// a bogus local offset appended. The fix drops the offset and re-labels
/// the same digits as UTC. Values that fail to parse pass through verbatim.
pub fn fix_utc_offset(s: &str) -> String {
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f%z", "%Y-%m-%d %H:%M:%S%.f%z"] {
        if let Ok(dt) = DateTime::parse_from_str(s, fmt) {
            return dt
                .naive_local()
                .and_utc()
                .format("%Y-%m-%dT%H:%M:%S%.3f+00:00")
                .to_string();
        }
    }
    s.to_string()
}
