//! Date parsing and formatting for sync payloads.
//!
//! Devices and relays in the wild emit dates in several shapes: full RFC 3339
//! from the apps, `datetime-local` form input (`2024-05-01T18:30`) from the web
//! client, and `2006-01-02 15:04:05` style strings from the relay's SQLite
//! defaults. [`parse_date`] accepts all of them; [`format_date`] always emits
//! RFC 3339 in UTC with second precision.

use chrono::{DateTime, Local, NaiveDateTime, SecondsFormat, TimeZone, Utc};

/// Formats carrying an explicit offset.
const OFFSET_FORMATS: &[&str] = &["%Y-%m-%dT%H:%M:%S%.f%z", "%Y-%m-%dT%H:%M:%S%z"];

/// Formats without an offset, interpreted in the device's local time zone.
const LOCAL_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
];

/// Parse a payload date string. Returns `None` (and logs) when no known format
/// matches, and silently for empty strings.
pub fn parse_date(input: &str) -> Option<DateTime<Utc>> {
    let input = input.trim();
    if input.is_empty() {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(input) {
        return Some(dt.with_timezone(&Utc));
    }

    // `datetime-local` values are minute precision and carry no zone; the web
    // client means UTC by them.
    if input.len() == 16 && input.contains('T') {
        if let Ok(naive) = NaiveDateTime::parse_from_str(input, "%Y-%m-%dT%H:%M") {
            return Some(naive.and_utc());
        }
    }

    for format in OFFSET_FORMATS {
        if let Ok(dt) = DateTime::parse_from_str(input, format) {
            return Some(dt.with_timezone(&Utc));
        }
    }

    for format in LOCAL_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(input, format) {
            if let Some(local) = Local.from_local_datetime(&naive).earliest() {
                return Some(local.with_timezone(&Utc));
            }
        }
    }

    log::warn!("Failed to parse date string {input:?}");
    None
}

/// Format a timestamp the way outbound payloads carry it, e.g. `2024-05-01T10:00:00Z`.
pub fn format_date(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Secs, true)
}
