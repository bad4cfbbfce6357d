//! Compact relative time labels for message lists.

use chrono::{DateTime, Datelike, Utc};
use duet_chat_types::Timestamp;

const MINUTE_MS: u64 = 60 * 1_000;
const HOUR_MS: u64 = 60 * MINUTE_MS;
const DAY_MS: u64 = 24 * HOUR_MS;
const WEEK_MS: u64 = 7 * DAY_MS;

/// Label `at` relative to `now`.
///
/// `"now"` under a minute, then whole minutes (`"5m"`), hours (`"3h"`) and
/// days (`"2d"`) up to a week. Older messages show the UTC date, `"Mar 4"`,
/// with the year appended when it differs from the current one. Timestamps
/// in the future read as `"now"`.
pub fn relative_label(at: Timestamp, now: Timestamp) -> String {
    let age = at.millis_until(now);
    if age < MINUTE_MS {
        return "now".to_string();
    }
    if age < HOUR_MS {
        return format!("{}m", age / MINUTE_MS);
    }
    if age < DAY_MS {
        return format!("{}h", age / HOUR_MS);
    }
    if age < WEEK_MS {
        return format!("{}d", age / DAY_MS);
    }

    match (to_utc(at), to_utc(now)) {
        (Some(at), Some(now)) if at.year() == now.year() => at.format("%b %-d").to_string(),
        (Some(at), _) => at.format("%b %-d, %Y").to_string(),
        _ => format!("{}d", age / DAY_MS),
    }
}

fn to_utc(ts: Timestamp) -> Option<DateTime<Utc>> {
    let millis = i64::try_from(ts.as_millis()).ok()?;
    DateTime::from_timestamp_millis(millis)
}
