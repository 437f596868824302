//! Human-readable rendering helpers for the admin view and log lines.

use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};

/// Compact duration: `850ms`, `12.3s`, `4m 05s`, `2h 03m`, `3d 04h`.
pub fn duration(d: Duration) -> String {
    let ms = d.as_millis();
    if ms < 1_000 {
        return format!("{ms}ms");
    }
    let secs = d.as_secs();
    if secs < 60 {
        // One decimal, truncated so 59.99s never renders as "60.0s".
        let tenths = (ms / 100) % 10;
        return format!("{secs}.{tenths}s");
    }
    if secs < 3_600 {
        return format!("{}m {:02}s", secs / 60, secs % 60);
    }
    if secs < 86_400 {
        return format!("{}h {:02}m", secs / 3_600, (secs % 3_600) / 60);
    }
    format!("{}d {:02}h", secs / 86_400, (secs % 86_400) / 3_600)
}

/// Duration from milliseconds, the unit the metrics cells store.
pub fn millis(ms: u64) -> String {
    duration(Duration::from_millis(ms))
}

/// RFC 3339 with millisecond precision, always UTC (`Z`).
pub fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Non-negative span between two instants; `None` if `later` is before `earlier`.
pub fn span(earlier: DateTime<Utc>, later: DateTime<Utc>) -> Option<Duration> {
    (later - earlier).to_std().ok()
}
