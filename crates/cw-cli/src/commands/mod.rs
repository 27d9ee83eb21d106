pub mod daemon;
pub mod tasks;

use std::time::Duration;

use cw_core::types::datetime_from_epoch;

/// Render an epoch timestamp for humans; `-` when absent.
pub fn format_epoch(secs: Option<i64>) -> String {
    secs.and_then(datetime_from_epoch)
        .map(|dt| dt.format("%Y-%m-%d %H:%M UTC").to_string())
        .unwrap_or_else(|| "-".to_string())
}

pub fn format_uptime(uptime: Duration) -> String {
    let secs = uptime.as_secs();
    let (days, rem) = (secs / 86_400, secs % 86_400);
    let (hours, rem) = (rem / 3_600, rem % 3_600);
    let (mins, secs) = (rem / 60, rem % 60);
    if days > 0 {
        format!("{days}d {hours}h {mins}m")
    } else if hours > 0 {
        format!("{hours}h {mins}m")
    } else {
        format!("{mins}m {secs}s")
    }
}
