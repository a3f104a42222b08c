//! Duration helpers for window tokens such as `5m` or `1h`.

use once_cell::sync::Lazy;
use regex::Regex;

static LITERAL_WINDOW: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[0-9]+[mhdwy]s?").expect("valid window regex"));

/// Canonical placeholder for Grafana's auto-sized query interval.
pub const INTERVAL: &str = "$__interval";
/// Placeholder Grafana sizes for `rate`-style functions.
pub const RATE_INTERVAL: &str = "$__rate_interval";
/// Placeholder covering the whole dashboard time range.
pub const RANGE: &str = "$__range";

/// Parses `<int><unit>` where unit is one of `s|m|h|d|w`.
pub fn parse_seconds(raw: &str) -> Option<u64> {
    let raw = raw.trim().to_lowercase();
    let unit = raw.chars().last()?;
    let number_part = raw.strip_suffix(unit)?;
    if number_part.is_empty() || !number_part.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let value = number_part.parse::<u64>().ok()?;
    let multiplier = match unit {
        's' => 1,
        'm' => 60,
        'h' => 60 * 60,
        'd' => 24 * 60 * 60,
        'w' => 7 * 24 * 60 * 60,
        _ => return None,
    };

    value.checked_mul(multiplier)
}

/// Renders seconds using the largest unit that divides evenly (s, m or h).
pub fn format_seconds(seconds: u64) -> String {
    let (mins, rem) = (seconds / 60, seconds % 60);
    if rem != 0 || mins == 0 {
        return format!("{seconds}s");
    }
    let (hours, rem) = (mins / 60, mins % 60);
    if rem != 0 || hours == 0 {
        return format!("{mins}m");
    }
    format!("{hours}h")
}

/// Replaces literal windows (`5m`, `1h`) with the auto interval placeholder.
/// Second-granularity windows are left alone.
pub fn to_interval_placeholder(window: &str) -> String {
    LITERAL_WINDOW.replace_all(window, INTERVAL).into_owned()
}

/// Normalizes the aliases InfluxQL dashboards use for the auto interval.
pub fn normalize_window(raw: &str) -> String {
    let trimmed = raw.trim();
    match trimmed {
        "auto" | "$interval" | "$_interval" => INTERVAL.to_string(),
        other => other.to_string(),
    }
}
