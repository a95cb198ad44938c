//! Duration strings in the `1h30m` / `15m` / `500ms` form used by schedules,
//! light delays and config files.
//!
//! Parsing goes through `humantime`; stored fields use `humantime_serde`.
//! `format_duration` renders the compact unit-run form controllers and
//! notification messages expect (`1h30m`, never `1h 30m`).

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid duration {input:?}: {reason}")]
pub struct ParseDurationError {
    pub input: String,
    pub reason: String,
}

/// Parse a duration string. A bare `0` is accepted.
pub fn parse_duration(input: &str) -> Result<Duration, ParseDurationError> {
    let s = input.trim();
    if s == "0" {
        return Ok(Duration::ZERO);
    }
    humantime::parse_duration(s).map_err(|e| ParseDurationError {
        input: input.to_string(),
        reason: e.to_string(),
    })
}

/// Format a duration as concatenated `h`, `m`, `s`, `ms` runs.
pub fn format_duration(d: Duration) -> String {
    if d.is_zero() {
        return "0s".to_string();
    }

    let mut out = String::new();
    let secs = d.as_secs();
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    let ms = d.subsec_millis();

    if h > 0 {
        out.push_str(&format!("{h}h"));
    }
    if m > 0 {
        out.push_str(&format!("{m}m"));
    }
    if s > 0 {
        out.push_str(&format!("{s}s"));
    }
    if ms > 0 {
        out.push_str(&format!("{ms}ms"));
    }
    out
}
