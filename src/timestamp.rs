//! Server timestamp parsing and countdown formatting.

use crate::error::ApiError;
use chrono::{DateTime, NaiveDateTime, Utc};
use std::fmt;

const NAIVE_FORMATS: [&str; 4] = [
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S",
];

/// Parse a timestamp issued by the platform.
///
/// The platform sometimes omits the zone designator. Such values are UTC,
/// never local time. This mirrors what the web front-end does by appending
/// `Z`; it works around an inconsistent upstream API and should go away
/// once the server always emits RFC 3339.
pub fn parse_server_time(raw: &str) -> Result<DateTime<Utc>, ApiError> {
    let raw = raw.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Ok(parsed.with_timezone(&Utc));
    }

    let naive = raw.strip_suffix('Z').unwrap_or(raw);
    NAIVE_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(naive, format).ok())
        .map(|parsed| parsed.and_utc())
        .ok_or_else(|| ApiError::malformed(format!("unparseable timestamp {raw:?}")))
}

/// Time left on a container, clamped at zero and shown as `HH:MM:SS`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Countdown {
    secs: i64,
}

impl Countdown {
    pub const ZERO: Countdown = Countdown { secs: 0 };

    pub fn between(now: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        let millis = (end - now).num_milliseconds();
        Self {
            secs: (millis / 1000).max(0),
        }
    }

    pub fn as_secs(&self) -> i64 {
        self.secs
    }

    pub fn is_zero(&self) -> bool {
        self.secs == 0
    }
}

impl fmt::Display for Countdown {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hours = self.secs / 3600;
        let minutes = (self.secs % 3600) / 60;
        let seconds = self.secs % 60;
        write!(f, "{hours:02}:{minutes:02}:{seconds:02}")
    }
}
