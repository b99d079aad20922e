//! Client configuration.

use std::path::PathBuf;
use std::time::Duration;

pub const API_URL_ENV: &str = "CTF_API_URL";
pub const CREDENTIALS_ENV: &str = "CTF_CREDENTIALS";

pub const DEFAULT_API_URL: &str = "http://127.0.0.1:8080";

/// Reconciliation poll period while a container is active.
pub const POLL_INTERVAL_SECS: u64 = 60;
/// Countdown refresh period.
pub const TICK_INTERVAL_SECS: u64 = 1;

/// Where and how the client reaches the platform.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub base_url: String,
    /// `None` leaves the transport default in place.
    pub request_timeout: Option<Duration>,
}

impl ClientConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: normalize_base_url(&base_url.into()),
            request_timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::new(DEFAULT_API_URL)
    }
}

/// Timer periods for the container tracker.
#[derive(Debug, Clone, Copy)]
pub struct TrackerSettings {
    pub poll_interval: Duration,
    pub tick_interval: Duration,
}

impl Default for TrackerSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(POLL_INTERVAL_SECS),
            tick_interval: Duration::from_secs(TICK_INTERVAL_SECS),
        }
    }
}

/// Default location of the saved login: `~/.ctf-practice/credentials.json`,
/// or the working directory when no home directory is known.
pub fn default_credentials_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".ctf-practice")
        .join("credentials.json")
}

fn normalize_base_url(raw: &str) -> String {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        DEFAULT_API_URL.to_string()
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_is_normalized() {
        assert_eq!(ClientConfig::new("http://ctf.local:8080/").base_url, "http://ctf.local:8080");
        assert_eq!(ClientConfig::new("  ").base_url, DEFAULT_API_URL);
    }

    #[test]
    fn endpoint_joins_paths() {
        let config = ClientConfig::new("http://ctf.local");
        assert_eq!(config.endpoint("/api/login"), "http://ctf.local/api/login");
        assert_eq!(config.endpoint("api/login"), "http://ctf.local/api/login");
    }

    #[test]
    fn tracker_defaults_match_platform_cadence() {
        let settings = TrackerSettings::default();
        assert_eq!(settings.poll_interval, Duration::from_secs(60));
        assert_eq!(settings.tick_interval, Duration::from_secs(1));
    }

    #[test]
    fn credentials_live_under_dot_directory() {
        let path = default_credentials_path();
        assert!(path.ends_with(".ctf-practice/credentials.json"));
    }
}
