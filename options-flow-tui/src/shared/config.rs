//! Environment-driven settings for the dashboard binary

use crate::shared::series::RetentionPolicy;
use chrono::Duration as ChronoDuration;
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

pub const DEFAULT_BACKEND_URL: &str = "http://127.0.0.1:30080";

#[derive(Debug, Clone, PartialEq)]
pub struct DashboardConfig {
    /// Base URL of the REST snapshot endpoints
    pub backend_url: String,
    /// Endpoint returning the hub URL and access token
    pub negotiate_url: String,
    /// Hours of flow history requested at startup
    pub snapshot_hours: u32,
    pub retention: RetentionPolicy,
    /// Directory for persisted state; platform data dir when unset
    pub store_dir: Option<PathBuf>,
    pub persist: bool,
    pub simulate: bool,
    pub log_file: PathBuf,
    pub persist_interval: Duration,
    pub redraw_interval: Duration,
}

impl Default for DashboardConfig {
    fn default() -> Self {
        let backend_url = DEFAULT_BACKEND_URL.to_string();
        Self {
            negotiate_url: default_negotiate(&backend_url),
            backend_url,
            snapshot_hours: 4,
            retention: RetentionPolicy::default(),
            store_dir: None,
            persist: true,
            simulate: false,
            log_file: PathBuf::from("flow-monitor.log"),
            persist_interval: Duration::from_secs(10),
            redraw_interval: Duration::from_secs(2),
        }
    }
}

fn default_negotiate(backend: &str) -> String {
    format!("{}/negotiate", backend.trim_end_matches('/'))
}

impl DashboardConfig {
    /// Read every `FLOW_*` variable from the process environment
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable lookup. Unset or unparsable values keep their default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();

        let backend_url = lookup("FLOW_BACKEND_URL")
            .map(|v| v.trim().to_string())
            .filter(|v| Url::parse(v).is_ok())
            .unwrap_or(defaults.backend_url);

        let negotiate_url = lookup("FLOW_NEGOTIATE_URL")
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| default_negotiate(&backend_url));

        Self {
            negotiate_url,
            backend_url,
            snapshot_hours: lookup("FLOW_SNAPSHOT_HOURS")
                .and_then(|v| v.trim().parse().ok())
                .filter(|h| *h > 0)
                .unwrap_or(defaults.snapshot_hours),
            retention: lookup("FLOW_RETENTION")
                .and_then(|v| parse_retention(&v))
                .unwrap_or(defaults.retention),
            store_dir: lookup("FLOW_STORE_DIR")
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from),
            persist: lookup("FLOW_PERSIST")
                .and_then(|v| parse_flag(&v))
                .unwrap_or(defaults.persist),
            simulate: lookup("FLOW_SIMULATE")
                .and_then(|v| parse_flag(&v))
                .unwrap_or(defaults.simulate),
            log_file: lookup("FLOW_LOG_FILE")
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from)
                .unwrap_or(defaults.log_file),
            persist_interval: defaults.persist_interval,
            redraw_interval: defaults.redraw_interval,
        }
    }

    pub fn with_backend_url(mut self, url: impl Into<String>) -> Self {
        self.backend_url = url.into();
        self.negotiate_url = default_negotiate(&self.backend_url);
        self
    }

    pub fn with_retention(mut self, retention: RetentionPolicy) -> Self {
        self.retention = retention;
        self
    }

    pub fn with_store_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.store_dir = Some(dir.into());
        self
    }

    pub fn with_persist(mut self, persist: bool) -> Self {
        self.persist = persist;
        self
    }

    pub fn with_simulate(mut self, simulate: bool) -> Self {
        self.simulate = simulate;
        self
    }
}

/// `4h`, `90m`, `300s` are windows; a bare number is a sample cap
pub fn parse_retention(raw: &str) -> Option<RetentionPolicy> {
    let raw = raw.trim().to_ascii_lowercase();
    let (digits, unit) = match raw.char_indices().last()? {
        (i, c) if c.is_ascii_alphabetic() => (&raw[..i], Some(c)),
        _ => (raw.as_str(), None),
    };
    let value: i64 = digits.trim().parse().ok().filter(|v| *v > 0)?;

    match unit {
        None => Some(RetentionPolicy::MaxSamples(value as usize)),
        Some('h') => Some(RetentionPolicy::Window(ChronoDuration::hours(value))),
        Some('m') => Some(RetentionPolicy::Window(ChronoDuration::minutes(value))),
        Some('s') => Some(RetentionPolicy::Window(ChronoDuration::seconds(value))),
        Some(_) => None,
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_when_unset() {
        let config = DashboardConfig::from_lookup(|_| None);
        assert_eq!(config, DashboardConfig::default());
        assert_eq!(config.negotiate_url, "http://127.0.0.1:30080/negotiate");
        assert_eq!(config.retention, RetentionPolicy::Window(ChronoDuration::hours(4)));
        assert!(config.persist);
        assert!(!config.simulate);
    }

    #[test]
    fn test_from_lookup() {
        let config = DashboardConfig::from_lookup(lookup_from(&[
            ("FLOW_BACKEND_URL", "https://flow.example.com"),
            ("FLOW_SNAPSHOT_HOURS", "6"),
            ("FLOW_RETENTION", "480"),
            ("FLOW_PERSIST", "0"),
            ("FLOW_SIMULATE", "yes"),
            ("FLOW_STORE_DIR", "/tmp/flow"),
        ]));

        assert_eq!(config.backend_url, "https://flow.example.com");
        assert_eq!(config.negotiate_url, "https://flow.example.com/negotiate");
        assert_eq!(config.snapshot_hours, 6);
        assert_eq!(config.retention, RetentionPolicy::MaxSamples(480));
        assert!(!config.persist);
        assert!(config.simulate);
        assert_eq!(config.store_dir, Some(PathBuf::from("/tmp/flow")));
    }

    #[test]
    fn test_bad_values_keep_defaults() {
        let config = DashboardConfig::from_lookup(lookup_from(&[
            ("FLOW_BACKEND_URL", "not a url"),
            ("FLOW_SNAPSHOT_HOURS", "0"),
            ("FLOW_RETENTION", "4w"),
            ("FLOW_PERSIST", "maybe"),
        ]));
        assert_eq!(config, DashboardConfig::default());
    }

    #[test]
    fn test_parse_retention() {
        struct TestCase {
            input: &'static str,
            expected: Option<RetentionPolicy>,
        }

        let tests = vec![
            TestCase {
                // TC0: hours window
                input: "4h",
                expected: Some(RetentionPolicy::Window(ChronoDuration::hours(4))),
            },
            TestCase {
                // TC1: minutes window, whitespace and case tolerated
                input: " 90M ",
                expected: Some(RetentionPolicy::Window(ChronoDuration::minutes(90))),
            },
            TestCase {
                // TC2: bare count
                input: "121",
                expected: Some(RetentionPolicy::MaxSamples(121)),
            },
            TestCase {
                // TC3: zero rejected
                input: "0h",
                expected: None,
            },
            TestCase {
                // TC4: garbage rejected
                input: "h",
                expected: None,
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            assert_eq!(parse_retention(test.input), test.expected, "TC{} failed", index);
        }
    }
}
