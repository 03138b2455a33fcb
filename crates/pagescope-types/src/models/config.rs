//! Proxy instance configuration.

use serde::{Deserialize, Serialize};

/// Configuration for a single proxy instance.
///
/// A `port` of `-1` means "derive a stable default from the target URL":
/// `10000 + fnv1a32(target_url) % 50000`, so the same target always lands
/// on the same local port across runs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProxyConfig {
    /// Opaque instance id, unique within a registry
    pub id: String,
    /// Target origin to forward to, e.g. `http://localhost:3000`
    pub target_url: String,
    /// Local bind address
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// Preferred listen port; -1 derives a stable default from the target URL
    #[serde(default = "default_port")]
    pub port: i32,
    /// Working directory this proxy is associated with
    #[serde(default)]
    pub working_dir: String,
    /// Public URL when a tunnel is attached (rewrites point here instead of localhost)
    #[serde(default)]
    pub public_url: Option<String>,
    /// Restart the serve loop after a crash
    #[serde(default = "default_true")]
    pub auto_restart: bool,
    /// Maximum restarts allowed within the restart window
    #[serde(default = "default_max_restarts")]
    pub max_restarts: usize,
    /// Sliding window for the restart budget, in seconds
    #[serde(default = "default_restart_window_secs")]
    pub restart_window_secs: u64,
    /// Page sessions idle longer than this are considered inactive
    #[serde(default = "default_session_timeout_secs")]
    pub session_timeout_secs: u64,
    /// Maximum number of tracked page sessions; oldest evicted beyond this
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    /// Capacity of the in-memory traffic log ring
    #[serde(default = "default_traffic_log_capacity")]
    pub traffic_log_capacity: usize,
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> i32 {
    -1
}

fn default_true() -> bool {
    true
}

fn default_max_restarts() -> usize {
    5
}

fn default_restart_window_secs() -> u64 {
    60
}

fn default_session_timeout_secs() -> u64 {
    300
}

fn default_max_sessions() -> usize {
    100
}

fn default_traffic_log_capacity() -> usize {
    1000
}

impl ProxyConfig {
    /// Minimal config for a target with everything else defaulted.
    pub fn new(id: impl Into<String>, target_url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            target_url: target_url.into(),
            bind_address: default_bind_address(),
            port: default_port(),
            working_dir: String::new(),
            public_url: None,
            auto_restart: true,
            max_restarts: default_max_restarts(),
            restart_window_secs: default_restart_window_secs(),
            session_timeout_secs: default_session_timeout_secs(),
            max_sessions: default_max_sessions(),
            traffic_log_capacity: default_traffic_log_capacity(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_minimal_json() {
        let config: ProxyConfig = serde_json::from_str(
            r#"{"id": "p1", "target_url": "http://localhost:3000"}"#,
        )
        .unwrap();

        assert_eq!(config.bind_address, "127.0.0.1");
        assert_eq!(config.port, -1);
        assert!(config.auto_restart);
        assert_eq!(config.max_restarts, 5);
        assert_eq!(config.restart_window_secs, 60);
        assert_eq!(config.session_timeout_secs, 300);
        assert_eq!(config.max_sessions, 100);
    }
}
