//! Chaos rule configuration.
//!
//! A rule matches requests by URL pattern and method, fires with a
//! configured probability, and carries kind-specific parameters. Rules are
//! evaluated per request; request-side kinds perturb the upstream
//! round-trip, response-side kinds shape the bytes streamed back to the
//! client.

use serde::{Deserialize, Serialize};

/// What a chaos rule does when it fires.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ChaosRuleKind {
    /// Sleep before contacting the origin
    Latency,
    /// Same as latency; used to simulate a stale cache tier
    StaleLatency,
    /// Fail the request without contacting the origin
    PacketLoss,
    /// Hold concurrent requests and release them in random order
    Reorder,
    /// Pace the response body at a configured byte rate
    SlowDrip,
    /// Cut the connection mid-body
    ConnectionDrop,
    /// Silently stop forwarding body bytes past a cap
    Truncation,
    /// Answer with a synthetic HTTP error, origin never contacted
    HttpError,
}

/// A single pattern-matched chaos directive.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChaosRule {
    pub kind: ChaosRuleKind,
    /// Substring match, or glob when the pattern contains `*`
    pub pattern: String,
    /// Restrict to one HTTP method; empty matches all
    #[serde(default)]
    pub method: Option<String>,
    /// Probability of firing, in [0, 1]
    #[serde(default = "default_probability")]
    pub probability: f64,

    // latency / stale-latency
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_ms: Option<u64>,

    // slow-drip
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bytes_per_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_size: Option<usize>,

    // connection-drop
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub drop_after_percent: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub drop_after_bytes: Option<u64>,

    // truncation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub truncate_percent: Option<f64>,

    // http-error
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,

    // reorder
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_hold: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_wait_ms: Option<u64>,
}

fn default_probability() -> f64 {
    1.0
}

impl ChaosRule {
    /// A rule of the given kind matching everything, probability 1.
    pub fn new(kind: ChaosRuleKind, pattern: impl Into<String>) -> Self {
        Self {
            kind,
            pattern: pattern.into(),
            method: None,
            probability: 1.0,
            delay_ms: None,
            bytes_per_ms: None,
            chunk_size: None,
            drop_after_percent: None,
            drop_after_bytes: None,
            truncate_percent: None,
            status: None,
            body: None,
            min_hold: None,
            max_wait_ms: None,
        }
    }
}
