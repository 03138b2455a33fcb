//! Traffic log entry types.
//!
//! Every entry in the traffic log is one of these payloads wrapped with a
//! per-proxy monotonic id and a timestamp. HTTP exchanges come from the
//! proxy pipeline; everything else arrives over the control channel from
//! the instrumented page.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One record in the bounded traffic log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrafficEntry {
    /// Monotonically increasing id, scoped per proxy
    pub id: u64,
    /// Unix milliseconds
    pub timestamp: i64,
    #[serde(flatten)]
    pub payload: TrafficPayload,
}

impl TrafficEntry {
    pub fn kind(&self) -> TrafficKind {
        self.payload.kind()
    }
}

/// Discriminant for querying the log by entry kind.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TrafficKind {
    Http,
    FrontendError,
    Performance,
    CustomLog,
    Screenshot,
    Execution,
    Interaction,
    Mutation,
    PanelMessage,
    Sketch,
    DesignState,
    DesignRequest,
    DesignChat,
}

/// Tagged union over everything the proxy records.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TrafficPayload {
    Http(HttpExchange),
    FrontendError(FrontendErrorData),
    Performance(PerformanceData),
    CustomLog(CustomLogData),
    Screenshot(ScreenshotData),
    Execution(ExecutionResult),
    Interaction(InteractionData),
    Mutation(MutationData),
    PanelMessage(PanelMessageData),
    Sketch(SketchData),
    DesignState(DesignStateData),
    DesignRequest(DesignRequestData),
    DesignChat(DesignChatData),
}

impl TrafficPayload {
    pub fn kind(&self) -> TrafficKind {
        match self {
            Self::Http(_) => TrafficKind::Http,
            Self::FrontendError(_) => TrafficKind::FrontendError,
            Self::Performance(_) => TrafficKind::Performance,
            Self::CustomLog(_) => TrafficKind::CustomLog,
            Self::Screenshot(_) => TrafficKind::Screenshot,
            Self::Execution(_) => TrafficKind::Execution,
            Self::Interaction(_) => TrafficKind::Interaction,
            Self::Mutation(_) => TrafficKind::Mutation,
            Self::PanelMessage(_) => TrafficKind::PanelMessage,
            Self::Sketch(_) => TrafficKind::Sketch,
            Self::DesignState(_) => TrafficKind::DesignState,
            Self::DesignRequest(_) => TrafficKind::DesignRequest,
            Self::DesignChat(_) => TrafficKind::DesignChat,
        }
    }
}

/// One proxied HTTP transaction, as recorded in the log.
///
/// Bodies are capped: request bodies are only captured when Content-Length
/// is known and under 10 KiB; response bodies record at most the first
/// 10 KiB of what actually went to the client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct HttpExchange {
    /// Per-proxy request sequence id, `req-<N>`
    pub request_id: String,
    pub method: String,
    /// Client-facing URL (proxy host)
    pub url: String,
    pub request_headers: HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_body: Option<String>,
    pub status: u16,
    pub response_headers: HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_body: Option<String>,
    /// Total response bytes delivered to the client
    pub response_bytes: u64,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// True when a chaos rule shaped or synthesized this exchange
    #[serde(default)]
    pub chaos_injected: bool,
}

/// An uncaught error reported by the instrumented page.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct FrontendErrorData {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub column: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// Navigation-timing snapshot from the page.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct PerformanceData {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dom_content_loaded_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub load_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_paint_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_contentful_paint_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Full payload as sent by the page
    #[serde(default)]
    pub raw: serde_json::Value,
}

/// console-style log line forwarded from the page.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct CustomLogData {
    #[serde(default)]
    pub level: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// Screenshot (or element/sketch capture) reference.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ScreenshotData {
    /// What produced this capture: screenshot, screenshot_capture,
    /// element_capture or sketch_capture
    #[serde(default)]
    pub capture_kind: String,
    /// data: URL as delivered by the page
    pub data_url: String,
    /// Decoded payload size, for display without decoding again
    #[serde(default)]
    pub byte_len: usize,
}

/// Result of an `execute` directive, correlated by `exec_id`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ExecutionResult {
    pub exec_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// One user interaction (click, input, scroll, …).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct InteractionData {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selector: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub x: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub y: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// One DOM mutation batch entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct MutationData {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selector: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// Free-form message from a devtool panel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct PanelMessageData {
    #[serde(default)]
    pub panel: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// Sketch overlay data from the page.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct SketchData {
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// Design-mode state snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct DesignStateData {
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// Design-mode request from the page.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct DesignRequestData {
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// Design-mode chat message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct DesignChatData {
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// Aggregate counters kept alongside the log.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
pub struct TrafficStats {
    pub total_requests: u64,
    pub success_count: u64,
    pub error_count: u64,
    pub chaos_injected_count: u64,
    pub telemetry_count: u64,
}
