//! Proxy-related errors.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur during proxy operations.
#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "details")]
pub enum ProxyError {
    /// Target origin URL could not be parsed or is unsupported
    #[error("Invalid target URL '{url}': {message}")]
    InvalidTarget { url: String, message: String },

    /// Public (tunnel) URL could not be parsed
    #[error("Invalid public URL '{url}': {message}")]
    InvalidPublicUrl { url: String, message: String },

    /// A proxy with this id already exists in the registry
    #[error("Proxy '{id}' already exists")]
    DuplicateId { id: String },

    /// Registry is shutting down and refuses new proxies
    #[error("Registry is shutting down")]
    ShuttingDown,

    /// No proxy registered under this id
    #[error("Proxy '{id}' not found")]
    NotFound { id: String },

    /// Listener could not be bound (other than the port-in-use fallback case)
    #[error("Failed to bind {addr}: {message}")]
    Bind { addr: String, message: String },

    /// Upstream origin is unreachable or the round-trip failed
    #[error("Upstream unavailable: {message}")]
    UpstreamUnavailable { message: String },

    /// A chaos rule produced a synthetic failure before the origin was contacted
    #[error("Chaos injection: simulated failure ({reason})")]
    ChaosInjected { reason: String },

    /// The request was canceled before completion
    #[error("Request canceled")]
    Canceled,

    /// A chaos rule dropped the connection mid-stream
    #[error("Connection dropped by chaos injection")]
    ConnectionDropped,

    /// executeJavaScript was called with no connected control channels
    #[error("No control-channel connections")]
    NoConnections,

    /// An execution directive received no result in time
    #[error("Execution '{id}' timed out")]
    ExecutionTimeout { id: String },

    /// The supervisor refused to restart a crashing serve loop
    #[error("max restarts exceeded: {count} within {window_secs}s")]
    MaxRestartsExceeded { count: usize, window_secs: u64 },

    /// Internal proxy error (bugs, unexpected states)
    #[error("Internal proxy error: {message}")]
    Internal { message: String },
}

impl ProxyError {
    /// Check if this error represents caller-side cancellation.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Canceled)
    }

    /// Check if this error was synthesized by chaos injection.
    pub fn is_chaos(&self) -> bool {
        matches!(self, Self::ChaosInjected { .. } | Self::ConnectionDropped)
    }

    /// Get HTTP status code for this error.
    pub fn http_status_code(&self) -> u16 {
        match self {
            Self::InvalidTarget { .. } | Self::InvalidPublicUrl { .. } => 400,
            Self::DuplicateId { .. } => 409,
            Self::ShuttingDown => 503,
            Self::NotFound { .. } => 404,
            Self::Bind { .. } => 500,
            Self::UpstreamUnavailable { .. } | Self::ChaosInjected { .. } => 502,
            Self::Canceled => 499,
            Self::ConnectionDropped => 502,
            Self::NoConnections => 503,
            Self::ExecutionTimeout { .. } => 504,
            Self::MaxRestartsExceeded { .. } => 500,
            Self::Internal { .. } => 500,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_status_codes() {
        assert_eq!(
            ProxyError::UpstreamUnavailable { message: "connection refused".to_string() }
                .http_status_code(),
            502
        );
        assert_eq!(ProxyError::Canceled.http_status_code(), 499);
        assert_eq!(ProxyError::NoConnections.http_status_code(), 503);
    }

    #[test]
    fn test_error_serialization() {
        let err = ProxyError::DuplicateId { id: "proxy-1".to_string() };

        let json = serde_json::to_string(&err).unwrap();
        assert!(json.contains("DuplicateId"));
        assert!(json.contains("proxy-1"));

        let deserialized: ProxyError = serde_json::from_str(&json).unwrap();
        assert_eq!(err, deserialized);
    }

    #[test]
    fn test_chaos_predicate() {
        assert!(ProxyError::ConnectionDropped.is_chaos());
        assert!(ProxyError::ChaosInjected { reason: "packet loss".to_string() }.is_chaos());
        assert!(!ProxyError::Canceled.is_chaos());
    }
}
