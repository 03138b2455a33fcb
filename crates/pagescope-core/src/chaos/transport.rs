//! Request-side chaos around the upstream round-trip.
//!
//! Applied in a fixed order: packet loss, stale latency, normal latency,
//! reorder, then the actual round-trip. Control-channel paths and
//! WebSocket upgrades never reach this code; the engine routes them
//! before chaos classification.

use super::reorder::ReorderQueue;
use super::rules::ChaosDecision;
use pagescope_types::{ProxyError, Result};
use std::error::Error as _;
use std::sync::Arc;

/// Perform the upstream round-trip for one request, applying the
/// request-side parts of `decision`.
///
/// Sleeps are plain awaits: when the client goes away the request future
/// is dropped, which cancels any pending delay without touching the
/// origin.
pub async fn round_trip(
    client: reqwest::Client,
    request: reqwest::Request,
    decision: &ChaosDecision,
    reorder_queue: &Arc<ReorderQueue>,
) -> Result<reqwest::Response> {
    if decision.packet_loss {
        tracing::debug!(url = %request.url(), "chaos: packet loss, origin not contacted");
        return Err(ProxyError::ChaosInjected { reason: "packet loss".to_string() });
    }

    if let Some(delay) = decision.stale_delay {
        tracing::debug!(url = %request.url(), ?delay, "chaos: stale latency");
        tokio::time::sleep(delay).await;
    }

    if let Some(delay) = decision.delay {
        tracing::debug!(url = %request.url(), ?delay, "chaos: latency");
        tokio::time::sleep(delay).await;
    }

    if let Some(params) = decision.reorder {
        tracing::debug!(url = %request.url(), min_hold = params.min_hold, "chaos: reorder hold");
        return reorder_queue.submit(client, request, params).await;
    }

    client
        .execute(request)
        .await
        .map_err(|e| ProxyError::UpstreamUnavailable { message: describe_upstream_error(&e) })
}

/// Human-readable classification of an upstream transport error, used for
/// the 502 body. Distinguishes connection refusal, resolution failure and
/// cancellation from the generic case.
pub fn describe_upstream_error(err: &reqwest::Error) -> String {
    if err.is_timeout() {
        return "request timed out".to_string();
    }

    let mut source: Option<&(dyn std::error::Error + 'static)> = err.source();
    while let Some(cause) = source {
        if let Some(io_err) = cause.downcast_ref::<std::io::Error>() {
            match io_err.kind() {
                std::io::ErrorKind::ConnectionRefused => return "connection refused".to_string(),
                std::io::ErrorKind::Interrupted => return "context canceled".to_string(),
                _ => {}
            }
        }
        let text = cause.to_string();
        if text.contains("dns error") || text.contains("failed to lookup address") {
            return "no such host".to_string();
        }
        if text.contains("operation was canceled") {
            return "context canceled".to_string();
        }
        source = cause.source();
    }

    err.to_string()
}
