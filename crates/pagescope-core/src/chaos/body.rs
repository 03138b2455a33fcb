//! Response-side chaos decorators over the body stream.
//!
//! In the write path these compose outermost-first as slow-drip →
//! connection-drop → truncation → recording, so bytes seen by the
//! recorder are exactly the bytes the client receives. Decorators delay,
//! drop or discard bytes; they never reorder them.

use super::rules::{ChaosDecision, SlowDripParams};
use bytes::Bytes;
use futures::{Stream, StreamExt};
use pagescope_types::ProxyError;
use std::pin::Pin;
use std::time::Duration;

/// Item type flowing to the client body.
pub type BodyResult = std::result::Result<Bytes, axum::Error>;
/// Boxed body stream, the unit all decorators compose over.
pub type BodyStream = Pin<Box<dyn Stream<Item = BodyResult> + Send + 'static>>;

/// Wrap `source` with every response-side decorator `decision` calls for.
///
/// `expected_size` is the upstream-declared Content-Length (0 when
/// unknown); connection-drop and truncation derive their byte caps from
/// it.
pub fn apply(decision: &ChaosDecision, expected_size: u64, source: BodyStream) -> BodyStream {
    let mut stream = source;
    if let Some(params) = decision.slow_drip {
        stream = slow_drip(stream, params);
    }
    if let Some(params) = decision.connection_drop {
        stream = connection_drop(stream, params.drop_point(expected_size));
    }
    if let Some(percent) = decision.truncate_percent {
        let cap = (expected_size as f64 * percent.clamp(0.0, 1.0)) as u64;
        stream = truncate(stream, cap);
    }
    stream
}

/// Re-chunk the body and pace it at `bytes_per_ms`.
///
/// Cancel-safe: dropping the response mid-drip just drops the pending
/// sleep.
pub fn slow_drip(mut inner: BodyStream, params: SlowDripParams) -> BodyStream {
    Box::pin(async_stream::stream! {
        let chunk_size = params.chunk_size.max(1);
        let bytes_per_ms = params.bytes_per_ms.max(1);

        while let Some(item) = inner.next().await {
            match item {
                Ok(bytes) => {
                    let mut offset = 0;
                    while offset < bytes.len() {
                        let end = (offset + chunk_size).min(bytes.len());
                        let chunk = bytes.slice(offset..end);
                        offset = end;

                        let delay_ms = chunk.len() as u64 / bytes_per_ms;
                        yield Ok(chunk);
                        if delay_ms > 0 {
                            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                        }
                    }
                }
                Err(e) => {
                    yield Err(e);
                    return;
                }
            }
        }
    })
}

/// Deliver at most `drop_after` bytes, then fail the stream hard.
///
/// The partial chunk at the drop point is still delivered; the error that
/// follows makes the server abort the connection, which is the stream
/// analog of hijack-and-close. The decorator is linear, so the drop fires
/// exactly once.
pub fn connection_drop(mut inner: BodyStream, drop_after: u64) -> BodyStream {
    Box::pin(async_stream::stream! {
        let mut delivered: u64 = 0;

        while let Some(item) = inner.next().await {
            match item {
                Ok(bytes) => {
                    let remaining = drop_after.saturating_sub(delivered);
                    if remaining == 0 {
                        tracing::debug!(delivered, "chaos: dropping connection mid-stream");
                        yield Err(axum::Error::new(ProxyError::ConnectionDropped));
                        return;
                    }
                    if (bytes.len() as u64) <= remaining {
                        delivered += bytes.len() as u64;
                        yield Ok(bytes);
                    } else {
                        let partial = bytes.slice(..remaining as usize);
                        delivered += partial.len() as u64;
                        yield Ok(partial);
                        tracing::debug!(delivered, "chaos: dropping connection mid-stream");
                        yield Err(axum::Error::new(ProxyError::ConnectionDropped));
                        return;
                    }
                }
                Err(e) => {
                    yield Err(e);
                    return;
                }
            }
        }
    })
}

/// Deliver at most `cap` bytes, then silently discard the rest.
///
/// The inner stream is still drained to completion so the upstream side
/// proceeds normally; the client just observes a short body.
pub fn truncate(mut inner: BodyStream, cap: u64) -> BodyStream {
    Box::pin(async_stream::stream! {
        let mut delivered: u64 = 0;

        while let Some(item) = inner.next().await {
            match item {
                Ok(bytes) => {
                    let remaining = cap.saturating_sub(delivered);
                    if remaining == 0 {
                        continue;
                    }
                    if (bytes.len() as u64) <= remaining {
                        delivered += bytes.len() as u64;
                        yield Ok(bytes);
                    } else {
                        let partial = bytes.slice(..remaining as usize);
                        delivered += partial.len() as u64;
                        yield Ok(partial);
                    }
                }
                Err(e) => {
                    yield Err(e);
                    return;
                }
            }
        }
    })
}
