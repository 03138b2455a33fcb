//! The per-request proxy pipeline for plain HTTP traffic.
//!
//! Sequence: assign a request id, capture small request bodies, roll the
//! chaos rules (a synthetic http-error short-circuits before the origin),
//! run the director rewrites, round-trip through the chaos transport,
//! transform HTML responses, then stream the body back through the chaos
//! decorators with the recorder outermost so it sees exactly what the
//! client got. The finished exchange lands in the traffic log and the
//! page tracker when the body completes — or from the drop guard when
//! the client walks away first.

use super::ProxyInstance;
use crate::chaos::body::BodyStream;
use crate::chaos::transport;
use crate::pages::PageTracker;
use crate::traffic::TrafficLog;
use crate::transform::BodyTransformer;
use axum::body::Body;
use axum::extract::Request;
use axum::http::header::{HeaderMap, HeaderName, HeaderValue};
use axum::http::{Method, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures::StreamExt;
use pagescope_types::models::{HttpExchange, TrafficPayload};
use pagescope_types::ProxyError;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

/// Request bodies at or above this size stream through unrecorded.
const MAX_CAPTURED_REQUEST_BODY: usize = 10 * 1024;
/// At most this much of the delivered response body is kept in the log.
const MAX_CAPTURED_RESPONSE_BODY: usize = 10 * 1024;

const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Everything needed to log one exchange once its outcome is known.
pub(crate) struct RequestRecord {
    traffic: Arc<TrafficLog>,
    pages: Arc<PageTracker>,
    request_id: String,
    method: String,
    url: String,
    request_headers: HashMap<String, String>,
    request_body: Option<String>,
    started: Instant,
    status: u16,
    response_headers: HashMap<String, String>,
    chaos_injected: bool,
    deliver_to_tracker: bool,
    captured: Vec<u8>,
    total_bytes: u64,
    error: Option<String>,
}

impl RequestRecord {
    fn observe(&mut self, bytes: &Bytes) {
        self.total_bytes += bytes.len() as u64;
        let room = MAX_CAPTURED_RESPONSE_BODY.saturating_sub(self.captured.len());
        if room > 0 {
            let take = room.min(bytes.len());
            self.captured.extend_from_slice(&bytes[..take]);
        }
    }

    async fn finish(self) {
        let exchange = HttpExchange {
            request_id: self.request_id,
            method: self.method,
            url: self.url,
            request_headers: self.request_headers,
            request_body: self.request_body,
            status: self.status,
            response_headers: self.response_headers,
            response_body: if self.captured.is_empty() {
                None
            } else {
                Some(String::from_utf8_lossy(&self.captured).into_owned())
            },
            response_bytes: self.total_bytes,
            duration_ms: self.started.elapsed().as_millis() as u64,
            error: self.error,
            chaos_injected: self.chaos_injected,
        };

        let entry_id = self.traffic.push(TrafficPayload::Http(exchange.clone())).await;
        if self.deliver_to_tracker {
            self.pages.record_http(entry_id, &exchange);
        }
    }
}

/// Finalizes the record exactly once, even when the request future or the
/// response stream is dropped mid-flight.
struct RecordGuard(Option<RequestRecord>);

impl RecordGuard {
    fn take(&mut self) -> Option<RequestRecord> {
        self.0.take()
    }
}

impl Drop for RecordGuard {
    fn drop(&mut self) {
        if let Some(mut record) = self.0.take() {
            record.error.get_or_insert_with(|| "request canceled".to_string());
            if record.status == 0 {
                record.status = 499;
            }
            tokio::spawn(record.finish());
        }
    }
}

pub(crate) async fn forward(
    proxy: Arc<ProxyInstance>,
    peer: SocketAddr,
    request: Request,
) -> Response {
    let started = Instant::now();
    let request_id = proxy.next_request_id();

    let (parts, body) = request.into_parts();
    let method = parts.method.clone();
    let path_query =
        parts.uri.path_and_query().map(|pq| pq.as_str().to_owned()).unwrap_or_else(|| "/".into());
    let original_host = parts
        .headers
        .get(axum::http::header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("localhost")
        .to_string();
    let client_url = format!("http://{original_host}{path_query}");

    let mut guard = RecordGuard(Some(RequestRecord {
        traffic: Arc::clone(&proxy.traffic),
        pages: Arc::clone(&proxy.pages),
        request_id: request_id.clone(),
        method: method.to_string(),
        url: client_url.clone(),
        request_headers: headers_to_map(&parts.headers),
        request_body: None,
        started,
        status: 0,
        response_headers: HashMap::new(),
        chaos_injected: false,
        deliver_to_tracker: true,
        captured: Vec::new(),
        total_bytes: 0,
        error: None,
    }));

    // Capture small request bodies; large or unsized ones stream through
    let declared_len = parts
        .headers
        .get(axum::http::header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<usize>().ok());
    let (captured_body, streamed_body): (Option<Bytes>, Option<Body>) = match declared_len {
        Some(len) if len > 0 && len < MAX_CAPTURED_REQUEST_BODY => {
            match axum::body::to_bytes(body, MAX_CAPTURED_REQUEST_BODY).await {
                Ok(bytes) => {
                    if let Some(record) = guard.0.as_mut() {
                        record.request_body =
                            Some(String::from_utf8_lossy(&bytes).into_owned());
                    }
                    (Some(bytes), None)
                }
                Err(_) => {
                    return finalize_early(
                        guard.take(),
                        StatusCode::BAD_REQUEST,
                        "failed to read request body",
                        false,
                    )
                    .await;
                }
            }
        }
        _ => (None, Some(body)),
    };

    // Chaos classification; a firing http-error answers without touching
    // the origin
    let decision = proxy.chaos.decide(method.as_str(), &path_query, &client_url);
    if let Some((status, body_text)) = decision.http_error.clone() {
        tracing::debug!(request_id = %request_id, status, "chaos: synthetic http error");
        if let Some(mut record) = guard.take() {
            record.status = status;
            record.chaos_injected = true;
            record.deliver_to_tracker = false;
            record.observe(&Bytes::copy_from_slice(body_text.as_bytes()));
            record
                .response_headers
                .insert("x-chaos-injected".to_string(), "true".to_string());
            record.finish().await;
        }
        return synthetic_error_response(status, &body_text);
    }

    // Director: upstream URL + forwarded headers
    let target = proxy.target();
    let upstream_url = format!(
        "{}://{}{}",
        target.scheme(),
        crate::util::url_authority(target),
        path_query
    );

    let mut upstream_headers = parts.headers.clone();
    strip_hop_by_hop(&mut upstream_headers);
    upstream_headers.remove(axum::http::header::HOST);
    append_forwarded_for(&mut upstream_headers, peer.ip());
    if let Ok(value) = HeaderValue::from_str(&original_host) {
        upstream_headers.insert(HeaderName::from_static("x-forwarded-host"), value);
    }
    upstream_headers
        .insert(HeaderName::from_static("x-forwarded-proto"), HeaderValue::from_static("http"));

    let client = proxy.upstream_client();
    let mut builder =
        client.request(method.clone(), upstream_url.as_str()).headers(upstream_headers);
    if let Some(bytes) = captured_body {
        builder = builder.body(bytes);
    } else if let Some(body) = streamed_body {
        if method_allows_body(&method) {
            builder = builder.body(reqwest::Body::wrap_stream(body.into_data_stream()));
        }
    }

    let upstream_request = match builder.build() {
        Ok(request) => request,
        Err(e) => {
            return finalize_early(
                guard.take(),
                StatusCode::BAD_GATEWAY,
                &format!("failed to build upstream request: {e}"),
                false,
            )
            .await;
        }
    };

    let upstream_response =
        match transport::round_trip(client, upstream_request, &decision, &proxy.reorder_queue())
            .await
        {
            Ok(response) => response,
            Err(e) => {
                let chaos = e.is_chaos();
                let message = match &e {
                    ProxyError::ChaosInjected { reason } => {
                        format!("chaos injection: {reason}")
                    }
                    ProxyError::UpstreamUnavailable { message } => format!(
                        "Pagescope could not reach {}: {message}",
                        proxy.target()
                    ),
                    other => other.to_string(),
                };
                return finalize_early(guard.take(), StatusCode::BAD_GATEWAY, &message, chaos)
                    .await;
            }
        };

    // Snapshot upstream status/headers
    let status = upstream_response.status();
    let mut response_headers = upstream_response.headers().clone();
    strip_hop_by_hop(&mut response_headers);

    let expected_size = response_headers
        .get(axum::http::header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(0);

    // HTML responses are buffered and transformed; everything else streams
    let (expected_size, source): (u64, BodyStream) =
        if BodyTransformer::is_html(&response_headers) {
            let bytes = match upstream_response.bytes().await {
                Ok(bytes) => bytes,
                Err(e) => {
                    return finalize_early(
                        guard.take(),
                        StatusCode::BAD_GATEWAY,
                        &format!("failed to read upstream body: {e}"),
                        false,
                    )
                    .await;
                }
            };
            let transformed = proxy.transformer().transform(&mut response_headers, bytes).await;
            let len = transformed.len() as u64;
            (
                len,
                Box::pin(futures::stream::once(async move {
                    Ok::<Bytes, axum::Error>(transformed)
                })),
            )
        } else {
            let stream = upstream_response
                .bytes_stream()
                .map(|item| item.map_err(axum::Error::new));
            (expected_size, Box::pin(stream))
        };

    let mut record = guard.take().expect("record taken twice");
    record.status = status.as_u16();
    record.response_headers = headers_to_map(&response_headers);
    record.chaos_injected = decision.shapes_response();

    let shaped = crate::chaos::body::apply(&decision, expected_size, source);
    let recorded = record_stream(shaped, record);

    let mut response = Response::builder().status(status);
    if let Some(headers) = response.headers_mut() {
        *headers = response_headers;
    }
    response
        .body(Body::from_stream(recorded))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// Record everything the client actually receives, then log the exchange.
fn record_stream(mut inner: BodyStream, record: RequestRecord) -> BodyStream {
    Box::pin(async_stream::stream! {
        let mut guard = RecordGuard(Some(record));

        while let Some(item) = inner.next().await {
            match item {
                Ok(bytes) => {
                    if let Some(record) = guard.0.as_mut() {
                        record.observe(&bytes);
                    }
                    yield Ok(bytes);
                }
                Err(e) => {
                    if let Some(mut record) = guard.take() {
                        record.error = Some(e.to_string());
                        record.finish().await;
                    }
                    yield Err(e);
                    return;
                }
            }
        }

        if let Some(record) = guard.take() {
            record.finish().await;
        }
    })
}

async fn finalize_early(
    record: Option<RequestRecord>,
    status: StatusCode,
    message: &str,
    chaos: bool,
) -> Response {
    if let Some(mut record) = record {
        record.status = status.as_u16();
        record.error = Some(message.to_string());
        record.chaos_injected = chaos;
        record.deliver_to_tracker = false;
        record.finish().await;
    }

    let mut builder = Response::builder()
        .status(status)
        .header(axum::http::header::CONTENT_TYPE, "text/plain; charset=utf-8");
    if chaos {
        builder = builder.header("x-chaos-injected", "true");
    }
    builder
        .body(Body::from(message.to_string()))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

fn synthetic_error_response(status: u16, body: &str) -> Response {
    Response::builder()
        .status(StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR))
        .header("x-chaos-injected", "true")
        .header(axum::http::header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(Body::from(body.to_string()))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

fn headers_to_map(headers: &HeaderMap) -> HashMap<String, String> {
    headers
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            )
        })
        .collect()
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP {
        headers.remove(*name);
    }
}

fn append_forwarded_for(headers: &mut HeaderMap, client_ip: std::net::IpAddr) {
    let name = HeaderName::from_static("x-forwarded-for");
    let appended = match headers.get(&name).and_then(|v| v.to_str().ok()) {
        Some(existing) => format!("{existing}, {client_ip}"),
        None => client_ip.to_string(),
    };
    if let Ok(value) = HeaderValue::from_str(&appended) {
        headers.insert(name, value);
    }
}

fn method_allows_body(method: &Method) -> bool {
    !matches!(*method, Method::GET | Method::HEAD | Method::OPTIONS | Method::TRACE)
}
