//! WebSocket pass-through to the target origin.
//!
//! Upgrades are never chaos-injected or transformed: the engine logs one
//! synthetic 101 entry and then tunnels frames verbatim in both
//! directions until either side closes.

use super::ProxyInstance;
use axum::extract::ws::{CloseFrame, Message as AxumMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{FromRequestParts, Request};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use futures::{SinkExt, StreamExt};
use pagescope_types::models::{HttpExchange, TrafficPayload};
use std::sync::Arc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame as TungsteniteCloseFrame;
use tokio_tungstenite::tungstenite::Message as TungsteniteMessage;

pub(crate) fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    let upgrade_is_websocket = headers
        .get(axum::http::header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);
    let connection_upgrades = headers
        .get(axum::http::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_ascii_lowercase().contains("upgrade"))
        .unwrap_or(false);
    upgrade_is_websocket && connection_upgrades
}

pub(crate) async fn proxy_websocket(proxy: Arc<ProxyInstance>, request: Request) -> Response {
    let (mut parts, _body) = request.into_parts();
    let path_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_owned())
        .unwrap_or_else(|| "/".into());
    let original_host = parts
        .headers
        .get(axum::http::header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("localhost")
        .to_string();

    let upgrade = match WebSocketUpgrade::from_request_parts(&mut parts, &()).await {
        Ok(upgrade) => upgrade,
        Err(rejection) => return rejection.into_response(),
    };

    // One synthetic 101 entry; the tunneled frames go unrecorded
    let exchange = HttpExchange {
        request_id: proxy.next_request_id(),
        method: "GET".to_string(),
        url: format!("http://{original_host}{path_query}"),
        status: 101,
        ..Default::default()
    };
    proxy.traffic.push(TrafficPayload::Http(exchange)).await;

    let target = proxy.target();
    let ws_scheme = if target.scheme() == "https" { "wss" } else { "ws" };
    let upstream_url =
        format!("{}://{}{}", ws_scheme, crate::util::url_authority(target), path_query);

    upgrade.on_upgrade(move |client_socket| bridge(client_socket, upstream_url))
}

async fn bridge(client_socket: WebSocket, upstream_url: String) {
    let (upstream_socket, _) =
        match tokio_tungstenite::connect_async(upstream_url.as_str()).await {
            Ok(connected) => connected,
            Err(e) => {
                tracing::warn!(url = %upstream_url, error = %e, "upstream websocket connect failed");
                return;
            }
        };
    tracing::debug!(url = %upstream_url, "websocket tunnel established");

    let (mut client_sink, mut client_stream) = client_socket.split();
    let (mut upstream_sink, mut upstream_stream) = upstream_socket.split();

    let client_to_upstream = tokio::spawn(async move {
        while let Some(message) = client_stream.next().await {
            let Ok(message) = message else { break };
            if upstream_sink.send(axum_to_tungstenite(message)).await.is_err() {
                break;
            }
        }
    });

    let upstream_to_client = tokio::spawn(async move {
        while let Some(message) = upstream_stream.next().await {
            let Ok(message) = message else { break };
            let Some(message) = tungstenite_to_axum(message) else { continue };
            if client_sink.send(message).await.is_err() {
                break;
            }
        }
    });

    tokio::select! {
        _ = client_to_upstream => {}
        _ = upstream_to_client => {}
    }
    tracing::debug!(url = %upstream_url, "websocket tunnel closed");
}

fn axum_to_tungstenite(message: AxumMessage) -> TungsteniteMessage {
    match message {
        AxumMessage::Text(text) => TungsteniteMessage::Text(text),
        AxumMessage::Binary(data) => TungsteniteMessage::Binary(data),
        AxumMessage::Ping(data) => TungsteniteMessage::Ping(data),
        AxumMessage::Pong(data) => TungsteniteMessage::Pong(data),
        AxumMessage::Close(frame) => TungsteniteMessage::Close(frame.map(|f| {
            TungsteniteCloseFrame { code: CloseCode::from(f.code), reason: f.reason }
        })),
    }
}

fn tungstenite_to_axum(message: TungsteniteMessage) -> Option<AxumMessage> {
    match message {
        TungsteniteMessage::Text(text) => Some(AxumMessage::Text(text)),
        TungsteniteMessage::Binary(data) => Some(AxumMessage::Binary(data)),
        TungsteniteMessage::Ping(data) => Some(AxumMessage::Ping(data)),
        TungsteniteMessage::Pong(data) => Some(AxumMessage::Pong(data)),
        TungsteniteMessage::Close(frame) => Some(AxumMessage::Close(
            frame.map(|f| CloseFrame { code: u16::from(f.code), reason: f.reason }),
        )),
        // Raw frames never surface from a read loop
        TungsteniteMessage::Frame(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_upgrade_detection() {
        let mut headers = HeaderMap::new();
        assert!(!is_websocket_upgrade(&headers));

        headers.insert("upgrade", HeaderValue::from_static("websocket"));
        assert!(!is_websocket_upgrade(&headers));

        headers.insert("connection", HeaderValue::from_static("keep-alive, Upgrade"));
        assert!(is_websocket_upgrade(&headers));
    }
}
