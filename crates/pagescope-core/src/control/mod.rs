//! Control channel: the WebSocket at `/__devtool_metrics`.
//!
//! Each instrumented page holds one persistent connection. Inbound text
//! frames are JSON telemetry routed into the traffic log and page
//! tracker; inbound binary frames are raw audio for the voice bridge.
//! Outbound traffic is serialized per connection through a single writer
//! task, so broadcasts and session-client replies never interleave
//! mid-frame.

use crate::bridge::{SessionClientFactory, VoiceBridge, VoiceSession};
use crate::pages::PageTracker;
use crate::traffic::TrafficLog;
use axum::extract::ws::{Message, WebSocket};
use base64::Engine;
use chrono::Utc;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use pagescope_types::models::{
    CustomLogData, DesignChatData, DesignRequestData, DesignStateData, ExecutionResult,
    FrontendErrorData, InteractionData, MutationData, PanelMessageData, PerformanceData,
    ScreenshotData, SketchData, TrafficPayload,
};
use pagescope_types::protocol::{ActivityBroadcast, ClientMessage, ExecuteDirective, ToastBroadcast};
use pagescope_types::{ProxyError, Result};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};

const OUTBOUND_BUFFER: usize = 64;

struct Connection {
    id: String,
    tx: mpsc::Sender<Message>,
    voice: Mutex<Option<Box<dyn VoiceSession>>>,
}

/// All control-channel state for one proxy.
pub struct ControlChannels {
    connections: DashMap<String, Arc<Connection>>,
    pending_executions: DashMap<String, oneshot::Sender<ExecutionResult>>,
    traffic: Arc<TrafficLog>,
    pages: Arc<PageTracker>,
    session_client_factory: Option<Arc<dyn SessionClientFactory>>,
    voice_bridge: Option<Arc<dyn VoiceBridge>>,
    conn_seq: AtomicU64,
}

impl ControlChannels {
    pub fn new(traffic: Arc<TrafficLog>, pages: Arc<PageTracker>) -> Self {
        Self {
            connections: DashMap::new(),
            pending_executions: DashMap::new(),
            traffic,
            pages,
            session_client_factory: None,
            voice_bridge: None,
            conn_seq: AtomicU64::new(1),
        }
    }

    pub fn with_session_client_factory(
        mut self,
        factory: Arc<dyn SessionClientFactory>,
    ) -> Self {
        self.session_client_factory = Some(factory);
        self
    }

    pub fn with_voice_bridge(mut self, bridge: Arc<dyn VoiceBridge>) -> Self {
        self.voice_bridge = Some(bridge);
        self
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Own a freshly upgraded socket until it errors or closes.
    pub async fn handle_socket(self: Arc<Self>, socket: WebSocket) {
        let conn_id = format!(
            "conn-{}-{}",
            Utc::now().timestamp_nanos_opt().unwrap_or_default(),
            self.conn_seq.fetch_add(1, Ordering::Relaxed)
        );

        let (mut sink, mut stream) = socket.split();
        let (tx, mut rx) = mpsc::channel::<Message>(OUTBOUND_BUFFER);

        let connection =
            Arc::new(Connection { id: conn_id.clone(), tx, voice: Mutex::new(None) });
        self.connections.insert(conn_id.clone(), Arc::clone(&connection));
        tracing::debug!(conn_id = %conn_id, "control channel connected");

        // Single writer per connection
        let writer = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                if sink.send(message).await.is_err() {
                    break;
                }
            }
        });

        while let Some(frame) = stream.next().await {
            match frame {
                Ok(Message::Text(text)) => {
                    let Ok(message) = serde_json::from_str::<ClientMessage>(&text) else {
                        tracing::debug!(conn_id = %conn_id, "unparseable control frame ignored");
                        continue;
                    };
                    self.route(&connection, message).await;
                }
                Ok(Message::Binary(audio)) => {
                    let voice = connection.voice.lock().await;
                    if let Some(session) = voice.as_ref() {
                        if let Err(e) = session.send(bytes::Bytes::from(audio)).await {
                            tracing::warn!(conn_id = %conn_id, error = %e, "voice forward failed");
                        }
                    }
                }
                Ok(Message::Close(_)) => break,
                Ok(_) => {} // ping/pong handled by axum
                Err(e) => {
                    tracing::debug!(conn_id = %conn_id, error = %e, "control channel read error");
                    break;
                }
            }
        }

        // Cleanup: voice session closed, connection removed
        if let Some(voice) = connection.voice.lock().await.take() {
            voice.close().await;
        }
        self.connections.remove(&conn_id);
        writer.abort();
        tracing::debug!(conn_id = %conn_id, "control channel closed");
    }

    async fn route(&self, connection: &Arc<Connection>, message: ClientMessage) {
        match message.message_type.as_str() {
            "session_request" => self.handle_session_request(connection, message),
            "voice_start" => self.handle_voice_start(connection, message).await,
            "voice_stop" => self.handle_voice_stop(connection).await,
            _ => self.ingest(message).await,
        }
    }

    /// Telemetry kinds: push the typed entry, update the page tracker for
    /// session-affecting kinds, and correlate execution results. Unknown
    /// types are ignored.
    pub async fn ingest(&self, message: ClientMessage) {
        let url = message.url.as_deref();
        let session_id = message.session_id.as_deref();
        let data = message.data;

        match message.message_type.as_str() {
            "error" => {
                let mut error: FrontendErrorData =
                    serde_json::from_value(data).unwrap_or_default();
                if error.url.is_none() {
                    error.url = url.map(str::to_string);
                }
                self.traffic.push(TrafficPayload::FrontendError(error.clone())).await;
                self.pages.record_error(url, session_id, error);
            }
            "performance" => {
                let mut performance: PerformanceData =
                    serde_json::from_value(data.clone()).unwrap_or_default();
                performance.raw = data.clone();
                if performance.url.is_none() {
                    performance.url = url.map(str::to_string);
                }
                if let Some(title) = data.get("title").and_then(|t| t.as_str()) {
                    self.pages.set_title(url, session_id, title.to_string());
                }
                self.traffic.push(TrafficPayload::Performance(performance.clone())).await;
                self.pages.record_performance(url, session_id, performance);
            }
            "custom_log" => {
                let mut log: CustomLogData = serde_json::from_value(data).unwrap_or_default();
                if log.url.is_none() {
                    log.url = url.map(str::to_string);
                }
                self.traffic.push(TrafficPayload::CustomLog(log)).await;
            }
            kind @ ("screenshot" | "screenshot_capture" | "element_capture"
            | "sketch_capture") => {
                let data_url = data
                    .get("data")
                    .or_else(|| data.get("data_url"))
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                let byte_len = decoded_data_url_len(&data_url);
                self.traffic
                    .push(TrafficPayload::Screenshot(ScreenshotData {
                        capture_kind: kind.to_string(),
                        data_url,
                        byte_len,
                    }))
                    .await;
            }
            "interactions" => {
                let interactions: Vec<InteractionData> =
                    serde_json::from_value(data).unwrap_or_default();
                for interaction in &interactions {
                    self.traffic
                        .push(TrafficPayload::Interaction(interaction.clone()))
                        .await;
                }
                self.pages.record_interactions(url, session_id, interactions);
            }
            "mutations" => {
                let mutations: Vec<MutationData> =
                    serde_json::from_value(data).unwrap_or_default();
                for mutation in &mutations {
                    self.traffic.push(TrafficPayload::Mutation(mutation.clone())).await;
                }
                self.pages.record_mutations(url, session_id, mutations);
            }
            "panel_message" => {
                let panel = data
                    .get("panel")
                    .and_then(|p| p.as_str())
                    .unwrap_or_default()
                    .to_string();
                self.traffic
                    .push(TrafficPayload::PanelMessage(PanelMessageData { panel, payload: data }))
                    .await;
            }
            "sketch" => {
                self.traffic.push(TrafficPayload::Sketch(SketchData { payload: data })).await;
            }
            "design_state" => {
                self.traffic
                    .push(TrafficPayload::DesignState(DesignStateData { payload: data }))
                    .await;
            }
            "design_request" => {
                self.traffic
                    .push(TrafficPayload::DesignRequest(DesignRequestData { payload: data }))
                    .await;
            }
            "design_chat" => {
                self.traffic
                    .push(TrafficPayload::DesignChat(DesignChatData { payload: data }))
                    .await;
            }
            "execution" => {
                let result: ExecutionResult = serde_json::from_value(data).unwrap_or_default();
                self.traffic.push(TrafficPayload::Execution(result.clone())).await;
                // Missing slot is fine: the waiter may have timed out
                if let Some((_, slot)) = self.pending_executions.remove(&result.exec_id) {
                    let _ = slot.send(result);
                }
            }
            other => {
                tracing::debug!(message_type = other, "unknown control message ignored");
            }
        }
    }

    fn handle_session_request(&self, connection: &Arc<Connection>, message: ClientMessage) {
        let Some(factory) = self.session_client_factory.clone() else {
            tracing::debug!("session_request with no session client factory configured");
            return;
        };
        let connection = Arc::clone(connection);

        tokio::spawn(async move {
            let reply = match dispatch_session_request(&factory, &message.data).await {
                Ok(value) => serde_json::json!({ "type": "session_response", "data": value }),
                Err(e) => serde_json::json!({ "type": "session_response", "error": e.to_string() }),
            };
            if let Ok(text) = serde_json::to_string(&reply) {
                let _ = connection.tx.send(Message::Text(text)).await;
            }
        });
    }

    async fn handle_voice_start(&self, connection: &Arc<Connection>, message: ClientMessage) {
        let Some(bridge) = &self.voice_bridge else {
            tracing::debug!("voice_start with no voice bridge configured");
            return;
        };
        match bridge.open(&connection.id, message.data).await {
            Ok(session) => {
                let mut voice = connection.voice.lock().await;
                if let Some(previous) = voice.replace(session) {
                    previous.close().await;
                }
                tracing::debug!(conn_id = %connection.id, "voice session opened");
            }
            Err(e) => {
                tracing::warn!(conn_id = %connection.id, error = %e, "voice session open failed");
            }
        }
    }

    async fn handle_voice_stop(&self, connection: &Arc<Connection>) {
        if let Some(session) = connection.voice.lock().await.take() {
            session.close().await;
            tracing::debug!(conn_id = %connection.id, "voice session closed");
        }
    }

    /// Send `{type:"execute", id, code}` to every connection and wait for
    /// the first correlated result. Fails fast when nobody is connected.
    pub async fn execute_javascript(
        &self,
        code: &str,
        timeout: Duration,
    ) -> Result<ExecutionResult> {
        if self.connections.is_empty() {
            return Err(ProxyError::NoConnections);
        }

        let exec_id = format!("exec-{}", Utc::now().timestamp_nanos_opt().unwrap_or_default());
        let (tx, rx) = oneshot::channel();
        self.pending_executions.insert(exec_id.clone(), tx);

        let directive = ExecuteDirective::new(exec_id.clone(), code);
        let delivered = self.broadcast_json(&directive).await;
        if delivered == 0 {
            self.pending_executions.remove(&exec_id);
            return Err(ProxyError::NoConnections);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => Ok(result),
            _ => {
                self.pending_executions.remove(&exec_id);
                Err(ProxyError::ExecutionTimeout { id: exec_id })
            }
        }
    }

    /// Fire-and-forget activity broadcast; returns deliveries.
    pub async fn broadcast_activity(&self, active: bool) -> usize {
        self.broadcast_json(&ActivityBroadcast::new(active)).await
    }

    /// Fire-and-forget toast broadcast; returns deliveries.
    pub async fn broadcast_toast(
        &self,
        toast_type: &str,
        title: &str,
        message: &str,
        duration: Option<u64>,
    ) -> usize {
        self.broadcast_json(&ToastBroadcast::new(toast_type, title, message, duration)).await
    }

    /// Serialize once, deliver to every connection; per-connection send
    /// failures are suppressed and excluded from the count.
    async fn broadcast_json<T: serde::Serialize>(&self, message: &T) -> usize {
        let Ok(text) = serde_json::to_string(message) else {
            return 0;
        };

        let connections: Vec<Arc<Connection>> =
            self.connections.iter().map(|entry| Arc::clone(entry.value())).collect();

        let mut delivered = 0;
        for connection in connections {
            if connection.tx.send(Message::Text(text.clone())).await.is_ok() {
                delivered += 1;
            }
        }
        delivered
    }
}

async fn dispatch_session_request(
    factory: &Arc<dyn SessionClientFactory>,
    data: &serde_json::Value,
) -> Result<serde_json::Value> {
    let client = factory.connect().await?;
    let action = data.get("action").and_then(|a| a.as_str()).unwrap_or_default();
    let id = data.get("id").and_then(|i| i.as_str()).unwrap_or_default();
    let payload = data.get("payload").cloned().unwrap_or(serde_json::Value::Null);

    let result = match action {
        "list" => client.list().await,
        "get" => client.get(id).await,
        "send" => client.send(payload).await,
        "schedule" => client.schedule(payload).await,
        "tasks" => client.tasks().await,
        "cancel" => client.cancel(id).await,
        other => Err(ProxyError::Internal { message: format!("unknown session action '{other}'") }),
    };
    client.close().await;
    result
}

fn decoded_data_url_len(data_url: &str) -> usize {
    let Some(base64_part) = data_url.split(";base64,").nth(1) else {
        return data_url.len();
    };
    base64::engine::general_purpose::STANDARD
        .decode(base64_part)
        .map(|decoded| decoded.len())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pagescope_types::models::TrafficKind;

    fn channels() -> ControlChannels {
        let traffic = Arc::new(TrafficLog::new(100));
        let pages = Arc::new(PageTracker::new(Duration::from_secs(300), 100));
        ControlChannels::new(traffic, pages)
    }

    fn message(message_type: &str, data: serde_json::Value, url: Option<&str>) -> ClientMessage {
        ClientMessage {
            message_type: message_type.to_string(),
            data,
            url: url.map(str::to_string),
            session_id: None,
        }
    }

    #[tokio::test]
    async fn test_error_message_reaches_log_and_session() {
        let channels = channels();

        // A session for the page must exist first
        let mut response_headers = std::collections::HashMap::new();
        response_headers.insert("content-type".to_string(), "text/html".to_string());
        channels.pages.record_http(
            1,
            &pagescope_types::models::HttpExchange {
                method: "GET".to_string(),
                url: "http://host/page".to_string(),
                status: 200,
                response_headers,
                ..Default::default()
            },
        );

        channels
            .ingest(message(
                "error",
                serde_json::json!({"message": "boom"}),
                Some("http://host/page"),
            ))
            .await;

        let errors = channels.traffic.by_kind(TrafficKind::FrontendError, 10).await;
        assert_eq!(errors.len(), 1);

        let session = channels.pages.get("page-1").unwrap();
        assert_eq!(session.errors.len(), 1);
        assert_eq!(session.errors[0].message, "boom");
    }

    #[tokio::test]
    async fn test_performance_message_sets_session_title() {
        let channels = channels();

        let mut response_headers = std::collections::HashMap::new();
        response_headers.insert("content-type".to_string(), "text/html".to_string());
        channels.pages.record_http(
            1,
            &pagescope_types::models::HttpExchange {
                method: "GET".to_string(),
                url: "http://host/page".to_string(),
                status: 200,
                response_headers,
                ..Default::default()
            },
        );

        // Shape matches what the bootstrap script emits on window load
        channels
            .ingest(message(
                "performance",
                serde_json::json!({
                    "dom_content_loaded_ms": 120.5,
                    "load_ms": 240.0,
                    "title": "Checkout — Acme Store"
                }),
                Some("http://host/page"),
            ))
            .await;

        let session = channels.pages.get("page-1").unwrap();
        assert_eq!(session.title.as_deref(), Some("Checkout — Acme Store"));
        let performance = session.performance.expect("performance recorded");
        assert_eq!(performance.load_ms, Some(240.0));
        assert_eq!(channels.traffic.by_kind(TrafficKind::Performance, 10).await.len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_type_is_ignored() {
        let channels = channels();
        channels.ingest(message("mystery", serde_json::json!({}), None)).await;
        assert!(channels.traffic.is_empty().await);
    }

    #[tokio::test]
    async fn test_execution_result_correlates_pending_slot() {
        let channels = channels();
        let (tx, rx) = oneshot::channel();
        channels.pending_executions.insert("exec-7".to_string(), tx);

        channels
            .ingest(message(
                "execution",
                serde_json::json!({"exec_id": "exec-7", "result": 42}),
                None,
            ))
            .await;

        let result = rx.await.unwrap();
        assert_eq!(result.exec_id, "exec-7");
        assert_eq!(result.result, Some(serde_json::json!(42)));
        assert_eq!(channels.traffic.by_kind(TrafficKind::Execution, 10).await.len(), 1);
    }

    #[tokio::test]
    async fn test_execution_result_with_missing_slot_is_ignored() {
        let channels = channels();
        channels
            .ingest(message("execution", serde_json::json!({"exec_id": "gone"}), None))
            .await;
        // Logged, not crashed
        assert_eq!(channels.traffic.len().await, 1);
    }

    #[tokio::test]
    async fn test_execute_javascript_without_connections_fails() {
        let channels = channels();
        let result = channels.execute_javascript("1+1", Duration::from_millis(50)).await;
        assert!(matches!(result, Err(ProxyError::NoConnections)));
    }

    #[tokio::test]
    async fn test_interactions_array_fans_out() {
        let channels = channels();
        channels
            .ingest(message(
                "interactions",
                serde_json::json!([{"type": "click"}, {"type": "input"}]),
                None,
            ))
            .await;
        assert_eq!(channels.traffic.by_kind(TrafficKind::Interaction, 10).await.len(), 2);
    }

    #[test]
    fn test_data_url_length() {
        // "hi" -> aGk=
        assert_eq!(decoded_data_url_len("data:image/png;base64,aGk="), 2);
        assert_eq!(decoded_data_url_len("not a data url"), 14);
    }

    struct EchoSessionClient;

    #[async_trait::async_trait]
    impl crate::bridge::SessionClient for EchoSessionClient {
        async fn list(&self) -> pagescope_types::Result<serde_json::Value> {
            Ok(serde_json::json!(["s1", "s2"]))
        }
        async fn get(&self, id: &str) -> pagescope_types::Result<serde_json::Value> {
            Ok(serde_json::json!({ "id": id }))
        }
        async fn send(&self, payload: serde_json::Value) -> pagescope_types::Result<serde_json::Value> {
            Ok(payload)
        }
        async fn schedule(&self, _: serde_json::Value) -> pagescope_types::Result<serde_json::Value> {
            Ok(serde_json::Value::Null)
        }
        async fn tasks(&self) -> pagescope_types::Result<serde_json::Value> {
            Ok(serde_json::json!([]))
        }
        async fn cancel(&self, _: &str) -> pagescope_types::Result<serde_json::Value> {
            Ok(serde_json::Value::Null)
        }
        async fn close(&self) {}
    }

    struct EchoFactory;

    #[async_trait::async_trait]
    impl crate::bridge::SessionClientFactory for EchoFactory {
        async fn connect(&self) -> pagescope_types::Result<Box<dyn crate::bridge::SessionClient>> {
            Ok(Box::new(EchoSessionClient))
        }
    }

    #[tokio::test]
    async fn test_session_request_replies_on_same_connection() {
        let channels = channels().with_session_client_factory(Arc::new(EchoFactory));
        let (tx, mut rx) = mpsc::channel(8);
        let connection = Arc::new(Connection {
            id: "conn-test".to_string(),
            tx,
            voice: Mutex::new(None),
        });

        channels.handle_session_request(
            &connection,
            message("session_request", serde_json::json!({"action": "list"}), None),
        );

        let reply = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("reply in time")
            .expect("reply present");
        let Message::Text(text) = reply else { panic!("expected text reply") };
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["type"], "session_response");
        assert_eq!(value["data"], serde_json::json!(["s1", "s2"]));
    }

    struct CountingVoice(Arc<std::sync::atomic::AtomicBool>);

    #[async_trait::async_trait]
    impl crate::bridge::VoiceSession for CountingVoice {
        async fn send(&self, _audio: bytes::Bytes) -> pagescope_types::Result<()> {
            Ok(())
        }
        async fn close(&self) {
            self.0.store(true, std::sync::atomic::Ordering::SeqCst);
        }
    }

    struct FakeVoiceBridge(Arc<std::sync::atomic::AtomicBool>);

    #[async_trait::async_trait]
    impl crate::bridge::VoiceBridge for FakeVoiceBridge {
        async fn open(
            &self,
            _connection_id: &str,
            _config: serde_json::Value,
        ) -> pagescope_types::Result<Box<dyn crate::bridge::VoiceSession>> {
            Ok(Box::new(CountingVoice(Arc::clone(&self.0))))
        }
    }

    #[tokio::test]
    async fn test_voice_session_lifecycle() {
        let closed = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let channels = channels().with_voice_bridge(Arc::new(FakeVoiceBridge(Arc::clone(&closed))));
        let (tx, _rx) = mpsc::channel(8);
        let connection = Arc::new(Connection {
            id: "conn-voice".to_string(),
            tx,
            voice: Mutex::new(None),
        });

        channels
            .handle_voice_start(&connection, message("voice_start", serde_json::json!({}), None))
            .await;
        assert!(connection.voice.lock().await.is_some());

        channels.handle_voice_stop(&connection).await;
        assert!(connection.voice.lock().await.is_none());
        assert!(closed.load(std::sync::atomic::Ordering::SeqCst));
    }
}
