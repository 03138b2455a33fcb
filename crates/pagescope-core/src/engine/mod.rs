//! Proxy engine: listener, supervisor, and per-instance state.
//!
//! A [`ProxyInstance`] binds its listener (falling back to an OS-assigned
//! port exactly once when the preferred port is taken), signals readiness,
//! and keeps a supervisor loop that restarts a crashed serve loop subject
//! to a rate limit. Requests are classified up front: the control-channel
//! path and WebSocket upgrades bypass chaos and transformation entirely.

mod forward;
mod ws;

use crate::chaos::{ChaosRuleset, ReorderQueue};
use crate::control::ControlChannels;
use crate::pages::PageTracker;
use crate::traffic::TrafficLog;
use crate::transform::BodyTransformer;
use axum::extract::connect_info::ConnectInfo;
use axum::extract::{Request, State, WebSocketUpgrade};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use chrono::{DateTime, Utc};
use pagescope_types::{ProxyConfig, ProxyError, Result};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use url::Url;

/// Reserved path for the control-channel WebSocket.
pub const CONTROL_PATH: &str = "/__devtool_metrics";

/// One running reverse proxy.
pub struct ProxyInstance {
    config: ProxyConfig,
    target: Url,
    listen_addr: RwLock<Option<SocketAddr>>,
    running: AtomicBool,
    pub created_at: DateTime<Utc>,
    restart_history: Mutex<Vec<Instant>>,
    last_error: RwLock<Option<String>>,
    public_url: RwLock<Option<Url>>,
    pub traffic: Arc<TrafficLog>,
    pub pages: Arc<PageTracker>,
    pub chaos: Arc<ChaosRuleset>,
    pub control: Arc<ControlChannels>,
    reorder: Arc<ReorderQueue>,
    request_seq: AtomicU64,
    ready_tx: watch::Sender<bool>,
    shutdown_tx: watch::Sender<bool>,
    client: reqwest::Client,
    serve_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

#[derive(Clone)]
pub(crate) struct EngineState {
    pub proxy: Arc<ProxyInstance>,
}

impl ProxyInstance {
    /// Validate the config and assemble an instance. Must be called from
    /// within a runtime (the reorder sweeper is spawned here).
    pub fn new(config: ProxyConfig) -> Result<Arc<Self>> {
        Self::new_with_bridges(config, None, None)
    }

    /// Same as [`Self::new`], with the external collaborator seams wired
    /// into the control channel.
    pub fn new_with_bridges(
        config: ProxyConfig,
        session_client_factory: Option<Arc<dyn crate::bridge::SessionClientFactory>>,
        voice_bridge: Option<Arc<dyn crate::bridge::VoiceBridge>>,
    ) -> Result<Arc<Self>> {
        let target = crate::util::parse_target_url(&config.target_url)?;

        let public_url = match &config.public_url {
            Some(raw) if !raw.is_empty() => Some(Url::parse(raw).map_err(|e| {
                ProxyError::InvalidPublicUrl { url: raw.clone(), message: e.to_string() }
            })?),
            _ => None,
        };

        let client = crate::util::build_upstream_client(&target)?;
        let traffic = Arc::new(TrafficLog::new(config.traffic_log_capacity));
        let pages = Arc::new(PageTracker::new(
            Duration::from_secs(config.session_timeout_secs),
            config.max_sessions,
        ));
        let chaos = Arc::new(ChaosRuleset::new());
        let mut control = ControlChannels::new(Arc::clone(&traffic), Arc::clone(&pages));
        if let Some(factory) = session_client_factory {
            control = control.with_session_client_factory(factory);
        }
        if let Some(bridge) = voice_bridge {
            control = control.with_voice_bridge(bridge);
        }
        let control = Arc::new(control);
        let reorder = ReorderQueue::new(Arc::clone(&chaos));

        let (ready_tx, _) = watch::channel(false);
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Arc::new(Self {
            config,
            target,
            listen_addr: RwLock::new(None),
            running: AtomicBool::new(false),
            created_at: Utc::now(),
            restart_history: Mutex::new(Vec::new()),
            last_error: RwLock::new(None),
            public_url: RwLock::new(public_url),
            traffic,
            pages,
            chaos,
            control,
            reorder,
            request_seq: AtomicU64::new(1),
            ready_tx,
            shutdown_tx,
            client,
            serve_task: Mutex::new(None),
        }))
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    pub fn target(&self) -> &Url {
        &self.target
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Listen address; set exactly once, before the ready signal fires.
    pub fn listen_addr(&self) -> Option<SocketAddr> {
        *self.listen_addr.read().expect("listen addr lock poisoned")
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.read().expect("last error lock poisoned").clone()
    }

    pub fn public_url(&self) -> Option<Url> {
        self.public_url.read().expect("public url lock poisoned").clone()
    }

    /// Attach or detach a tunnel's public URL at runtime.
    pub fn set_public_url(&self, url: Option<Url>) {
        *self.public_url.write().expect("public url lock poisoned") = url;
    }

    /// Start a tunnel process and point HTML rewrites at its public URL.
    pub async fn attach_tunnel(
        &self,
        tunnel: &dyn crate::bridge::TunnelSupervisor,
    ) -> Result<()> {
        tunnel.start().await?;
        let Some(raw) = tunnel.public_url() else {
            return Err(ProxyError::Internal {
                message: "tunnel started but reported no public URL".to_string(),
            });
        };
        let url = Url::parse(&raw).map_err(|e| ProxyError::InvalidPublicUrl {
            url: raw.clone(),
            message: e.to_string(),
        })?;
        tracing::info!(id = %self.config.id, public_url = %url, "tunnel attached");
        self.set_public_url(Some(url));
        Ok(())
    }

    /// Stop an attached tunnel and revert rewrites to the listen address.
    pub async fn detach_tunnel(&self, tunnel: &dyn crate::bridge::TunnelSupervisor) {
        if tunnel.is_running() {
            tunnel.stop().await;
        }
        self.set_public_url(None);
    }

    pub(crate) fn next_request_id(&self) -> String {
        format!("req-{}", self.request_seq.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn transformer(&self) -> BodyTransformer {
        let port = self.listen_addr().map(|a| a.port()).unwrap_or_default();
        BodyTransformer::new(&self.target, port, self.public_url().as_ref())
    }

    pub(crate) fn upstream_client(&self) -> reqwest::Client {
        self.client.clone()
    }

    pub(crate) fn reorder_queue(&self) -> Arc<ReorderQueue> {
        Arc::clone(&self.reorder)
    }

    /// Bind the listener and start serving. The preferred port falls back
    /// to an OS-assigned one when taken; the listen address is written
    /// once and the ready signal fires after it is final.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(ProxyError::Internal {
                message: format!("proxy '{}' already running", self.config.id),
            });
        }

        let bind_ip: IpAddr = self.config.bind_address.parse().map_err(|_| ProxyError::Bind {
            addr: self.config.bind_address.clone(),
            message: "invalid bind address".to_string(),
        })?;
        let preferred_port = if self.config.port < 0 {
            crate::util::default_port(&self.config.target_url)
        } else {
            self.config.port as u16
        };

        let preferred = SocketAddr::new(bind_ip, preferred_port);
        let listener = match TcpListener::bind(preferred).await {
            Ok(listener) => listener,
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
                tracing::info!(%preferred, "preferred port taken, falling back to OS-assigned");
                TcpListener::bind(SocketAddr::new(bind_ip, 0)).await.map_err(|e| {
                    ProxyError::Bind { addr: preferred.to_string(), message: e.to_string() }
                })?
            }
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                return Err(ProxyError::Bind {
                    addr: preferred.to_string(),
                    message: e.to_string(),
                });
            }
        };

        let addr = listener.local_addr().map_err(|e| ProxyError::Bind {
            addr: preferred.to_string(),
            message: e.to_string(),
        })?;
        *self.listen_addr.write().expect("listen addr lock poisoned") = Some(addr);

        let instance = Arc::clone(self);
        let handle = tokio::spawn(async move {
            instance.supervise(listener, addr).await;
        });
        *self.serve_task.lock().expect("serve task lock poisoned") = Some(handle);

        // Single-shot: start() can run at most once per instance
        let _ = self.ready_tx.send(true);
        tracing::info!(id = %self.config.id, %addr, target = %self.target, "proxy listening");
        Ok(())
    }

    /// Wait until the listener is bound and accepting.
    pub async fn ready(&self) {
        let mut rx = self.ready_tx.subscribe();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Serve until shutdown; restart crashed serve loops within budget.
    async fn supervise(self: Arc<Self>, first_listener: TcpListener, addr: SocketAddr) {
        let mut listener = Some(first_listener);

        loop {
            let current = match listener.take() {
                Some(listener) => listener,
                None => match TcpListener::bind(addr).await {
                    Ok(listener) => listener,
                    Err(e) => {
                        self.record_error(format!("rebind {addr} failed: {e}"));
                        break;
                    }
                },
            };

            let app = build_router(Arc::clone(&self));
            let mut shutdown_rx = self.shutdown_tx.subscribe();
            let result = axum::serve(
                current,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.changed().await;
            })
            .await;

            let shutting_down = *self.shutdown_tx.borrow();
            let crash = match result {
                Ok(()) if shutting_down => break,
                Ok(()) => "server exited unexpectedly".to_string(),
                Err(e) => e.to_string(),
            };

            if !self.config.auto_restart {
                self.record_error(crash);
                break;
            }

            let window = Duration::from_secs(self.config.restart_window_secs);
            let allowed = {
                let mut history =
                    self.restart_history.lock().expect("restart history lock poisoned");
                restart_allowed(&mut history, Instant::now(), self.config.max_restarts, window)
            };
            if !allowed {
                self.record_error(format!(
                    "max restarts exceeded: {} within {}s (last crash: {crash})",
                    self.config.max_restarts, self.config.restart_window_secs,
                ));
                break;
            }

            tracing::warn!(id = %self.config.id, error = %crash, "serve loop crashed, restarting");
        }

        self.running.store(false, Ordering::SeqCst);
        self.reorder.stop();
    }

    fn record_error(&self, message: String) {
        tracing::error!(id = %self.config.id, error = %message, "proxy stopped");
        *self.last_error.write().expect("last error lock poisoned") = Some(message);
    }

    /// Graceful shutdown; idempotent.
    pub async fn stop(&self) -> Result<()> {
        let _ = self.shutdown_tx.send(true);
        let handle = self.serve_task.lock().expect("serve task lock poisoned").take();
        let mut outcome = Ok(());
        if let Some(handle) = handle {
            // Long-lived connections (the control channel) can hold the
            // graceful shutdown open; cut them loose after the grace period
            let abort = handle.abort_handle();
            if tokio::time::timeout(Duration::from_secs(5), handle).await.is_err() {
                tracing::warn!(id = %self.config.id, "serve task did not stop in time, aborting");
                abort.abort();
                outcome = Err(ProxyError::Internal {
                    message: format!("proxy '{}' did not stop in time", self.config.id),
                });
            }
        }
        self.running.store(false, Ordering::SeqCst);
        self.reorder.stop();
        outcome
    }
}

/// Prune timestamps outside the window and admit the restart if the
/// budget allows, recording it.
pub(crate) fn restart_allowed(
    history: &mut Vec<Instant>,
    now: Instant,
    max_restarts: usize,
    window: Duration,
) -> bool {
    history.retain(|t| now.duration_since(*t) < window);
    if history.len() < max_restarts {
        history.push(now);
        true
    } else {
        false
    }
}

fn build_router(proxy: Arc<ProxyInstance>) -> Router {
    Router::new()
        .route(CONTROL_PATH, get(control_ws_handler))
        .fallback(dispatch_handler)
        .layer(TraceLayer::new_for_http())
        .with_state(EngineState { proxy })
}

async fn control_ws_handler(
    State(state): State<EngineState>,
    upgrade: WebSocketUpgrade,
) -> Response {
    let control = Arc::clone(&state.proxy.control);
    upgrade.on_upgrade(move |socket| control.handle_socket(socket))
}

/// Classify and dispatch everything that is not the control channel.
async fn dispatch_handler(
    State(state): State<EngineState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    request: Request,
) -> Response {
    // The whole control prefix is reserved: never forwarded upstream,
    // never chaos-injected
    if request.uri().path().starts_with(CONTROL_PATH) {
        return axum::http::StatusCode::NOT_FOUND.into_response();
    }
    if ws::is_websocket_upgrade(request.headers()) {
        return ws::proxy_websocket(state.proxy, request).await;
    }
    forward::forward(state.proxy, peer, request).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_restart_budget_allows_up_to_max() {
        let mut history = Vec::new();
        let now = Instant::now();
        let window = Duration::from_secs(60);

        for _ in 0..5 {
            assert!(restart_allowed(&mut history, now, 5, window));
        }
        // The sixth crash within the window must be refused
        assert!(!restart_allowed(&mut history, now, 5, window));
        assert_eq!(history.len(), 5);
    }

    #[test]
    fn test_restart_budget_recovers_after_window() {
        let mut history = Vec::new();
        let start = Instant::now();
        let window = Duration::from_secs(60);

        for _ in 0..5 {
            assert!(restart_allowed(&mut history, start, 5, window));
        }
        assert!(!restart_allowed(&mut history, start, 5, window));

        // Past the window the old timestamps are pruned
        let later = start + Duration::from_secs(61);
        assert!(restart_allowed(&mut history, later, 5, window));
    }

    #[tokio::test]
    async fn test_instance_rejects_bad_target() {
        let config = ProxyConfig::new("p1", "not a url");
        assert!(matches!(
            ProxyInstance::new(config),
            Err(ProxyError::InvalidTarget { .. })
        ));
    }

    #[tokio::test]
    async fn test_instance_rejects_bad_public_url() {
        let mut config = ProxyConfig::new("p1", "http://localhost:3000");
        config.public_url = Some("::nope::".to_string());
        assert!(matches!(
            ProxyInstance::new(config),
            Err(ProxyError::InvalidPublicUrl { .. })
        ));
    }

    #[tokio::test]
    async fn test_start_binds_and_signals_ready() {
        let mut config = ProxyConfig::new("p1", "http://localhost:3000");
        config.port = 0; // OS-assigned directly
        let instance = ProxyInstance::new(config).unwrap();

        instance.start().await.unwrap();
        instance.ready().await;

        let addr = instance.listen_addr().unwrap();
        assert_ne!(addr.port(), 0);
        assert!(instance.is_running());

        instance.stop().await.unwrap();
        assert!(!instance.is_running());
    }

    #[tokio::test]
    async fn test_attach_tunnel_sets_public_url() {
        use crate::bridge::TunnelSupervisor;

        struct FakeTunnel {
            running: AtomicBool,
        }

        #[async_trait::async_trait]
        impl TunnelSupervisor for FakeTunnel {
            async fn start(&self) -> Result<()> {
                self.running.store(true, Ordering::SeqCst);
                Ok(())
            }
            async fn stop(&self) {
                self.running.store(false, Ordering::SeqCst);
            }
            fn public_url(&self) -> Option<String> {
                Some("https://demo.tunnel.example".to_string())
            }
            fn is_running(&self) -> bool {
                self.running.load(Ordering::SeqCst)
            }
        }

        let instance = ProxyInstance::new(ProxyConfig::new("p1", "http://localhost:3000")).unwrap();
        let tunnel = FakeTunnel { running: AtomicBool::new(false) };

        instance.attach_tunnel(&tunnel).await.unwrap();
        assert!(tunnel.is_running());
        assert_eq!(
            instance.public_url().unwrap().as_str(),
            "https://demo.tunnel.example/"
        );

        instance.detach_tunnel(&tunnel).await;
        assert!(!tunnel.is_running());
        assert!(instance.public_url().is_none());
    }

    #[tokio::test]
    async fn test_port_fallback_when_taken() {
        let occupier = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let taken_port = occupier.local_addr().unwrap().port();

        let mut config = ProxyConfig::new("p1", "http://localhost:3000");
        config.port = i32::from(taken_port);
        let instance = ProxyInstance::new(config).unwrap();

        instance.start().await.unwrap();
        instance.ready().await;

        let addr = instance.listen_addr().unwrap();
        assert_ne!(addr.port(), taken_port, "must fall back to another port");

        instance.stop().await.unwrap();
    }
}
