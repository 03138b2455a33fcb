//! Seams for external collaborators.
//!
//! The data plane only ever talks to these traits; the concrete tunnel
//! process wrapper, session daemon client, voice transcription bridge and
//! audit writer live outside this crate and are injected at wiring time.

use async_trait::async_trait;
use bytes::Bytes;
use pagescope_types::Result;
use serde_json::Value;

/// Child-process tunnel wrapper (ngrok/cloudflared/tailscale style).
/// The engine only starts it, stops it, and reads the public URL.
#[async_trait]
pub trait TunnelSupervisor: Send + Sync {
    async fn start(&self) -> Result<()>;
    async fn stop(&self);
    fn public_url(&self) -> Option<String>;
    fn is_running(&self) -> bool;
}

/// Short-lived client for the external session daemon.
#[async_trait]
pub trait SessionClient: Send + Sync {
    async fn list(&self) -> Result<Value>;
    async fn get(&self, id: &str) -> Result<Value>;
    async fn send(&self, payload: Value) -> Result<Value>;
    async fn schedule(&self, payload: Value) -> Result<Value>;
    async fn tasks(&self) -> Result<Value>;
    async fn cancel(&self, id: &str) -> Result<Value>;
    async fn close(&self);
}

/// Factory producing a fresh [`SessionClient`] per browser request.
#[async_trait]
pub trait SessionClientFactory: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn SessionClient>>;
}

/// Live voice-transcription session bound to one control-channel
/// connection; binary frames are fed to it while it exists.
#[async_trait]
pub trait VoiceSession: Send + Sync {
    async fn send(&self, audio: Bytes) -> Result<()>;
    async fn close(&self);
}

/// Opens [`VoiceSession`]s against the external speech API.
#[async_trait]
pub trait VoiceBridge: Send + Sync {
    async fn open(&self, connection_id: &str, config: Value) -> Result<Box<dyn VoiceSession>>;
}

/// Out-of-band audit report writer; never on the hot path.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn write_report(&self, report_type: &str, label: &str, payload: &Value) -> Result<()>;
}
