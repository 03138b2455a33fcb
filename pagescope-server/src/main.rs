//! Pagescope Server - Headless Daemon
//!
//! A pure Rust instrumenting reverse proxy for local web development:
//! point it at a dev server and browse through the derived local port.
//! HTML responses come back instrumented, traffic lands in the in-memory
//! log, and chaos rules can be layered on for resilience testing.
//!
//! Usage: pagescope-server http://localhost:3000

use anyhow::Result;
use clap::Parser;
use pagescope_core::ProxyRegistry;
use pagescope_types::ProxyConfig;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "pagescope-server", about = "Instrumenting reverse proxy for local web development")]
struct Args {
    /// Target origin to proxy, e.g. http://localhost:3000
    target: String,

    /// Listen port; -1 derives a stable port from the target URL
    #[arg(long, default_value_t = -1)]
    port: i32,

    /// Bind address
    #[arg(long, default_value = "127.0.0.1")]
    bind: String,

    /// Public URL to rewrite pages against when a tunnel fronts this proxy
    #[arg(long)]
    public_url: Option<String>,

    /// Working directory to associate with this proxy
    #[arg(long, default_value = "")]
    working_dir: String,

    /// Log filter, e.g. info or pagescope_core=debug
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
        )
        .init();

    tracing::info!("Pagescope server starting...");

    let mut config = ProxyConfig::new(format!("proxy-{}", uuid::Uuid::new_v4()), &args.target);
    config.port = args.port;
    config.bind_address = args.bind.clone();
    config.public_url = args.public_url.clone();
    config.working_dir = args.working_dir.clone();

    let registry = ProxyRegistry::new();
    let instance = registry
        .create(config)
        .await
        .map_err(|e| anyhow::anyhow!("failed to start proxy: {e}"))?;
    instance.ready().await;

    let addr = instance
        .listen_addr()
        .ok_or_else(|| anyhow::anyhow!("proxy reported ready without a listen address"))?;
    tracing::info!("Proxying http://localhost:{} -> {}", addr.port(), args.target);
    tracing::info!("Control channel at ws://localhost:{}{}", addr.port(), pagescope_core::engine::CONTROL_PATH);

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down...");

    let outcome = registry.shutdown().await;
    if let Some(error) = outcome.error() {
        tracing::warn!(%error, "shutdown finished with errors");
    }
    Ok(())
}
