//! # Pagescope Core
//!
//! Data-plane logic for the Pagescope instrumenting proxy.
//!
//! A [`registry::ProxyRegistry`] owns any number of running
//! [`engine::ProxyInstance`]s. Each instance binds a local listener,
//! reverse-proxies HTTP and WebSocket traffic to its target origin,
//! rewrites HTML responses to inject the instrumentation bootstrap script,
//! records everything in a bounded [`traffic::TrafficLog`], correlates
//! requests into [`pages::PageTracker`] sessions, and optionally perturbs
//! traffic through the [`chaos`] layer.

pub mod bridge;
pub mod chaos;
pub mod control;
pub mod engine;
pub mod pages;
pub mod registry;
pub mod traffic;
pub mod transform;
pub mod util;

// Re-export core types
pub use engine::ProxyInstance;
pub use pages::PageTracker;
pub use registry::{ProxyRegistry, StopOutcome};
pub use traffic::{NoopEventBus, TrafficEventBus, TrafficLog};
