//! # Pagescope Types
//!
//! Core types, models, and error definitions for Pagescope.
//!
//! This crate provides the foundational type system for the Pagescope
//! instrumenting proxy:
//!
//! - **`error`** - Typed error hierarchy for proxy and configuration failures
//! - **`models`** - Domain models (ProxyConfig, TrafficEntry, PageSession, ChaosRule)
//! - **`protocol`** - Control-channel wire message types
//!
//! ## Architecture Role
//!
//! `pagescope-types` sits at the bottom of the dependency graph:
//!
//! ```text
//!         pagescope-types (this crate)
//!                 │
//!                 ▼
//!          pagescope-core
//!                 │
//!                 ▼
//!         pagescope-server
//! ```
//!
//! All types are designed to be:
//! - **Serializable** via serde for API/IPC
//! - **Clone** for cheap sharing across async boundaries
//! - **PartialEq** where testing needs comparison

pub mod error;
pub mod models;
pub mod protocol;

// Re-export error types for convenience
pub use error::{ProxyError, Result};

// Re-export core model types
pub use models::{
    ChaosRule, ChaosRuleKind, HttpExchange, NavigationEntry, PageSession, ProxyConfig,
    TrafficEntry, TrafficKind, TrafficPayload, TrafficStats,
};
