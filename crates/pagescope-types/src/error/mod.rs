//! Typed error definitions for Pagescope.
//!
//! All errors are designed to be:
//!
//! - **Serializable** for API responses via serde
//! - **Displayable** for logging via Display trait
//! - **Matchable** for error handling logic via enum variants

mod proxy;

pub use proxy::ProxyError;

/// Standard Result type using ProxyError.
pub type Result<T> = std::result::Result<T, ProxyError>;
