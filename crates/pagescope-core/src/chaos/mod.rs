//! Chaos injection: pattern-matched, probabilistic traffic perturbation.
//!
//! Request-side kinds (packet loss, latency, reorder) run in
//! [`transport`] around the upstream round-trip; response-side kinds
//! (slow drip, connection drop, truncation) wrap the response body stream
//! in [`body`]. Synthetic HTTP errors are applied at classification time
//! in the engine, before the origin is ever contacted.

pub mod body;
pub mod reorder;
pub mod rules;
pub mod transport;

pub use reorder::ReorderQueue;
pub use rules::{ChaosDecision, ChaosRuleset, DropParams, ReorderParams, SlowDripParams};
