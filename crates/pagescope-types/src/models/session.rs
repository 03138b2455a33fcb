//! Page session models.
//!
//! A page session aggregates one document request with the resource
//! requests and browser telemetry that belong to the same page view.
//! Interaction and mutation histories are sliding windows of the most
//! recent N entries; the lifetime counters keep counting past the window.

use super::traffic::{FrontendErrorData, InteractionData, MutationData, PerformanceData};
use serde::{Deserialize, Serialize};

/// Sliding-window cap for interactions kept on a session.
pub const INTERACTION_WINDOW: usize = 200;
/// Sliding-window cap for mutations kept on a session.
pub const MUTATION_WINDOW: usize = 100;

/// One entry of a session's navigation history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NavigationEntry {
    pub url: String,
    /// Unix milliseconds
    pub at: i64,
}

/// One tracked page view and everything attached to it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PageSession {
    /// `page-<N>`, N monotonic per proxy
    pub id: String,
    /// Canonical URL of the document request
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Unix milliseconds
    pub started_at: i64,
    /// Unix milliseconds, touched by every attached record
    pub last_activity: i64,
    /// Traffic-log entry id of the document request
    pub document_entry_id: u64,
    /// Traffic-log entry ids of attached resource requests
    #[serde(default)]
    pub resources: Vec<u64>,
    #[serde(default)]
    pub errors: Vec<FrontendErrorData>,
    #[serde(default)]
    pub interactions: Vec<InteractionData>,
    #[serde(default)]
    pub mutations: Vec<MutationData>,
    /// Lifetime totals; may exceed the window lengths above
    #[serde(default)]
    pub interaction_count: u64,
    #[serde(default)]
    pub mutation_count: u64,
    #[serde(default)]
    pub error_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub performance: Option<PerformanceData>,
    /// Derived: `now - last_activity < session_timeout`
    #[serde(default)]
    pub active: bool,
    /// Browser session id from the `__devtool_sid` cookie, when present
    #[serde(skip_serializing_if = "Option::is_none")]
    pub browser_session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub navigation: Vec<NavigationEntry>,
}

impl PageSession {
    pub fn new(id: String, url: String, document_entry_id: u64, now_ms: i64) -> Self {
        Self {
            id,
            url,
            title: None,
            started_at: now_ms,
            last_activity: now_ms,
            document_entry_id,
            resources: Vec::new(),
            errors: Vec::new(),
            interactions: Vec::new(),
            mutations: Vec::new(),
            interaction_count: 0,
            mutation_count: 0,
            error_count: 0,
            performance: None,
            active: true,
            browser_session_id: None,
            navigation: Vec::new(),
        }
    }

    /// Append an interaction, keeping the most-recent window.
    pub fn push_interaction(&mut self, interaction: InteractionData) {
        if self.interactions.len() >= INTERACTION_WINDOW {
            self.interactions.remove(0);
        }
        self.interactions.push(interaction);
        self.interaction_count += 1;
    }

    /// Append a mutation, keeping the most-recent window.
    pub fn push_mutation(&mut self, mutation: MutationData) {
        if self.mutations.len() >= MUTATION_WINDOW {
            self.mutations.remove(0);
        }
        self.mutations.push(mutation);
        self.mutation_count += 1;
    }

    pub fn push_error(&mut self, error: FrontendErrorData) {
        self.errors.push(error);
        self.error_count += 1;
    }
}
