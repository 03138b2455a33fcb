//! Page session tracking.
//!
//! Classifies proxied requests into documents and resources, mints a
//! session per document request, and attaches resources and browser
//! telemetry to the right session. Classification is purposely
//! permissive: an extra empty session is tolerable, a resource dropped
//! from its session is not — hence the three-tier matcher (browser-session
//! cookie, then Referer, then most-recent active session on the origin).

use chrono::Utc;
use dashmap::DashMap;
use pagescope_types::models::{
    FrontendErrorData, HttpExchange, InteractionData, MutationData, NavigationEntry, PageSession,
    PerformanceData,
};
use regex::Regex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::Duration;

/// Name of the cookie carrying the browser-session id.
pub const BROWSER_SESSION_COOKIE: &str = "__devtool_sid";

fn resource_ext_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)\.(js|mjs|css|map|png|jpe?g|gif|svg|webp|avif|ico|woff2?|ttf|otf|eot|mp4|webm|ogg|mp3|wav|json|xml|txt|pdf|wasm)$",
        )
        .expect("resource extension regex")
    })
}

fn api_path_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^/(api|rest|_api|ajax|graphql)(/|$)|^/v\d+(/|$)")
            .expect("api path regex")
    })
}

/// Inputs the classifier looks at for one request.
#[derive(Debug, Default)]
pub struct ClassifyInput<'a> {
    pub method: &'a str,
    pub path: &'a str,
    pub content_type: Option<&'a str>,
    pub accept: Option<&'a str>,
    pub x_requested_with: Option<&'a str>,
}

/// Document-vs-resource heuristic.
pub fn is_document(input: &ClassifyInput<'_>) -> bool {
    if let Some(content_type) = input.content_type {
        if content_type.to_ascii_lowercase().contains("text/html") {
            return true;
        }
    }
    let path = input.path.split('?').next().unwrap_or(input.path);
    if path.to_ascii_lowercase().ends_with(".html") {
        return true;
    }
    if !input.method.eq_ignore_ascii_case("GET") {
        return false;
    }
    if resource_ext_pattern().is_match(path) || api_path_pattern().is_match(path) {
        return false;
    }
    if let Some(accept) = input.accept {
        let accept = accept.to_ascii_lowercase();
        if accept.contains("application/json") && !accept.contains("text/html") {
            return false;
        }
    }
    if let Some(requested_with) = input.x_requested_with {
        if requested_with.eq_ignore_ascii_case("XMLHttpRequest") {
            return false;
        }
    }
    true
}

/// Tracks page sessions for one proxy.
pub struct PageTracker {
    sessions: DashMap<String, PageSession>,
    /// normalized document URL -> session id
    url_index: DashMap<String, String>,
    /// `__devtool_sid` cookie value -> session id
    browser_index: DashMap<String, String>,
    next_id: AtomicU64,
    session_timeout: Duration,
    max_sessions: usize,
}

impl PageTracker {
    pub fn new(session_timeout: Duration, max_sessions: usize) -> Self {
        Self {
            sessions: DashMap::new(),
            url_index: DashMap::new(),
            browser_index: DashMap::new(),
            next_id: AtomicU64::new(1),
            session_timeout,
            max_sessions: max_sessions.max(1),
        }
    }

    fn now_ms() -> i64 {
        Utc::now().timestamp_millis()
    }

    fn is_recent(&self, last_activity_ms: i64, now_ms: i64) -> bool {
        now_ms.saturating_sub(last_activity_ms) < self.session_timeout.as_millis() as i64
    }

    /// Deliver one finished HTTP exchange. Documents mint a session;
    /// resources attach to one (or stay log-only if nothing matches).
    pub fn record_http(&self, entry_id: u64, exchange: &HttpExchange) {
        let content_type = exchange
            .response_headers
            .get("content-type")
            .map(String::as_str);
        let path = path_of(&exchange.url);
        let input = ClassifyInput {
            method: &exchange.method,
            path,
            content_type,
            accept: exchange.request_headers.get("accept").map(String::as_str),
            x_requested_with: exchange
                .request_headers
                .get("x-requested-with")
                .map(String::as_str),
        };

        if is_document(&input) {
            self.open_session(entry_id, exchange);
        } else {
            self.attach_resource(entry_id, exchange);
        }
    }

    fn open_session(&self, entry_id: u64, exchange: &HttpExchange) {
        let seq = self.next_id.fetch_add(1, Ordering::Relaxed);
        let id = format!("page-{seq}");
        let now = Self::now_ms();
        let normalized = crate::util::normalize_url(&exchange.url);

        let mut session = PageSession::new(id.clone(), exchange.url.clone(), entry_id, now);

        let sid = cookie_value(
            exchange.request_headers.get("cookie").map(String::as_str),
            BROWSER_SESSION_COOKIE,
        );
        if let Some(sid) = sid {
            // Same browser navigating again: carry the navigation trail over
            if let Some(prev_id) = self.browser_index.get(&sid).map(|r| r.value().clone()) {
                if let Some(prev) = self.sessions.get(&prev_id) {
                    session.navigation = prev.navigation.clone();
                    session.navigation.push(NavigationEntry { url: prev.url.clone(), at: now });
                }
            }
            self.browser_index.insert(sid.clone(), id.clone());
            session.browser_session_id = Some(sid);
        }

        self.url_index.insert(normalized, id.clone());
        self.sessions.insert(id.clone(), session);
        tracing::debug!(session_id = %id, url = %exchange.url, "page session opened");

        self.enforce_session_cap();
    }

    fn enforce_session_cap(&self) {
        while self.sessions.len() > self.max_sessions {
            // Oldest by start time; record its keys before deletion so the
            // indices can be cleaned up afterwards.
            let oldest = self
                .sessions
                .iter()
                .map(|entry| {
                    (
                        entry.key().clone(),
                        entry.started_at,
                        crate::util::normalize_url(&entry.url),
                        entry.browser_session_id.clone(),
                    )
                })
                .min_by_key(|(_, started_at, _, _)| *started_at);

            let Some((id, _, normalized_url, sid)) = oldest else {
                return;
            };

            self.sessions.remove(&id);
            self.url_index.remove_if(&normalized_url, |_, mapped| mapped == &id);
            if let Some(sid) = sid {
                self.browser_index.remove_if(&sid, |_, mapped| mapped == &id);
            }
            tracing::debug!(session_id = %id, "page session evicted (cap reached)");
        }
    }

    fn attach_resource(&self, entry_id: u64, exchange: &HttpExchange) {
        let session_id = self
            .match_by_cookie(exchange)
            .or_else(|| self.match_by_referer(exchange))
            .or_else(|| self.match_by_origin(&exchange.url));

        let Some(session_id) = session_id else {
            return; // stays in the log, unattached
        };
        if let Some(mut session) = self.sessions.get_mut(&session_id) {
            session.resources.push(entry_id);
            session.last_activity = Self::now_ms();
        }
    }

    fn match_by_cookie(&self, exchange: &HttpExchange) -> Option<String> {
        let sid = cookie_value(
            exchange.request_headers.get("cookie").map(String::as_str),
            BROWSER_SESSION_COOKIE,
        )?;
        self.browser_index.get(&sid).map(|r| r.value().clone())
    }

    fn match_by_referer(&self, exchange: &HttpExchange) -> Option<String> {
        let referer = exchange.request_headers.get("referer")?;
        let normalized = crate::util::normalize_url(referer);
        self.url_index.get(&normalized).map(|r| r.value().clone())
    }

    /// Most-recent active session on the same origin.
    fn match_by_origin(&self, url: &str) -> Option<String> {
        let origin = crate::util::url_origin(url)?;
        let now = Self::now_ms();

        self.sessions
            .iter()
            .filter(|entry| {
                self.is_recent(entry.last_activity, now)
                    && crate::util::url_origin(&entry.url).as_deref() == Some(origin.as_str())
            })
            .max_by_key(|entry| entry.last_activity)
            .map(|entry| entry.key().clone())
    }

    /// Session lookup for browser telemetry: explicit browser-session id
    /// first, then the normalized page URL.
    fn find_for_telemetry(&self, url: Option<&str>, session_id: Option<&str>) -> Option<String> {
        if let Some(sid) = session_id {
            if let Some(found) = self.browser_index.get(sid) {
                return Some(found.value().clone());
            }
        }
        let url = url?;
        let normalized = crate::util::normalize_url(url);
        self.url_index.get(&normalized).map(|r| r.value().clone())
    }

    pub fn record_error(
        &self,
        url: Option<&str>,
        session_id: Option<&str>,
        error: FrontendErrorData,
    ) {
        let Some(id) = self.find_for_telemetry(url, session_id) else { return };
        if let Some(mut session) = self.sessions.get_mut(&id) {
            session.push_error(error);
            session.last_activity = Self::now_ms();
        }
    }

    pub fn record_performance(
        &self,
        url: Option<&str>,
        session_id: Option<&str>,
        performance: PerformanceData,
    ) {
        let Some(id) = self.find_for_telemetry(url, session_id) else { return };
        if let Some(mut session) = self.sessions.get_mut(&id) {
            session.performance = Some(performance);
            session.last_activity = Self::now_ms();
        }
    }

    pub fn record_interactions(
        &self,
        url: Option<&str>,
        session_id: Option<&str>,
        interactions: Vec<InteractionData>,
    ) {
        let Some(id) = self.find_for_telemetry(url, session_id) else { return };
        if let Some(mut session) = self.sessions.get_mut(&id) {
            for interaction in interactions {
                session.push_interaction(interaction);
            }
            session.last_activity = Self::now_ms();
        }
    }

    pub fn record_mutations(
        &self,
        url: Option<&str>,
        session_id: Option<&str>,
        mutations: Vec<MutationData>,
    ) {
        let Some(id) = self.find_for_telemetry(url, session_id) else { return };
        if let Some(mut session) = self.sessions.get_mut(&id) {
            for mutation in mutations {
                session.push_mutation(mutation);
            }
            session.last_activity = Self::now_ms();
        }
    }

    pub fn set_title(&self, url: Option<&str>, session_id: Option<&str>, title: String) {
        let Some(id) = self.find_for_telemetry(url, session_id) else { return };
        if let Some(mut session) = self.sessions.get_mut(&id) {
            session.title = Some(title);
        }
    }

    /// Sessions whose last activity is within the timeout. Refreshes the
    /// derived `active` flag on every session as a side effect.
    pub fn get_active(&self) -> Vec<PageSession> {
        let now = Self::now_ms();
        let mut active = Vec::new();
        for mut entry in self.sessions.iter_mut() {
            entry.active = self.is_recent(entry.last_activity, now);
            if entry.active {
                active.push(entry.value().clone());
            }
        }
        active.sort_by_key(|s| s.started_at);
        active
    }

    /// Snapshot of every tracked session, oldest first.
    pub fn all_sessions(&self) -> Vec<PageSession> {
        let mut sessions: Vec<PageSession> =
            self.sessions.iter().map(|entry| entry.value().clone()).collect();
        sessions.sort_by_key(|s| s.started_at);
        sessions
    }

    pub fn get(&self, session_id: &str) -> Option<PageSession> {
        self.sessions.get(session_id).map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn clear(&self) {
        self.sessions.clear();
        self.url_index.clear();
        self.browser_index.clear();
    }
}

fn path_of(url: &str) -> &str {
    let after_scheme = match url.find("://") {
        Some(pos) => &url[pos + 3..],
        None => url,
    };
    match after_scheme.find('/') {
        Some(pos) => &after_scheme[pos..],
        None => "/",
    }
}

/// Extract one cookie value from a `Cookie:` header.
fn cookie_value(header: Option<&str>, name: &str) -> Option<String> {
    let header = header?;
    for pair in header.split(';') {
        let pair = pair.trim();
        if let Some((key, value)) = pair.split_once('=') {
            if key.trim() == name {
                return Some(value.trim().to_string());
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn tracker() -> PageTracker {
        PageTracker::new(Duration::from_secs(300), 100)
    }

    fn document_exchange(url: &str) -> HttpExchange {
        let mut response_headers = HashMap::new();
        response_headers.insert("content-type".to_string(), "text/html".to_string());
        HttpExchange {
            request_id: "req-1".to_string(),
            method: "GET".to_string(),
            url: url.to_string(),
            status: 200,
            response_headers,
            ..Default::default()
        }
    }

    fn resource_exchange(url: &str, referer: Option<&str>) -> HttpExchange {
        let mut request_headers = HashMap::new();
        if let Some(referer) = referer {
            request_headers.insert("referer".to_string(), referer.to_string());
        }
        let mut response_headers = HashMap::new();
        response_headers.insert(
            "content-type".to_string(),
            "application/javascript".to_string(),
        );
        HttpExchange {
            request_id: "req-2".to_string(),
            method: "GET".to_string(),
            url: url.to_string(),
            status: 200,
            request_headers,
            response_headers,
            ..Default::default()
        }
    }

    #[test]
    fn test_classification_table() {
        let cases: &[(&str, &str, Option<&str>, bool)] = &[
            ("GET", "/", Some("text/html"), true),
            ("GET", "/api/users", Some("application/json"), false),
            ("GET", "/page.html", Some("application/octet-stream"), true),
            ("POST", "/api/login", Some("application/json"), false),
            ("GET", "/script.js", Some("application/javascript"), false),
        ];
        for (method, path, content_type, expected) in cases {
            let input = ClassifyInput {
                method,
                path,
                content_type: *content_type,
                ..Default::default()
            };
            assert_eq!(is_document(&input), *expected, "{method} {path}");
        }
    }

    #[test]
    fn test_api_shapes_are_resources() {
        for path in ["/v2/things", "/graphql", "/rest/items", "/_api/x", "/ajax/load"] {
            let input = ClassifyInput { method: "GET", path, ..Default::default() };
            assert!(!is_document(&input), "{path}");
        }
        // but an ordinary GET page is a document
        let input = ClassifyInput { method: "GET", path: "/dashboard", ..Default::default() };
        assert!(is_document(&input));
    }

    #[test]
    fn test_json_preferred_accept_is_resource() {
        let input = ClassifyInput {
            method: "GET",
            path: "/data",
            accept: Some("application/json"),
            ..Default::default()
        };
        assert!(!is_document(&input));

        let browserish = ClassifyInput {
            method: "GET",
            path: "/data",
            accept: Some("text/html,application/json;q=0.9"),
            ..Default::default()
        };
        assert!(is_document(&browserish));
    }

    #[test]
    fn test_session_ids_are_monotonic() {
        let tracker = tracker();
        tracker.record_http(1, &document_exchange("http://host/a"));
        tracker.record_http(2, &document_exchange("http://host/b"));
        tracker.record_http(3, &document_exchange("http://host/c"));

        let sessions = tracker.all_sessions();
        let ids: Vec<&str> = sessions.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["page-1", "page-2", "page-3"]);
    }

    #[test]
    fn test_resource_attaches_via_referer() {
        let tracker = tracker();
        tracker.record_http(1, &document_exchange("http://host/page"));
        tracker.record_http(
            2,
            &resource_exchange("http://host/script.js", Some("http://host/page")),
        );

        let sessions = tracker.all_sessions();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].resources, vec![2]);
    }

    #[test]
    fn test_resource_attaches_via_origin_fallback() {
        let tracker = tracker();
        tracker.record_http(1, &document_exchange("http://host:3000/page"));
        // No referer, no cookie; same origin
        tracker.record_http(2, &resource_exchange("http://host:3000/other.css", None));

        let sessions = tracker.all_sessions();
        assert_eq!(sessions[0].resources, vec![2]);
    }

    #[test]
    fn test_unmatched_resource_stays_unattached() {
        let tracker = tracker();
        tracker.record_http(1, &document_exchange("http://host/page"));
        tracker.record_http(2, &resource_exchange("http://elsewhere/x.js", None));

        let sessions = tracker.all_sessions();
        assert!(sessions[0].resources.is_empty());
    }

    #[test]
    fn test_cookie_match_beats_referer() {
        let tracker = tracker();

        let mut doc_a = document_exchange("http://host/a");
        doc_a
            .request_headers
            .insert("cookie".to_string(), "__devtool_sid=sid-1".to_string());
        tracker.record_http(1, &doc_a);
        tracker.record_http(2, &document_exchange("http://host/b"));

        // Referer points at /b but the cookie pins the resource to /a's session
        let mut resource = resource_exchange("http://host/app.js", Some("http://host/b"));
        resource
            .request_headers
            .insert("cookie".to_string(), "__devtool_sid=sid-1".to_string());
        tracker.record_http(3, &resource);

        let a = tracker.get("page-1").unwrap();
        let b = tracker.get("page-2").unwrap();
        assert_eq!(a.resources, vec![3]);
        assert!(b.resources.is_empty());
    }

    #[test]
    fn test_error_and_interaction_routing() {
        let tracker = tracker();
        tracker.record_http(1, &document_exchange("http://host/page"));

        tracker.record_error(
            Some("http://host/page"),
            None,
            FrontendErrorData { message: "boom".to_string(), ..Default::default() },
        );
        tracker.record_interactions(
            Some("http://host/page#section"),
            None,
            vec![InteractionData { kind: "click".to_string(), ..Default::default() }],
        );

        let session = tracker.get("page-1").unwrap();
        assert_eq!(session.errors.len(), 1);
        assert_eq!(session.interactions.len(), 1);
        assert_eq!(session.interaction_count, 1);
    }

    #[test]
    fn test_session_cap_evicts_oldest_and_cleans_index() {
        let tracker = PageTracker::new(Duration::from_secs(300), 3);
        for i in 0..5 {
            tracker.record_http(i, &document_exchange(&format!("http://host/p{i}")));
        }

        assert_eq!(tracker.len(), 3);
        assert!(tracker.get("page-1").is_none());
        assert!(tracker.get("page-2").is_none());

        // Evicted sessions' URLs no longer route telemetry anywhere
        tracker.record_error(
            Some("http://host/p0"),
            None,
            FrontendErrorData { message: "late".to_string(), ..Default::default() },
        );
        for session in tracker.all_sessions() {
            assert!(session.errors.is_empty());
        }
    }

    #[test]
    fn test_get_active_and_clear() {
        let tracker = tracker();
        tracker.record_http(1, &document_exchange("http://host/page"));

        let active = tracker.get_active();
        assert_eq!(active.len(), 1);
        assert!(active[0].active);
        assert!(active[0].url.ends_with("/page"));

        tracker.clear();
        assert!(tracker.is_empty());
        assert!(tracker.get_active().is_empty());
    }
}
