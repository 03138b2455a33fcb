//! Chaos rule set and per-request decisions.

use pagescope_types::models::{ChaosRule, ChaosRuleKind};
use rand::Rng;
use regex::Regex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::Duration;

/// Reorder hold parameters, from the first reorder rule in the set.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReorderParams {
    pub min_hold: usize,
    pub max_wait: Duration,
}

impl Default for ReorderParams {
    fn default() -> Self {
        Self { min_hold: 2, max_wait: Duration::from_millis(500) }
    }
}

/// Slow-drip pacing parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SlowDripParams {
    pub bytes_per_ms: u64,
    pub chunk_size: usize,
}

/// Connection-drop placement parameters. The effective drop point is
/// `after_bytes` if positive, else `expected_size * after_percent`, else
/// half the expected size.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct DropParams {
    pub after_percent: f64,
    pub after_bytes: u64,
}

impl DropParams {
    pub fn drop_point(&self, expected_size: u64) -> u64 {
        if self.after_bytes > 0 {
            self.after_bytes
        } else if self.after_percent > 0.0 {
            (expected_size as f64 * self.after_percent) as u64
        } else {
            expected_size / 2
        }
    }
}

/// Everything the chaos layer decided for one request.
///
/// At most one rule of each kind applies; the first matching rule whose
/// probability fires wins for its kind.
#[derive(Debug, Clone, Default)]
pub struct ChaosDecision {
    pub http_error: Option<(u16, String)>,
    pub packet_loss: bool,
    pub stale_delay: Option<Duration>,
    pub delay: Option<Duration>,
    pub reorder: Option<ReorderParams>,
    pub slow_drip: Option<SlowDripParams>,
    pub connection_drop: Option<DropParams>,
    pub truncate_percent: Option<f64>,
}

impl ChaosDecision {
    pub fn is_noop(&self) -> bool {
        self.http_error.is_none()
            && !self.packet_loss
            && self.stale_delay.is_none()
            && self.delay.is_none()
            && self.reorder.is_none()
            && self.slow_drip.is_none()
            && self.connection_drop.is_none()
            && self.truncate_percent.is_none()
    }

    /// Whether any response-side decorator applies.
    pub fn shapes_response(&self) -> bool {
        self.slow_drip.is_some()
            || self.connection_drop.is_some()
            || self.truncate_percent.is_some()
    }
}

enum PatternMatcher {
    Substring(String),
    Glob(Regex),
}

impl PatternMatcher {
    fn compile(pattern: &str) -> Self {
        if pattern.contains('*') {
            let mut regex = String::with_capacity(pattern.len() + 8);
            regex.push('^');
            for ch in pattern.chars() {
                match ch {
                    '*' => regex.push_str(".*"),
                    c if "\\.+?()[]{}|^$".contains(c) => {
                        regex.push('\\');
                        regex.push(c);
                    }
                    c => regex.push(c),
                }
            }
            regex.push('$');
            match Regex::new(&regex) {
                Ok(re) => Self::Glob(re),
                // An unparseable glob never matches
                Err(_) => Self::Substring(format!("\u{0}{pattern}")),
            }
        } else {
            Self::Substring(pattern.to_string())
        }
    }

    fn matches(&self, path: &str, url: &str) -> bool {
        match self {
            Self::Substring(needle) => path.contains(needle) || url.contains(needle),
            Self::Glob(re) => re.is_match(path) || re.is_match(url),
        }
    }
}

struct CompiledRule {
    rule: ChaosRule,
    matcher: PatternMatcher,
}

/// Hot-reloadable chaos rule set for one proxy.
pub struct ChaosRuleset {
    rules: RwLock<Vec<CompiledRule>>,
    reordered_requests: AtomicU64,
}

impl Default for ChaosRuleset {
    fn default() -> Self {
        Self::new()
    }
}

impl ChaosRuleset {
    pub fn new() -> Self {
        Self { rules: RwLock::new(Vec::new()), reordered_requests: AtomicU64::new(0) }
    }

    pub fn set_rules(&self, rules: Vec<ChaosRule>) {
        let compiled = rules
            .into_iter()
            .map(|rule| CompiledRule { matcher: PatternMatcher::compile(&rule.pattern), rule })
            .collect();
        *self.rules.write().expect("chaos rules lock poisoned") = compiled;
    }

    pub fn add_rule(&self, rule: ChaosRule) {
        let compiled = CompiledRule { matcher: PatternMatcher::compile(&rule.pattern), rule };
        self.rules.write().expect("chaos rules lock poisoned").push(compiled);
    }

    pub fn clear(&self) {
        self.rules.write().expect("chaos rules lock poisoned").clear();
    }

    pub fn rules(&self) -> Vec<ChaosRule> {
        self.rules
            .read()
            .expect("chaos rules lock poisoned")
            .iter()
            .map(|c| c.rule.clone())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.read().expect("chaos rules lock poisoned").is_empty()
    }

    /// Count of requests routed through the reorder queue.
    pub fn reordered_requests(&self) -> u64 {
        self.reordered_requests.load(Ordering::Relaxed)
    }

    pub(crate) fn count_reordered(&self) {
        self.reordered_requests.fetch_add(1, Ordering::Relaxed);
    }

    /// Hold parameters from the first reorder rule, if any.
    pub fn reorder_params(&self) -> Option<ReorderParams> {
        let rules = self.rules.read().expect("chaos rules lock poisoned");
        rules.iter().find(|c| c.rule.kind == ChaosRuleKind::Reorder).map(|c| {
            let defaults = ReorderParams::default();
            ReorderParams {
                min_hold: c.rule.min_hold.unwrap_or(defaults.min_hold),
                max_wait: c
                    .rule
                    .max_wait_ms
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.max_wait),
            }
        })
    }

    /// Roll every matching rule and collect the effects for this request.
    pub fn decide(&self, method: &str, path: &str, url: &str) -> ChaosDecision {
        let rules = self.rules.read().expect("chaos rules lock poisoned");
        let mut decision = ChaosDecision::default();
        if rules.is_empty() {
            return decision;
        }

        let mut rng = rand::thread_rng();
        for compiled in rules.iter() {
            let rule = &compiled.rule;
            if let Some(rule_method) = &rule.method {
                if !rule_method.is_empty() && !rule_method.eq_ignore_ascii_case(method) {
                    continue;
                }
            }
            if !compiled.matcher.matches(path, url) {
                continue;
            }
            if rule.probability < 1.0 && rng.gen::<f64>() >= rule.probability {
                continue;
            }

            match rule.kind {
                ChaosRuleKind::HttpError => {
                    if decision.http_error.is_none() {
                        decision.http_error = Some((
                            rule.status.unwrap_or(500),
                            rule.body.clone().unwrap_or_else(|| "chaos error".to_string()),
                        ));
                    }
                }
                ChaosRuleKind::PacketLoss => decision.packet_loss = true,
                ChaosRuleKind::StaleLatency => {
                    if decision.stale_delay.is_none() {
                        decision.stale_delay =
                            Some(Duration::from_millis(rule.delay_ms.unwrap_or(0)));
                    }
                }
                ChaosRuleKind::Latency => {
                    if decision.delay.is_none() {
                        decision.delay = Some(Duration::from_millis(rule.delay_ms.unwrap_or(0)));
                    }
                }
                ChaosRuleKind::Reorder => {
                    if decision.reorder.is_none() {
                        let defaults = ReorderParams::default();
                        decision.reorder = Some(ReorderParams {
                            min_hold: rule.min_hold.unwrap_or(defaults.min_hold),
                            max_wait: rule
                                .max_wait_ms
                                .map(Duration::from_millis)
                                .unwrap_or(defaults.max_wait),
                        });
                    }
                }
                ChaosRuleKind::SlowDrip => {
                    if decision.slow_drip.is_none() {
                        decision.slow_drip = Some(SlowDripParams {
                            bytes_per_ms: rule.bytes_per_ms.unwrap_or(10).max(1),
                            chunk_size: rule.chunk_size.unwrap_or(1024).max(1),
                        });
                    }
                }
                ChaosRuleKind::ConnectionDrop => {
                    if decision.connection_drop.is_none() {
                        decision.connection_drop = Some(DropParams {
                            after_percent: rule.drop_after_percent.unwrap_or(0.0),
                            after_bytes: rule.drop_after_bytes.unwrap_or(0),
                        });
                    }
                }
                ChaosRuleKind::Truncation => {
                    if decision.truncate_percent.is_none() {
                        decision.truncate_percent = Some(rule.truncate_percent.unwrap_or(0.5));
                    }
                }
            }
        }

        decision
    }
}
