//! Registry of running proxy instances.
//!
//! Keyed by id; high-read-rate lookups with occasional insert/delete.
//! `shutdown` is idempotent and blocks further creates; `stop_all` does
//! not (session-scoped cleanup keeps the registry usable). Fleet stops
//! fan out concurrently and always report partial progress, even when the
//! caller cancels mid-way.

use crate::engine::ProxyInstance;
use dashmap::DashMap;
use pagescope_types::{ProxyConfig, ProxyError, Result};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinSet;

/// Partial-progress result of a fleet stop.
#[derive(Debug, Default)]
pub struct StopOutcome {
    /// Ids stopped successfully, in completion order
    pub stopped: Vec<String>,
    /// Per-instance failures
    pub failed: Vec<(String, ProxyError)>,
    /// True when the caller's cancellation ended the operation early
    pub canceled: bool,
}

impl StopOutcome {
    /// Combined error, if anything went wrong.
    pub fn error(&self) -> Option<ProxyError> {
        if self.canceled {
            return Some(ProxyError::Canceled);
        }
        if self.failed.is_empty() {
            return None;
        }
        let combined = self
            .failed
            .iter()
            .map(|(id, e)| format!("{id}: {e}"))
            .collect::<Vec<_>>()
            .join("; ");
        Some(ProxyError::Internal { message: combined })
    }
}

/// Id-keyed map of running proxies.
pub struct ProxyRegistry {
    proxies: DashMap<String, Arc<ProxyInstance>>,
    shutting_down: AtomicBool,
    created_total: AtomicU64,
}

impl Default for ProxyRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ProxyRegistry {
    pub fn new() -> Self {
        Self {
            proxies: DashMap::new(),
            shutting_down: AtomicBool::new(false),
            created_total: AtomicU64::new(0),
        }
    }

    /// Create and start a proxy. Rejects duplicate ids and creates during
    /// shutdown; a failed start leaves no trace in the registry.
    pub async fn create(&self, config: ProxyConfig) -> Result<Arc<ProxyInstance>> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(ProxyError::ShuttingDown);
        }

        let id = config.id.clone();
        let instance = ProxyInstance::new(config)?;

        match self.proxies.entry(id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(ProxyError::DuplicateId { id });
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&instance));
            }
        }

        if let Err(e) = instance.start().await {
            self.proxies.remove(&id);
            return Err(e);
        }

        self.created_total.fetch_add(1, Ordering::Relaxed);
        Ok(instance)
    }

    pub fn get(&self, id: &str) -> Option<Arc<ProxyInstance>> {
        self.proxies.get(id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn list(&self) -> Vec<Arc<ProxyInstance>> {
        self.proxies.iter().map(|entry| Arc::clone(entry.value())).collect()
    }

    pub fn len(&self) -> usize {
        self.proxies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.proxies.is_empty()
    }

    pub fn created_total(&self) -> u64 {
        self.created_total.load(Ordering::Relaxed)
    }

    /// Stop and remove one proxy.
    pub async fn stop(&self, id: &str) -> Result<()> {
        let Some((_, instance)) = self.proxies.remove(id) else {
            return Err(ProxyError::NotFound { id: id.to_string() });
        };
        instance.stop().await
    }

    /// Stop every proxy. Does not block future creates.
    pub async fn stop_all(&self, cancel: Option<watch::Receiver<bool>>) -> StopOutcome {
        let ids: Vec<String> = self.proxies.iter().map(|entry| entry.key().clone()).collect();
        self.stop_many(ids, cancel).await
    }

    /// Stop every proxy associated with a working directory.
    pub async fn stop_by_path(
        &self,
        path: &str,
        cancel: Option<watch::Receiver<bool>>,
    ) -> StopOutcome {
        let ids: Vec<String> = self
            .proxies
            .iter()
            .filter(|entry| entry.value().config().working_dir == path)
            .map(|entry| entry.key().clone())
            .collect();
        self.stop_many(ids, cancel).await
    }

    /// Idempotent full shutdown: flips the shutting-down flag (blocking
    /// further creates) and stops everything.
    pub async fn shutdown(&self) -> StopOutcome {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return StopOutcome::default();
        }
        self.stop_all(None).await
    }

    async fn stop_many(
        &self,
        ids: Vec<String>,
        mut cancel: Option<watch::Receiver<bool>>,
    ) -> StopOutcome {
        let mut outcome = StopOutcome::default();
        let mut join_set: JoinSet<(String, Result<()>)> = JoinSet::new();

        for id in ids {
            let Some(instance) = self.get(&id) else { continue };
            join_set.spawn(async move {
                let result = instance.stop().await;
                (id, result)
            });
        }

        loop {
            tokio::select! {
                biased;
                _ = wait_canceled(&mut cancel) => {
                    // Return what has been accomplished so far
                    outcome.canceled = true;
                    join_set.abort_all();
                    break;
                }
                joined = join_set.join_next() => {
                    match joined {
                        Some(Ok((id, Ok(())))) => {
                            self.proxies.remove(&id);
                            outcome.stopped.push(id);
                        }
                        Some(Ok((id, Err(e)))) => {
                            self.proxies.remove(&id);
                            outcome.failed.push((id, e));
                        }
                        Some(Err(join_error)) => {
                            outcome.failed.push((
                                "<unknown>".to_string(),
                                ProxyError::Internal { message: join_error.to_string() },
                            ));
                        }
                        None => break,
                    }
                }
            }
        }

        outcome
    }
}

async fn wait_canceled(cancel: &mut Option<watch::Receiver<bool>>) {
    match cancel {
        Some(rx) => {
            // Either a true value or a dropped sender counts as cancellation
            loop {
                if *rx.borrow() {
                    return;
                }
                if rx.changed().await.is_err() {
                    return;
                }
            }
        }
        None => std::future::pending().await,
    }
}
