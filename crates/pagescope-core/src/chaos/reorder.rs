//! Reorder queue: hold concurrent requests, release the batch shuffled.
//!
//! One queue exists per proxy. Submitted requests park in a pending list;
//! the batch is released when the list reaches `min_hold`, or when the
//! background sweeper (100 ms tick) finds an element held past `max_wait`.
//! A release drains the whole batch, shuffles it, and executes every
//! round-trip in its own task. Within a batch completion order is random;
//! batch boundaries are respected across batches.

use super::rules::ReorderParams;
use super::ChaosRuleset;
use pagescope_types::{ProxyError, Result};
use rand::seq::SliceRandom;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, watch};

const SWEEP_INTERVAL: Duration = Duration::from_millis(100);

struct PendingSlot {
    token: u64,
    submitted_at: Instant,
    client: reqwest::Client,
    request: reqwest::Request,
    tx: oneshot::Sender<Result<reqwest::Response>>,
}

struct QueueInner {
    pending: Mutex<Vec<PendingSlot>>,
    next_token: AtomicU64,
    params: Mutex<ReorderParams>,
    ruleset: Arc<ChaosRuleset>,
    shutdown_tx: watch::Sender<bool>,
}

/// Removes the pending slot if the submitter's future is dropped before
/// the batch is released.
struct SlotGuard {
    inner: Arc<QueueInner>,
    token: u64,
    armed: bool,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        if self.armed {
            let mut pending = self.inner.pending.lock().expect("reorder lock poisoned");
            pending.retain(|slot| slot.token != self.token);
        }
    }
}

/// Hold-and-shuffle-release queue for one proxy.
pub struct ReorderQueue {
    inner: Arc<QueueInner>,
}

impl ReorderQueue {
    /// Create the queue and start its sweeper task.
    pub fn new(ruleset: Arc<ChaosRuleset>) -> Arc<Self> {
        let (shutdown_tx, _) = watch::channel(false);
        let inner = Arc::new(QueueInner {
            pending: Mutex::new(Vec::new()),
            next_token: AtomicU64::new(1),
            params: Mutex::new(ReorderParams::default()),
            ruleset,
            shutdown_tx,
        });

        let queue = Arc::new(Self { inner: Arc::clone(&inner) });
        queue.spawn_sweeper();
        queue
    }

    fn spawn_sweeper(&self) {
        let inner = Arc::clone(&self.inner);
        let mut shutdown_rx = inner.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut tick = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        let max_wait = inner.params.lock().expect("reorder lock poisoned").max_wait;
                        let overdue = {
                            let pending = inner.pending.lock().expect("reorder lock poisoned");
                            pending.iter().any(|slot| slot.submitted_at.elapsed() > max_wait)
                        };
                        if overdue {
                            Self::release(&inner);
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        tracing::debug!("reorder sweeper shutting down, releasing stragglers");
                        Self::release(&inner);
                        break;
                    }
                }
            }
        });
    }

    /// Park a request until its batch is released; returns this request's
    /// own round-trip outcome.
    ///
    /// `params` come from the first reorder rule in the ruleset at the
    /// time of submission and update the queue's hold configuration.
    pub async fn submit(
        &self,
        client: reqwest::Client,
        request: reqwest::Request,
        params: ReorderParams,
    ) -> Result<reqwest::Response> {
        let (tx, rx) = oneshot::channel();
        let token = self.inner.next_token.fetch_add(1, Ordering::Relaxed);

        let should_release = {
            *self.inner.params.lock().expect("reorder lock poisoned") = params;
            let mut pending = self.inner.pending.lock().expect("reorder lock poisoned");
            pending.push(PendingSlot { token, submitted_at: Instant::now(), client, request, tx });
            pending.len() >= params.min_hold.max(1)
        };

        if should_release {
            Self::release(&self.inner);
        }

        let mut guard = SlotGuard { inner: Arc::clone(&self.inner), token, armed: true };
        match rx.await {
            Ok(result) => {
                guard.armed = false;
                result
            }
            // The queue shut down with this slot still parked and unsent
            Err(_) => {
                guard.armed = false;
                Err(ProxyError::Canceled)
            }
        }
    }

    /// Drain the batch, shuffle it, and execute each round-trip in parallel.
    fn release(inner: &Arc<QueueInner>) {
        let mut batch = {
            let mut pending = inner.pending.lock().expect("reorder lock poisoned");
            std::mem::take(&mut *pending)
        };
        if batch.is_empty() {
            return;
        }

        batch.shuffle(&mut rand::thread_rng());
        tracing::debug!(batch_size = batch.len(), "releasing reorder batch");

        for slot in batch {
            inner.ruleset.count_reordered();
            tokio::spawn(async move {
                let result = slot
                    .client
                    .execute(slot.request)
                    .await
                    .map_err(|e| ProxyError::UpstreamUnavailable { message: e.to_string() });
                // Submitter may have gone away; the response is discarded then
                let _ = slot.tx.send(result);
            });
        }
    }

    /// Stop the sweeper; any parked requests are released immediately.
    pub fn stop(&self) {
        let _ = self.inner.shutdown_tx.send(true);
    }
}

impl Drop for ReorderQueue {
    fn drop(&mut self) {
        let _ = self.inner.shutdown_tx.send(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(min_hold: usize, max_wait_ms: u64) -> ReorderParams {
        ReorderParams { min_hold, max_wait: Duration::from_millis(max_wait_ms) }
    }

    async fn start_origin() -> wiremock::MockServer {
        use wiremock::matchers::method;
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(|req: &wiremock::Request| {
                ResponseTemplate::new(200).set_body_string(req.url.path().to_string())
            })
            .mount(&server)
            .await;
        server
    }

    #[tokio::test]
    async fn test_batch_release_matches_each_submitter() {
        let origin = start_origin().await;
        let ruleset = Arc::new(ChaosRuleset::new());
        let queue = ReorderQueue::new(Arc::clone(&ruleset));
        let client = reqwest::Client::new();

        let mut handles = Vec::new();
        for i in 0..3 {
            let queue = Arc::clone(&queue);
            let client = client.clone();
            let url = format!("{}/item-{}", origin.uri(), i);
            handles.push(tokio::spawn(async move {
                let request = client.get(&url).build().unwrap();
                let response = queue.submit(client, request, params(3, 1000)).await.unwrap();
                response.text().await.unwrap()
            }));
        }

        let mut bodies = Vec::new();
        for handle in handles {
            bodies.push(handle.await.unwrap());
        }
        bodies.sort();
        assert_eq!(bodies, vec!["/item-0", "/item-1", "/item-2"]);
        assert_eq!(ruleset.reordered_requests(), 3);
    }

    #[tokio::test]
    async fn test_sweeper_releases_undersized_batch() {
        let origin = start_origin().await;
        let ruleset = Arc::new(ChaosRuleset::new());
        let queue = ReorderQueue::new(ruleset);
        let client = reqwest::Client::new();

        let request = client.get(format!("{}/lonely", origin.uri())).build().unwrap();
        let started = Instant::now();
        // min_hold of 5 is never reached; the sweeper must fire at max_wait
        let response = queue.submit(client, request, params(5, 200)).await.unwrap();
        assert_eq!(response.status(), 200);
        assert!(started.elapsed() >= Duration::from_millis(200));
    }

    #[tokio::test]
    async fn test_stop_releases_stragglers() {
        let origin = start_origin().await;
        let ruleset = Arc::new(ChaosRuleset::new());
        let queue = ReorderQueue::new(ruleset);
        let client = reqwest::Client::new();

        let request = client.get(format!("{}/straggler", origin.uri())).build().unwrap();
        let submit = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.submit(client, request, params(10, 60_000)).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        queue.stop();

        let result = submit.await.unwrap();
        assert_eq!(result.unwrap().status(), 200);
    }
}
