//! Traffic log: bounded in-memory ring of typed entries.
//!
//! Entry ids are monotonic per proxy. When the ring is full the oldest
//! entries are evicted. Reads return snapshots; there are no iterators
//! over live state.

use chrono::Utc;
use pagescope_types::models::{TrafficEntry, TrafficKind, TrafficPayload, TrafficStats};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Trait for event bus implementations to observe new entries.
/// Different frontends (admin API, TUI, …) can implement this.
pub trait TrafficEventBus: Send + Sync {
    fn emit_entry(&self, entry: &TrafficEntry);
}

/// A no-op event bus for headless mode.
pub struct NoopEventBus;

impl TrafficEventBus for NoopEventBus {
    fn emit_entry(&self, _entry: &TrafficEntry) {
        // No-op
    }
}

/// Bounded ring of traffic entries with aggregate stats.
pub struct TrafficLog {
    entries: RwLock<VecDeque<TrafficEntry>>,
    next_id: AtomicU64,
    capacity: usize,
    stats: RwLock<TrafficStats>,
    event_bus: Arc<dyn TrafficEventBus>,
}

impl TrafficLog {
    pub fn new(capacity: usize) -> Self {
        Self::with_event_bus(capacity, Arc::new(NoopEventBus))
    }

    pub fn with_event_bus(capacity: usize, event_bus: Arc<dyn TrafficEventBus>) -> Self {
        Self {
            entries: RwLock::new(VecDeque::with_capacity(capacity.min(1024))),
            next_id: AtomicU64::new(1),
            capacity: capacity.max(1),
            stats: RwLock::new(TrafficStats::default()),
            event_bus,
        }
    }

    /// Append an entry, assigning its id and timestamp. Returns the id.
    pub async fn push(&self, payload: TrafficPayload) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let entry = TrafficEntry { id, timestamp: Utc::now().timestamp_millis(), payload };

        {
            let mut stats = self.stats.write().await;
            match &entry.payload {
                TrafficPayload::Http(exchange) => {
                    stats.total_requests += 1;
                    if exchange.status >= 400 {
                        stats.error_count += 1;
                    } else {
                        stats.success_count += 1;
                    }
                    if exchange.chaos_injected {
                        stats.chaos_injected_count += 1;
                    }
                }
                _ => stats.telemetry_count += 1,
            }
        }

        self.event_bus.emit_entry(&entry);

        {
            let mut entries = self.entries.write().await;
            if entries.len() >= self.capacity {
                let excess = entries.len() - self.capacity + 1;
                entries.drain(..excess);
            }
            entries.push_back(entry);
        }

        id
    }

    /// Most recent entries, newest first.
    pub async fn recent(&self, limit: usize) -> Vec<TrafficEntry> {
        let entries = self.entries.read().await;
        entries.iter().rev().take(limit).cloned().collect()
    }

    /// Entries of one kind, newest first.
    pub async fn by_kind(&self, kind: TrafficKind, limit: usize) -> Vec<TrafficEntry> {
        let entries = self.entries.read().await;
        entries.iter().rev().filter(|e| e.kind() == kind).take(limit).cloned().collect()
    }

    /// Entries at or after the given Unix-millisecond timestamp, oldest first.
    pub async fn since(&self, timestamp_ms: i64) -> Vec<TrafficEntry> {
        let entries = self.entries.read().await;
        entries.iter().filter(|e| e.timestamp >= timestamp_ms).cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    pub async fn stats(&self) -> TrafficStats {
        *self.stats.read().await
    }

    pub async fn clear(&self) {
        self.entries.write().await.clear();
    }
}
