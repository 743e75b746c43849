//! Counters for messaging traffic.
//!
//! Cheap to update from any task; binaries log a [`MetricsSnapshot`]
//! periodically.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Instant;

use serde::Serialize;

// ── Per-event stats ──────────────────────────────────────────────────

/// Traffic for one event type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EventCounts {
    pub published: u64,
    pub received: u64,
}

// ── Snapshot ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    /// Messages handed to the broker.
    pub published: u64,
    /// Publishes enlisted in a transaction, not yet sent.
    pub deferred: u64,
    /// Deferred publishes discarded by rollback.
    pub dropped: u64,
    pub received: u64,
    pub acked: u64,
    pub requeued: u64,
    pub dead_lettered: u64,
    pub events: BTreeMap<String, EventCounts>,
    pub uptime_secs: f64,
}

// ── Collector ────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct MessagingMetrics {
    published: AtomicU64,
    deferred: AtomicU64,
    dropped: AtomicU64,
    received: AtomicU64,
    acked: AtomicU64,
    requeued: AtomicU64,
    dead_lettered: AtomicU64,
    events: Mutex<BTreeMap<String, EventCounts>>,
    start: Instant,
}

impl Default for MessagingMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl MessagingMetrics {
    pub fn new() -> Self {
        Self {
            published: AtomicU64::new(0),
            deferred: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            received: AtomicU64::new(0),
            acked: AtomicU64::new(0),
            requeued: AtomicU64::new(0),
            dead_lettered: AtomicU64::new(0),
            events: Mutex::new(BTreeMap::new()),
            start: Instant::now(),
        }
    }

    fn event(&self, event_type: &str, f: impl FnOnce(&mut EventCounts)) {
        let mut events = self.events.lock().unwrap_or_else(PoisonError::into_inner);
        f(events.entry(event_type.to_string()).or_default());
    }

    pub fn record_published(&self, event_type: &str) {
        self.published.fetch_add(1, Ordering::Relaxed);
        self.event(event_type, |c| c.published += 1);
    }

    pub fn record_deferred(&self) {
        self.deferred.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped(&self, count: u64) {
        self.dropped.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_received(&self, event_type: &str) {
        self.received.fetch_add(1, Ordering::Relaxed);
        self.event(event_type, |c| c.received += 1);
    }

    pub fn record_acked(&self, count: u64) {
        self.acked.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_requeued(&self, count: u64) {
        self.requeued.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_dead_lettered(&self, count: u64) {
        self.dead_lettered.fetch_add(count, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let events = self
            .events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        MetricsSnapshot {
            published: self.published.load(Ordering::Relaxed),
            deferred: self.deferred.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            received: self.received.load(Ordering::Relaxed),
            acked: self.acked.load(Ordering::Relaxed),
            requeued: self.requeued.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            events,
            uptime_secs: self.start.elapsed().as_secs_f64(),
        }
    }
}
