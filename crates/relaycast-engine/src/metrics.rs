//! Controller metrics.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Instant;

use parking_lot::RwLock;

use relaycast_ipc::CompositionMetrics;

/// Counts controller activity. Shared with the HTTP surface.
#[derive(Default)]
pub struct MetricsCollector {
    generation: AtomicU64,
    restarts: AtomicU64,
    successful_starts: AtomicU64,
    failed_starts: AtomicU64,
    coalesced_requests: AtomicU64,
    abnormal_exits: AtomicU64,
    scheduled_retries: AtomicU64,
    fallback_writes: AtomicU64,
    composed_producers: AtomicUsize,
    active_endpoints: AtomicUsize,
    live_since: RwLock<Option<Instant>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the start of a restart cycle.
    pub fn record_restart(&self, generation: u64) {
        self.generation.store(generation, Ordering::Relaxed);
        self.restarts.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a generation change without a cycle.
    pub fn record_generation(&self, generation: u64) {
        self.generation.store(generation, Ordering::Relaxed);
    }

    /// Record a cycle reaching live.
    pub fn record_live(&self, composed: usize) {
        self.successful_starts.fetch_add(1, Ordering::Relaxed);
        self.composed_producers.store(composed, Ordering::Relaxed);
        *self.live_since.write() = Some(Instant::now());
    }

    /// Record a cycle ending in failure.
    pub fn record_start_failure(&self) {
        self.failed_starts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_coalesced(&self) {
        self.coalesced_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_abnormal_exit(&self) {
        self.abnormal_exits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry_scheduled(&self) {
        self.scheduled_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fallback_write(&self) {
        self.fallback_writes.fetch_add(1, Ordering::Relaxed);
    }

    /// Leaving live: clear the live clock and composed count.
    pub fn record_not_live(&self) {
        self.composed_producers.store(0, Ordering::Relaxed);
        *self.live_since.write() = None;
    }

    pub fn set_active_endpoints(&self, count: usize) {
        self.active_endpoints.store(count, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CompositionMetrics {
        CompositionMetrics {
            generation: self.generation.load(Ordering::Relaxed),
            restarts: self.restarts.load(Ordering::Relaxed),
            successful_starts: self.successful_starts.load(Ordering::Relaxed),
            failed_starts: self.failed_starts.load(Ordering::Relaxed),
            coalesced_requests: self.coalesced_requests.load(Ordering::Relaxed),
            abnormal_exits: self.abnormal_exits.load(Ordering::Relaxed),
            scheduled_retries: self.scheduled_retries.load(Ordering::Relaxed),
            fallback_writes: self.fallback_writes.load(Ordering::Relaxed),
            composed_producers: self.composed_producers.load(Ordering::Relaxed),
            active_endpoints: self.active_endpoints.load(Ordering::Relaxed),
            live_seconds: self
                .live_since
                .read()
                .map(|since| since.elapsed().as_secs())
                .unwrap_or(0),
        }
    }
}
