//! Per-engine atomic counters.
//!
//! Counters are incremented silently at the call site. Call
//! [`EngineMetrics::flush`] to emit current values as a single
//! `tracing::info!` event, e.g. once a run has been aggregated.

use std::sync::atomic::{AtomicU64, Ordering};

/// Lightweight atomic counters, owned by one [`Engine`](crate::engine::Engine).
#[derive(Debug, Default)]
pub struct EngineMetrics {
    builds_executed: AtomicU64,
    build_cache_hits: AtomicU64,
    runs_completed: AtomicU64,
    instances_failed: AtomicU64,
}

impl EngineMetrics {
    pub const fn new() -> Self {
        Self {
            builds_executed: AtomicU64::new(0),
            build_cache_hits: AtomicU64::new(0),
            runs_completed: AtomicU64::new(0),
            instances_failed: AtomicU64::new(0),
        }
    }

    pub fn inc_builds_executed(&self) {
        self.builds_executed.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "builds_executed", "counter incremented");
    }

    pub fn inc_build_cache_hits(&self) {
        self.build_cache_hits.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "build_cache_hits", "counter incremented");
    }

    pub fn inc_runs_completed(&self) {
        self.runs_completed.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "runs_completed", "counter incremented");
    }

    pub fn add_instances_failed(&self, n: u64) {
        self.instances_failed.fetch_add(n, Ordering::Relaxed);
        tracing::trace!(metric = "instances_failed", delta = n, "counter incremented");
    }

    /// Emit all current counter values as a single `info!` event.
    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            builds_executed = self.builds_executed(),
            build_cache_hits = self.build_cache_hits(),
            runs_completed = self.runs_completed(),
            instances_failed = self.instances_failed(),
        );
    }

    pub fn builds_executed(&self) -> u64 {
        self.builds_executed.load(Ordering::Relaxed)
    }

    pub fn build_cache_hits(&self) -> u64 {
        self.build_cache_hits.load(Ordering::Relaxed)
    }

    pub fn runs_completed(&self) -> u64 {
        self.runs_completed.load(Ordering::Relaxed)
    }

    pub fn instances_failed(&self) -> u64 {
        self.instances_failed.load(Ordering::Relaxed)
    }
}
