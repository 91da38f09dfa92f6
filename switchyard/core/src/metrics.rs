//! Router Metrics
//!
//! Lock-free counters and a dispatch latency histogram covering:
//! - Queries routed, decisions made, overrides honoured
//! - Dispatch attempts, retries, failures and cancellations
//! - Feedback accepted and ignored
//! - Context graph growth and eviction
//!
//! [`RouterMetrics::snapshot`] produces a serializable view for the daemon's
//! `stats` request.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

/// Upper bounds of the dispatch latency buckets, in milliseconds
const LATENCY_BOUNDS_MS: [u64; 10] = [25, 50, 100, 250, 500, 1_000, 2_500, 5_000, 15_000, 60_000];

/// Dispatch latency counts per bucket; slower calls share the last bucket
#[derive(Debug, Default)]
pub struct LatencyHistogram {
    counts: [AtomicU64; LATENCY_BOUNDS_MS.len()],
    max_ms: AtomicU64,
}

impl LatencyHistogram {
    pub fn record(&self, latency: Duration) {
        let ms = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX);
        let idx = LATENCY_BOUNDS_MS
            .iter()
            .position(|&bound| ms <= bound)
            .unwrap_or(LATENCY_BOUNDS_MS.len() - 1);
        self.counts[idx].fetch_add(1, Ordering::Relaxed);
        self.max_ms.fetch_max(ms, Ordering::Relaxed);
    }

    /// Counts plus bucket-resolution p50/p90/p99
    #[must_use]
    pub fn snapshot(&self) -> LatencySnapshot {
        let counts: Vec<u64> = self.counts.iter().map(|c| c.load(Ordering::Relaxed)).collect();
        let total: u64 = counts.iter().sum();
        let quantile = |q: f64| {
            let target = ((total as f64 * q).ceil() as u64).max(1);
            let mut seen = 0;
            counts
                .iter()
                .zip(LATENCY_BOUNDS_MS)
                .find(|(count, _)| {
                    seen += **count;
                    seen >= target
                })
                .map_or(0, |(_, bound)| bound)
        };
        LatencySnapshot {
            total,
            max_ms: self.max_ms.load(Ordering::Relaxed),
            p50_ms: quantile(0.5),
            p90_ms: quantile(0.9),
            p99_ms: quantile(0.99),
            counts,
        }
    }
}

/// Serializable view of a [`LatencyHistogram`]
#[derive(Clone, Debug, Serialize)]
pub struct LatencySnapshot {
    pub total: u64,
    pub max_ms: u64,
    pub p50_ms: u64,
    pub p90_ms: u64,
    pub p99_ms: u64,
    pub counts: Vec<u64>,
}

// ============================================================================
// Counter
// ============================================================================

/// A simple atomic counter
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    #[must_use]
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

// ============================================================================
// Router Metrics
// ============================================================================

/// All counters maintained by the router
#[derive(Debug)]
pub struct RouterMetrics {
    pub queries: Counter,
    pub decisions: Counter,
    pub overrides: Counter,
    pub no_model_available: Counter,
    pub attempts: Counter,
    pub retries: Counter,
    pub dispatch_successes: Counter,
    pub dispatch_failures: Counter,
    pub timeouts: Counter,
    pub cancellations: Counter,
    pub feedback_applied: Counter,
    pub feedback_ignored: Counter,
    pub nodes_added: Counter,
    pub nodes_evicted: Counter,
    pub dispatch_latency: LatencyHistogram,
}

impl Default for RouterMetrics {
    fn default() -> Self {
        Self {
            queries: Counter::new(),
            decisions: Counter::new(),
            overrides: Counter::new(),
            no_model_available: Counter::new(),
            attempts: Counter::new(),
            retries: Counter::new(),
            dispatch_successes: Counter::new(),
            dispatch_failures: Counter::new(),
            timeouts: Counter::new(),
            cancellations: Counter::new(),
            feedback_applied: Counter::new(),
            feedback_ignored: Counter::new(),
            nodes_added: Counter::new(),
            nodes_evicted: Counter::new(),
            dispatch_latency: LatencyHistogram::default(),
        }
    }
}

impl RouterMetrics {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Point-in-time copy of every counter
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            queries: self.queries.get(),
            decisions: self.decisions.get(),
            overrides: self.overrides.get(),
            no_model_available: self.no_model_available.get(),
            attempts: self.attempts.get(),
            retries: self.retries.get(),
            dispatch_successes: self.dispatch_successes.get(),
            dispatch_failures: self.dispatch_failures.get(),
            timeouts: self.timeouts.get(),
            cancellations: self.cancellations.get(),
            feedback_applied: self.feedback_applied.get(),
            feedback_ignored: self.feedback_ignored.get(),
            nodes_added: self.nodes_added.get(),
            nodes_evicted: self.nodes_evicted.get(),
            dispatch_latency: self.dispatch_latency.snapshot(),
        }
    }
}

/// Serializable copy of [`RouterMetrics`]
#[derive(Clone, Debug, Serialize)]
pub struct MetricsSnapshot {
    pub queries: u64,
    pub decisions: u64,
    pub overrides: u64,
    pub no_model_available: u64,
    pub attempts: u64,
    pub retries: u64,
    pub dispatch_successes: u64,
    pub dispatch_failures: u64,
    pub timeouts: u64,
    pub cancellations: u64,
    pub feedback_applied: u64,
    pub feedback_ignored: u64,
    pub nodes_added: u64,
    pub nodes_evicted: u64,
    pub dispatch_latency: LatencySnapshot,
}
