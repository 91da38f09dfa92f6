//! Per-model performance record
//!
//! Outcomes are not folded into the moving averages one at a time. Each
//! outcome is added to a pending window of integer sums, and the window is
//! folded in a single EMA step when the registry is read (or when the
//! advisor ticks). Integer addition commutes, so the folded averages do not
//! depend on the order concurrent requests finished in.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::health::{CircuitTracker, HealthState};
use super::LatencyClass;

/// Outcomes recorded since the last fold
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct OutcomeWindow {
    latency_micros: u64,
    samples: u64,
    successes: u64,
}

impl OutcomeWindow {
    fn push(&mut self, latency: Duration, success: bool) {
        let micros = u64::try_from(latency.as_micros()).unwrap_or(u64::MAX);
        self.latency_micros = self.latency_micros.saturating_add(micros);
        self.samples += 1;
        if success {
            self.successes += 1;
        }
    }

    fn is_empty(&self) -> bool {
        self.samples == 0
    }

    fn mean_latency_ms(&self) -> f64 {
        self.latency_micros as f64 / self.samples as f64 / 1000.0
    }

    fn success_fraction(&self) -> f64 {
        self.successes as f64 / self.samples as f64
    }
}

/// Rolling statistics for one model
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PerformanceRecord {
    /// Model these statistics belong to
    pub model_id: String,
    /// Smoothed latency in milliseconds
    pub latency_ema_ms: f64,
    /// Smoothed success rate in [0, 1]
    pub success_rate: f64,
    /// Smoothed user satisfaction in [0, 1]
    pub satisfaction_avg: f64,
    /// Completed (non-cancelled) requests folded so far
    pub sample_count: u64,
    /// Feedback scores applied so far
    pub feedback_count: u64,
    /// Circuit and health state
    pub circuit: CircuitTracker,
    /// Last time an outcome or feedback touched the record
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(skip)]
    pending: OutcomeWindow,
}

impl PerformanceRecord {
    /// Neutral starting point for a model that has never been used
    pub fn seeded(model_id: impl Into<String>, latency_class: LatencyClass) -> Self {
        Self {
            model_id: model_id.into(),
            latency_ema_ms: latency_class.baseline_ms(),
            success_rate: 1.0,
            satisfaction_avg: 0.5,
            sample_count: 0,
            feedback_count: 0,
            circuit: CircuitTracker::default(),
            updated_at: None,
            pending: OutcomeWindow::default(),
        }
    }

    /// Current health state
    #[must_use]
    pub fn health(&self) -> HealthState {
        self.circuit.state()
    }

    /// Whether outcomes are waiting to be folded
    #[must_use]
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    pub(crate) fn push_outcome(&mut self, latency: Duration, success: bool) {
        self.pending.push(latency, success);
        self.updated_at = Some(Utc::now());
    }

    /// Fold the pending window into the averages; returns whether anything moved
    pub(crate) fn fold(&mut self, alpha: f64) -> bool {
        if self.pending.is_empty() {
            return false;
        }
        let window = std::mem::take(&mut self.pending);
        self.latency_ema_ms = ema(self.latency_ema_ms, window.mean_latency_ms(), alpha);
        self.success_rate = ema(self.success_rate, window.success_fraction(), alpha).clamp(0.0, 1.0);
        self.sample_count += window.samples;
        true
    }

    /// Apply one satisfaction score, returning the new average
    pub(crate) fn apply_feedback(&mut self, score: f64, alpha: f64) -> f64 {
        self.satisfaction_avg = ema(self.satisfaction_avg, score, alpha).clamp(0.0, 1.0);
        self.feedback_count += 1;
        self.updated_at = Some(Utc::now());
        self.satisfaction_avg
    }
}

fn ema(current: f64, sample: f64, alpha: f64) -> f64 {
    (1.0 - alpha) * current + alpha * sample
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seeded_from_latency_class() {
        let fast = PerformanceRecord::seeded("a", LatencyClass::Fast);
        let slow = PerformanceRecord::seeded("b", LatencyClass::Slow);
        assert!(fast.latency_ema_ms < slow.latency_ema_ms);
        assert_eq!(fast.success_rate, 1.0);
        assert_eq!(fast.satisfaction_avg, 0.5);
        assert_eq!(fast.health(), HealthState::Unknown);
    }

    #[test]
    fn test_fold_is_one_step_over_window_mean() {
        let mut rec = PerformanceRecord::seeded("m", LatencyClass::Medium);
        rec.latency_ema_ms = 1000.0;

        rec.push_outcome(Duration::from_millis(100), true);
        rec.push_outcome(Duration::from_millis(300), false);
        assert!(rec.has_pending());
        assert!(rec.fold(0.5));

        // window mean 200ms, success fraction 0.5
        assert!((rec.latency_ema_ms - 600.0).abs() < 1e-9);
        assert!((rec.success_rate - 0.75).abs() < 1e-9);
        assert_eq!(rec.sample_count, 2);
        assert!(!rec.fold(0.5));
    }

    #[test]
    fn test_fold_ignores_push_order() {
        let outcomes = [(120, true), (900, false), (45, true), (3000, true)];

        let mut forward = PerformanceRecord::seeded("m", LatencyClass::Fast);
        for (ms, ok) in outcomes {
            forward.push_outcome(Duration::from_millis(ms), ok);
        }
        let mut backward = PerformanceRecord::seeded("m", LatencyClass::Fast);
        for (ms, ok) in outcomes.iter().rev() {
            backward.push_outcome(Duration::from_millis(*ms), *ok);
        }

        forward.fold(0.3);
        backward.fold(0.3);
        assert_eq!(forward.latency_ema_ms, backward.latency_ema_ms);
        assert_eq!(forward.success_rate, backward.success_rate);
    }

    #[test]
    fn test_feedback_moves_average_each_time() {
        let mut rec = PerformanceRecord::seeded("m", LatencyClass::Medium);
        let first = rec.apply_feedback(1.0, 0.3);
        let second = rec.apply_feedback(1.0, 0.3);
        assert!((first - 0.65).abs() < 1e-9);
        assert!(second > first);
        assert_eq!(rec.feedback_count, 2);
    }
}
