//! Model Health State Machine
//!
//! Drives each model's [`HealthState`] from the outcomes the registry sees.
//!
//! ```text
//!                 first success
//!  +---------+ ------------------> +---------+   success rate < degraded   +----------+
//!  | Unknown |                     | Healthy | --------------------------> | Degraded |
//!  +---------+                     +---------+ <-------------------------- +----------+
//!       |                            ^    |        success rate >= recovery      |
//!       |                            |    |                                      |
//!       |          probe succeeds    |    | M failures within W                  |
//!       |                            |    v                                      |
//!       |                      +-------------+                                   |
//!       +--------------------> | Unavailable | <---------------------------------+
//!         M failures within W  +-------------+
//!                                |        ^
//!                                +--------+
//!                           probe fails: fresh cooldown
//! ```
//!
//! An unavailable model is excluded from selection until its cooldown has
//! elapsed. After that, exactly one request (a probe) is admitted at a time;
//! its outcome decides whether the circuit closes again.
//!
//! Cancelled requests count as a fractional failure: they add
//! `cancellation_weight` to the failure streak but never reset it.
//!
//! All timing uses [`tokio::time::Instant`] so tests can pause and advance
//! the clock.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{info, warn};

use super::record::PerformanceRecord;

// ============================================================================
// Health State
// ============================================================================

/// Health of a model as seen by the router
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    /// No outcome has been observed yet
    #[default]
    Unknown,
    /// Serving normally
    Healthy,
    /// Success rate has fallen below the degraded threshold
    Degraded,
    /// Circuit open; excluded from selection until a probe succeeds
    Unavailable,
}

impl HealthState {
    /// Whether the model is selectable without a probe
    #[must_use]
    pub fn is_operational(&self) -> bool {
        !matches!(self, Self::Unavailable)
    }
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unknown => "unknown",
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unavailable => "unavailable",
        };
        f.write_str(name)
    }
}

/// Whether a model may receive a request right now
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Eligibility {
    /// Selectable
    Eligible,
    /// Unavailable, cooldown elapsed; the next request is a probe
    ProbeReady,
    /// Unavailable and still cooling down
    CoolingDown {
        /// Time left before a probe is admitted
        remaining: Duration,
    },
    /// Unavailable with a probe already outstanding
    ProbeInFlight,
}

impl Eligibility {
    /// Whether the selector may rank this model
    #[must_use]
    pub fn allows_selection(&self) -> bool {
        matches!(self, Self::Eligible | Self::ProbeReady)
    }
}

/// How a request was let through
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Admission {
    /// Ordinary request
    Normal,
    /// Trial request against an unavailable model
    Probe,
}

// ============================================================================
// Health Configuration
// ============================================================================

/// Thresholds for the health state machine
#[derive(Clone, Debug, PartialEq)]
pub struct HealthConfig {
    /// Success rate below which a healthy model becomes degraded
    pub degraded_success_rate: f64,
    /// Success rate at which a degraded model is healthy again
    pub recovery_success_rate: f64,
    /// Failure streak weight that opens the circuit (M)
    pub failure_threshold: f64,
    /// Window a streak must fit in (W)
    pub failure_window: Duration,
    /// Time before a probe is admitted (C)
    pub cooldown: Duration,
    /// Streak weight of a cancelled request
    pub cancellation_weight: f64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            degraded_success_rate: 0.6,
            recovery_success_rate: 0.75,
            failure_threshold: 3.0,
            failure_window: Duration::from_secs(60),
            cooldown: Duration::from_secs(30),
            cancellation_weight: 0.25,
        }
    }
}

// ============================================================================
// Circuit Tracker
// ============================================================================

/// Per-model circuit state, embedded in the performance record
///
/// Only the health state, the consecutive failure count and the streak
/// weight survive a restart; timestamps are process-local.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CircuitTracker {
    state: HealthState,
    consecutive_failures: u32,
    streak_weight: f64,
    #[serde(skip)]
    streak_started: Option<Instant>,
    #[serde(skip)]
    unavailable_since: Option<Instant>,
    #[serde(skip)]
    probe_in_flight: bool,
}

impl CircuitTracker {
    /// Current health state
    #[must_use]
    pub fn state(&self) -> HealthState {
        self.state
    }

    /// Failures since the last success (cancellations excluded)
    #[must_use]
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Weighted failure streak inside the current window
    #[must_use]
    pub fn streak_weight(&self) -> f64 {
        self.streak_weight
    }

    /// Whether a probe is outstanding
    #[must_use]
    pub fn probe_in_flight(&self) -> bool {
        self.probe_in_flight
    }

    fn reset_streak(&mut self) {
        self.streak_weight = 0.0;
        self.streak_started = None;
    }
}

// ============================================================================
// Health Monitor
// ============================================================================

/// Applies the state machine to performance records
#[derive(Clone, Debug, Default)]
pub struct HealthMonitor {
    config: HealthConfig,
}

impl HealthMonitor {
    #[must_use]
    pub fn new(config: HealthConfig) -> Self {
        Self { config }
    }

    #[must_use]
    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    /// A request succeeded
    pub fn on_success(&self, record: &mut PerformanceRecord) {
        let circuit = &mut record.circuit;
        circuit.consecutive_failures = 0;
        circuit.reset_streak();

        match circuit.state {
            HealthState::Unknown => transition(&record.model_id, circuit, HealthState::Healthy),
            HealthState::Unavailable if circuit.probe_in_flight => {
                circuit.probe_in_flight = false;
                circuit.unavailable_since = None;
                // re-seed so the fold right after recovery does not degrade it again
                record.success_rate = record.success_rate.max(self.config.recovery_success_rate);
                info!(model_id = %record.model_id, "Probe succeeded, closing circuit");
                transition(&record.model_id, circuit, HealthState::Healthy);
            }
            // late completions from before the circuit opened do not close it
            HealthState::Unavailable | HealthState::Healthy | HealthState::Degraded => {}
        }
    }

    /// A request failed (backend error or timeout)
    pub fn on_failure(&self, record: &mut PerformanceRecord, now: Instant) {
        let circuit = &mut record.circuit;
        circuit.consecutive_failures = circuit.consecutive_failures.saturating_add(1);

        if circuit.state == HealthState::Unavailable {
            if circuit.probe_in_flight {
                circuit.probe_in_flight = false;
                circuit.unavailable_since = Some(now);
                warn!(
                    model_id = %record.model_id,
                    cooldown_secs = self.config.cooldown.as_secs(),
                    "Probe failed, circuit stays open"
                );
            }
            return;
        }

        self.add_to_streak(circuit, 1.0, now);
        if circuit.streak_weight >= self.config.failure_threshold {
            self.trip(&record.model_id, circuit, now);
        }
    }

    /// A request was cancelled by its caller
    pub fn on_cancelled(&self, record: &mut PerformanceRecord, now: Instant) {
        let circuit = &mut record.circuit;

        if circuit.state == HealthState::Unavailable {
            // the probe slot is released; the cooldown already elapsed
            circuit.probe_in_flight = false;
            return;
        }

        self.add_to_streak(circuit, self.config.cancellation_weight, now);
        if circuit.streak_weight >= self.config.failure_threshold {
            self.trip(&record.model_id, circuit, now);
        }
    }

    /// Re-evaluate rate-based states after the success EMA moved
    pub fn on_success_rate(&self, record: &mut PerformanceRecord) {
        let rate = record.success_rate;
        let circuit = &mut record.circuit;
        match circuit.state {
            HealthState::Healthy | HealthState::Unknown
                if rate < self.config.degraded_success_rate && record.sample_count > 0 =>
            {
                transition(&record.model_id, circuit, HealthState::Degraded);
            }
            HealthState::Degraded if rate >= self.config.recovery_success_rate => {
                transition(&record.model_id, circuit, HealthState::Healthy);
            }
            _ => {}
        }
    }

    /// Current eligibility of a record
    #[must_use]
    pub fn eligibility(&self, circuit: &CircuitTracker, now: Instant) -> Eligibility {
        if circuit.state != HealthState::Unavailable {
            return Eligibility::Eligible;
        }
        if circuit.probe_in_flight {
            return Eligibility::ProbeInFlight;
        }
        let Some(since) = circuit.unavailable_since else {
            return Eligibility::ProbeReady;
        };
        let elapsed = now.saturating_duration_since(since);
        if elapsed >= self.config.cooldown {
            Eligibility::ProbeReady
        } else {
            Eligibility::CoolingDown {
                remaining: self.config.cooldown - elapsed,
            }
        }
    }

    /// Let a request through if the record allows it
    ///
    /// A probe-ready record admits exactly one probe; every other caller is
    /// refused until that probe reports back.
    pub fn admit(&self, circuit: &mut CircuitTracker, now: Instant) -> Option<Admission> {
        match self.eligibility(circuit, now) {
            Eligibility::Eligible => Some(Admission::Normal),
            Eligibility::ProbeReady => {
                circuit.probe_in_flight = true;
                Some(Admission::Probe)
            }
            Eligibility::CoolingDown { .. } | Eligibility::ProbeInFlight => None,
        }
    }

    /// Rebuild process-local timing after loading a record from disk
    ///
    /// A model persisted as unavailable starts a fresh cooldown.
    pub fn restore(&self, circuit: &mut CircuitTracker, now: Instant) {
        circuit.reset_streak();
        circuit.probe_in_flight = false;
        circuit.unavailable_since = (circuit.state == HealthState::Unavailable).then_some(now);
    }

    fn add_to_streak(&self, circuit: &mut CircuitTracker, weight: f64, now: Instant) {
        match circuit.streak_started {
            Some(start) if now.saturating_duration_since(start) <= self.config.failure_window => {}
            _ => {
                circuit.streak_weight = 0.0;
                circuit.streak_started = Some(now);
            }
        }
        circuit.streak_weight += weight;
    }

    fn trip(&self, model_id: &str, circuit: &mut CircuitTracker, now: Instant) {
        warn!(
            model_id = %model_id,
            consecutive_failures = circuit.consecutive_failures,
            streak_weight = circuit.streak_weight,
            "Failure threshold reached, opening circuit"
        );
        circuit.unavailable_since = Some(now);
        circuit.probe_in_flight = false;
        circuit.reset_streak();
        transition(model_id, circuit, HealthState::Unavailable);
    }
}

fn transition(model_id: &str, circuit: &mut CircuitTracker, to: HealthState) {
    let from = circuit.state;
    if from == to {
        return;
    }
    circuit.state = to;
    info!(model_id = %model_id, from = %from, to = %to, "Health state changed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::LatencyClass;

    fn record() -> PerformanceRecord {
        PerformanceRecord::seeded("m", LatencyClass::Medium)
    }

    #[test]
    fn test_first_success_marks_healthy() {
        let monitor = HealthMonitor::default();
        let mut rec = record();
        assert_eq!(rec.health(), HealthState::Unknown);

        monitor.on_success(&mut rec);
        assert_eq!(rec.health(), HealthState::Healthy);
    }

    #[test]
    fn test_three_failures_open_circuit() {
        let monitor = HealthMonitor::default();
        let mut rec = record();
        let now = Instant::now();

        monitor.on_failure(&mut rec, now);
        monitor.on_failure(&mut rec, now);
        assert_eq!(rec.health(), HealthState::Unknown);
        monitor.on_failure(&mut rec, now);
        assert_eq!(rec.health(), HealthState::Unavailable);
        assert!(matches!(
            monitor.eligibility(&rec.circuit, now),
            Eligibility::CoolingDown { .. }
        ));
    }

    #[test]
    fn test_success_resets_streak() {
        let monitor = HealthMonitor::default();
        let mut rec = record();
        let now = Instant::now();

        monitor.on_failure(&mut rec, now);
        monitor.on_failure(&mut rec, now);
        monitor.on_success(&mut rec);
        monitor.on_failure(&mut rec, now);
        monitor.on_failure(&mut rec, now);
        assert_eq!(rec.health(), HealthState::Healthy);
        assert_eq!(rec.circuit.consecutive_failures(), 2);
    }

    #[test]
    fn test_cancellations_are_fractional() {
        let monitor = HealthMonitor::default();
        let mut rec = record();
        let now = Instant::now();

        monitor.on_failure(&mut rec, now);
        monitor.on_failure(&mut rec, now);
        for _ in 0..3 {
            monitor.on_cancelled(&mut rec, now);
        }
        assert_eq!(rec.health(), HealthState::Unknown);
        assert!((rec.circuit.streak_weight() - 2.75).abs() < 1e-9);

        monitor.on_cancelled(&mut rec, now);
        assert_eq!(rec.health(), HealthState::Unavailable);
    }

    #[test]
    fn test_admit_allows_single_probe() {
        let monitor = HealthMonitor::default();
        let mut rec = record();
        let start = Instant::now();
        for _ in 0..3 {
            monitor.on_failure(&mut rec, start);
        }

        assert_eq!(monitor.admit(&mut rec.circuit, start), None);

        let later = start + Duration::from_secs(31);
        assert_eq!(monitor.eligibility(&rec.circuit, later), Eligibility::ProbeReady);
        assert_eq!(monitor.admit(&mut rec.circuit, later), Some(Admission::Probe));
        assert_eq!(monitor.admit(&mut rec.circuit, later), None);
        assert_eq!(
            monitor.eligibility(&rec.circuit, later),
            Eligibility::ProbeInFlight
        );
    }

    #[test]
    fn test_degraded_and_recovered_by_rate() {
        let monitor = HealthMonitor::default();
        let mut rec = record();
        monitor.on_success(&mut rec);
        rec.sample_count = 10;

        rec.success_rate = 0.5;
        monitor.on_success_rate(&mut rec);
        assert_eq!(rec.health(), HealthState::Degraded);

        rec.success_rate = 0.7;
        monitor.on_success_rate(&mut rec);
        assert_eq!(rec.health(), HealthState::Degraded);

        rec.success_rate = 0.8;
        monitor.on_success_rate(&mut rec);
        assert_eq!(rec.health(), HealthState::Healthy);
    }

    #[test]
    fn test_restore_starts_fresh_cooldown() {
        let monitor = HealthMonitor::default();
        let mut rec = record();
        let t0 = Instant::now();
        for _ in 0..3 {
            monitor.on_failure(&mut rec, t0);
        }

        let json = serde_json::to_string(&rec.circuit).unwrap();
        let mut restored: CircuitTracker = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.state(), HealthState::Unavailable);

        let t1 = t0 + Duration::from_secs(120);
        monitor.restore(&mut restored, t1);
        assert!(matches!(
            monitor.eligibility(&restored, t1),
            Eligibility::CoolingDown { .. }
        ));
    }
}
