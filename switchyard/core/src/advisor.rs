//! Advisory loop
//!
//! A scheduled task that runs beside the hot path. On every tick it:
//!
//! 1. folds pending registry windows so idle models still see their EMAs move
//! 2. health-checks unavailable models whose cooldown has elapsed, using the
//!    probe slot so only one trial request is in flight
//! 3. records a [`Suggestion`] for models that look unhealthy or unloved
//!
//! It talks to the registry only through its public API and stops as soon
//! as its cancellation token fires.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::AdvisorConfig;
use crate::registry::{Admission, Eligibility, HealthState, ModelRegistry};

/// What the advisor noticed
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SuggestionKind {
    Degraded { success_rate: f64 },
    Unavailable,
    LowSatisfaction { satisfaction_avg: f64 },
    /// Never routed to while other models have been
    Idle,
}

/// One observation about a model
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Suggestion {
    pub at: DateTime<Utc>,
    pub model_id: String,
    #[serde(flatten)]
    pub kind: SuggestionKind,
}

impl fmt::Display for Suggestion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            SuggestionKind::Degraded { success_rate } => write!(
                f,
                "{} is degraded (success rate {:.2}); check its backend",
                self.model_id, success_rate
            ),
            SuggestionKind::Unavailable => {
                write!(f, "{} is unavailable; requests skip it until a probe succeeds", self.model_id)
            }
            SuggestionKind::LowSatisfaction { satisfaction_avg } => write!(
                f,
                "{} has low satisfaction ({:.2}); consider lowering its capability scores",
                self.model_id, satisfaction_avg
            ),
            SuggestionKind::Idle => write!(
                f,
                "{} has never been selected; consider removing it or widening its capabilities",
                self.model_id
            ),
        }
    }
}

/// Result of one probe
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProbeReport {
    pub model_id: String,
    pub healthy: bool,
}

/// Background advisor over a shared registry
pub struct Advisor {
    registry: Arc<ModelRegistry>,
    config: AdvisorConfig,
    suggestions: Mutex<VecDeque<Suggestion>>,
}

impl Advisor {
    #[must_use]
    pub fn new(registry: Arc<ModelRegistry>, config: AdvisorConfig) -> Self {
        Self {
            registry,
            config,
            suggestions: Mutex::new(VecDeque::new()),
        }
    }

    /// Most recent suggestions, oldest first
    #[must_use]
    pub fn suggestions(&self) -> Vec<Suggestion> {
        self.suggestions.lock().iter().cloned().collect()
    }

    /// Health-check every probe-ready model once
    pub async fn probe_unavailable(&self) -> Vec<ProbeReport> {
        let timeout = Duration::from_millis(self.config.probe_timeout_ms);
        let snapshot = self.registry.snapshot();

        let probes = snapshot
            .iter()
            .filter(|s| s.eligibility == Eligibility::ProbeReady)
            .filter_map(|s| {
                let descriptor = self.registry.descriptor(&s.model_id)?;
                match self.registry.admit(&s.model_id)? {
                    Admission::Probe => Some(descriptor),
                    Admission::Normal => None,
                }
            })
            .map(|descriptor| async move {
                let started = Instant::now();
                let result =
                    tokio::time::timeout(timeout, descriptor.backend.health_check(timeout)).await;
                let latency = started.elapsed();
                let healthy = match result {
                    Ok(Ok(())) => true,
                    Ok(Err(e)) => {
                        debug!(model_id = %descriptor.id, error = %e, "Health probe failed");
                        false
                    }
                    Err(_) => {
                        debug!(model_id = %descriptor.id, "Health probe timed out");
                        false
                    }
                };
                (descriptor.id, latency.min(timeout), healthy)
            });

        join_all(probes)
            .await
            .into_iter()
            .map(|(model_id, latency, healthy)| {
                self.registry.record_outcome(&model_id, latency, healthy);
                info!(model_id = %model_id, healthy, "Advisor probe finished");
                ProbeReport { model_id, healthy }
            })
            .collect()
    }

    /// Inspect the registry and return this tick's suggestions
    #[must_use]
    pub fn review(&self) -> Vec<Suggestion> {
        let now = Utc::now();
        let records = self.registry.export_records();
        let anyone_used = records.iter().any(|r| r.sample_count > 0);
        let snapshot = self.registry.snapshot();

        snapshot
            .iter()
            .filter_map(|stats| {
                let record = records.iter().find(|r| r.model_id == stats.model_id);
                let kind = match stats.health {
                    HealthState::Unavailable => SuggestionKind::Unavailable,
                    HealthState::Degraded => SuggestionKind::Degraded {
                        success_rate: stats.success_rate,
                    },
                    _ if record.is_some_and(|r| r.feedback_count > 0)
                        && stats.satisfaction_avg < self.config.low_satisfaction =>
                    {
                        SuggestionKind::LowSatisfaction {
                            satisfaction_avg: stats.satisfaction_avg,
                        }
                    }
                    _ if anyone_used && stats.sample_count == 0 => SuggestionKind::Idle,
                    _ => return None,
                };
                Some(Suggestion {
                    at: now,
                    model_id: stats.model_id.clone(),
                    kind,
                })
            })
            .collect()
    }

    /// One full tick: fold, probe, review
    pub async fn run_once(&self) -> Vec<Suggestion> {
        let folded = self.registry.tick();
        let probes = self.probe_unavailable().await;
        let found = self.review();

        debug!(
            folded,
            probes = probes.len(),
            suggestions = found.len(),
            "Advisor tick"
        );

        let mut ring = self.suggestions.lock();
        for suggestion in &found {
            match suggestion.kind {
                SuggestionKind::Unavailable | SuggestionKind::Degraded { .. } => {
                    warn!(model_id = %suggestion.model_id, "{suggestion}");
                }
                _ => info!(model_id = %suggestion.model_id, "{suggestion}"),
            }
            ring.push_back(suggestion.clone());
        }
        while ring.len() > self.config.max_suggestions {
            ring.pop_front();
        }
        found
    }

    /// Run [`Advisor::run_once`] on an interval until `cancel` fires
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let period = Duration::from_secs(self.config.interval_secs.max(1));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(interval_secs = period.as_secs(), "Advisor started");

            loop {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        tokio::select! {
                            biased;
                            () = cancel.cancelled() => break,
                            _ = self.run_once() => {}
                        }
                    }
                }
            }
            info!("Advisor stopped");
        })
    }
}
