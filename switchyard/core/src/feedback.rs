//! Feedback & Explainability
//!
//! Every routing decision is kept in a [`DecisionLog`] for a bounded time so
//! callers can rate it and ask why it was made.
//!
//! ```text
//!   route ──► DecisionLog::insert ──┬─► submit_feedback ──► registry.record_feedback
//!                                   │        (one satisfaction EMA step per call)
//!                                   └─► explain ──► Explanation::render
//!                                            (stored decision only)
//! ```
//!
//! Explanations never read live registry state, so the text for a decision
//! is the same no matter when it is requested.

use std::collections::VecDeque;
use std::fmt;
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::FeedbackConfig;
use crate::error::RouterError;
use crate::graph::NodeId;
use crate::registry::{HealthState, ModelRegistry};
use crate::selector::{DecisionId, RoutingDecision};

/// One accepted satisfaction score
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FeedbackRecord {
    /// Clamped score in [0, 1]
    pub score: f64,
    pub submitted_at: DateTime<Utc>,
    /// Model satisfaction average right after this score was applied
    pub satisfaction_after: f64,
}

/// What happened to a feedback submission
#[derive(Clone, Debug, PartialEq)]
pub enum FeedbackOutcome {
    Applied {
        model_id: String,
        satisfaction_avg: f64,
    },
    /// The decision is unknown or has expired
    UnknownDecision,
    /// The score was NaN or infinite
    InvalidScore,
}

impl FeedbackOutcome {
    #[must_use]
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied { .. })
    }
}

// ============================================================================
// Decision log
// ============================================================================

struct LoggedDecision {
    decision: Arc<RoutingDecision>,
    logged_at: Instant,
    /// Model that produced the response, once dispatch succeeded
    served_by: Option<String>,
    feedback: Vec<FeedbackRecord>,
}

impl LoggedDecision {
    /// Model credited with feedback: the one that answered, else the one chosen
    fn credited_model(&self) -> &str {
        self.served_by.as_deref().unwrap_or(&self.decision.model_id)
    }
}

/// Recent decisions, bounded by count and age
pub struct DecisionLog {
    entries: DashMap<DecisionId, LoggedDecision>,
    order: Mutex<VecDeque<DecisionId>>,
    config: FeedbackConfig,
}

impl Default for DecisionLog {
    fn default() -> Self {
        Self::new(FeedbackConfig::default())
    }
}

impl DecisionLog {
    #[must_use]
    pub fn new(config: FeedbackConfig) -> Self {
        Self {
            entries: DashMap::new(),
            order: Mutex::new(VecDeque::new()),
            config,
        }
    }

    fn ttl(&self) -> Duration {
        Duration::from_secs(self.config.decision_ttl_secs)
    }

    fn is_expired(&self, logged_at: Instant, now: Instant) -> bool {
        now.saturating_duration_since(logged_at) >= self.ttl()
    }

    /// Store a decision, dropping the oldest ones past capacity or age
    pub fn insert(&self, decision: RoutingDecision) -> Arc<RoutingDecision> {
        let decision = Arc::new(decision);
        let id = decision.id;
        let now = Instant::now();

        self.entries.insert(
            id,
            LoggedDecision {
                decision: Arc::clone(&decision),
                logged_at: now,
                served_by: None,
                feedback: Vec::new(),
            },
        );

        let mut order = self.order.lock();
        order.push_back(id);
        while let Some(oldest) = order.front().copied() {
            let over_capacity = order.len() > self.config.max_decisions.max(1);
            let expired = self
                .entries
                .get(&oldest)
                .map_or(true, |e| self.is_expired(e.logged_at, now));
            if !over_capacity && !expired {
                break;
            }
            order.pop_front();
            self.entries.remove(&oldest);
            debug!(decision_id = %oldest, "Dropped decision from log");
        }

        decision
    }

    /// Stored decision, if it has not expired
    #[must_use]
    pub fn get(&self, id: &DecisionId) -> Option<Arc<RoutingDecision>> {
        let entry = self.entries.get(id)?;
        if self.is_expired(entry.logged_at, Instant::now()) {
            return None;
        }
        Some(Arc::clone(&entry.decision))
    }

    /// Note which model answered a decision
    ///
    /// Differs from the chosen model after a fallback.
    pub fn record_served(&self, id: &DecisionId, model_id: &str) {
        if let Some(mut entry) = self.entries.get_mut(id) {
            entry.served_by = Some(model_id.to_string());
        }
    }

    /// Model that answered a decision, if dispatch succeeded
    #[must_use]
    pub fn served_by(&self, id: &DecisionId) -> Option<String> {
        self.entries.get(id).and_then(|e| e.served_by.clone())
    }

    /// Feedback applied to a decision so far
    #[must_use]
    pub fn feedback(&self, id: &DecisionId) -> Vec<FeedbackRecord> {
        self.entries
            .get(id)
            .map(|e| e.feedback.clone())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Apply a satisfaction score to the model that answered a decision
    ///
    /// Falls back to the chosen model when no answer was recorded.
    /// Never fails: unknown ids and invalid scores are logged and reported
    /// through the returned outcome. Repeated calls each move the average.
    pub fn submit_feedback(
        &self,
        registry: &ModelRegistry,
        id: &DecisionId,
        score: f64,
    ) -> FeedbackOutcome {
        if !score.is_finite() {
            warn!(decision_id = %id, "Ignoring non-finite feedback score");
            return FeedbackOutcome::InvalidScore;
        }

        let now = Instant::now();
        let Some(mut entry) = self.entries.get_mut(id) else {
            warn!(decision_id = %id, "Feedback for unknown decision ignored");
            return FeedbackOutcome::UnknownDecision;
        };
        if self.is_expired(entry.logged_at, now) {
            warn!(decision_id = %id, "Feedback for expired decision ignored");
            return FeedbackOutcome::UnknownDecision;
        }

        let score = score.clamp(0.0, 1.0);
        let model_id = entry.credited_model().to_string();
        let Some(satisfaction_avg) = registry.record_feedback(&model_id, score) else {
            return FeedbackOutcome::InvalidScore;
        };
        entry.feedback.push(FeedbackRecord {
            score,
            submitted_at: Utc::now(),
            satisfaction_after: satisfaction_avg,
        });

        debug!(
            decision_id = %id,
            model_id = %model_id,
            score,
            satisfaction_avg,
            "Applied feedback"
        );
        FeedbackOutcome::Applied {
            model_id,
            satisfaction_avg,
        }
    }

    /// Mean feedback score across one conversation's decisions
    ///
    /// A derived view; satisfaction is still recorded per decision.
    #[must_use]
    pub fn conversation_satisfaction(&self, conversation_id: &str) -> Option<f64> {
        let scores: Vec<f64> = self
            .entries
            .iter()
            .filter(|e| e.decision.conversation_id.as_deref() == Some(conversation_id))
            .flat_map(|e| e.feedback.iter().map(|f| f.score).collect::<Vec<_>>())
            .collect();
        if scores.is_empty() {
            return None;
        }
        Some(scores.iter().sum::<f64>() / scores.len() as f64)
    }

    /// Structured explanation of a stored decision
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::UnknownDecision`] if the id is unknown or expired.
    pub fn explain(&self, id: &DecisionId) -> Result<Explanation, RouterError> {
        let entry = self
            .entries
            .get(id)
            .filter(|e| !self.is_expired(e.logged_at, Instant::now()))
            .ok_or(RouterError::UnknownDecision(*id))?;
        let mut explanation = Explanation::from_decision(&entry.decision);
        explanation.served_by = entry
            .served_by
            .clone()
            .filter(|served| *served != entry.decision.model_id);
        Ok(explanation)
    }
}

// ============================================================================
// Explanation
// ============================================================================

/// One factor's share of the composite score
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct FactorLine {
    pub name: &'static str,
    pub weight: f64,
    /// Value the weight was applied to
    pub value: f64,
    pub contribution: f64,
}

/// Why a decision picked its model
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Explanation {
    pub decision_id: DecisionId,
    pub model_id: String,
    pub decided_at: DateTime<Utc>,
    pub health: HealthState,
    pub overridden: bool,
    pub query_tags: Vec<(String, f64)>,
    pub composite: f64,
    pub factors: Vec<FactorLine>,
    /// Runner-up model and its composite score
    pub runner_up: Option<(String, f64)>,
    pub context_node_ids: Vec<NodeId>,
    /// Fallback model that answered instead of the chosen one
    pub served_by: Option<String>,
}

impl Explanation {
    #[must_use]
    pub fn from_decision(decision: &RoutingDecision) -> Self {
        let w = &decision.weights;
        let f = &decision.factors;
        let factors = [
            ("capability_match", w.capability, f.capability_match),
            ("latency (1 - normalized)", w.latency, 1.0 - f.normalized_latency),
            ("success_rate", w.success, f.success_rate),
            ("satisfaction_avg", w.satisfaction, f.satisfaction_avg),
            ("context_affinity", w.affinity, f.context_affinity),
        ]
        .into_iter()
        .map(|(name, weight, value)| FactorLine {
            name,
            weight,
            value,
            contribution: weight * value,
        })
        .collect();

        Self {
            decision_id: decision.id,
            model_id: decision.model_id.clone(),
            decided_at: decision.decided_at,
            health: decision.health,
            overridden: decision.overridden,
            query_tags: decision
                .query_tags
                .iter()
                .map(|(tag, weight)| (tag.clone(), *weight))
                .collect(),
            composite: decision.composite,
            factors,
            runner_up: decision
                .runner_up()
                .map(|c| (c.model_id.clone(), c.composite)),
            context_node_ids: decision.context_node_ids.clone(),
            served_by: None,
        }
    }

    /// Fixed-format multi-line text
    #[must_use]
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "decision {} routed to {} (health at decision: {}, decided {})",
            self.decision_id,
            self.model_id,
            self.health,
            self.decided_at.to_rfc3339_opts(SecondsFormat::Millis, true),
        );
        if let Some(served_by) = &self.served_by {
            let _ = writeln!(out, "served by: {served_by} (fallback)");
        }
        let _ = writeln!(
            out,
            "selection: {}",
            if self.overridden {
                "explicit override"
            } else {
                "highest composite score"
            }
        );
        let tags = self
            .query_tags
            .iter()
            .map(|(tag, weight)| format!("{tag}={weight:.2}"))
            .collect::<Vec<_>>()
            .join(", ");
        let _ = writeln!(out, "query tags: {tags}");
        let _ = writeln!(out, "composite score: {:.4}", self.composite);
        for line in &self.factors {
            let _ = writeln!(
                out,
                "  {:<26} {:.2} x {:.4} = {:.4}",
                line.name, line.weight, line.value, line.contribution
            );
        }
        match &self.runner_up {
            Some((model_id, composite)) => {
                let _ = writeln!(
                    out,
                    "runner-up: {model_id} ({composite:.4}, margin {:.4})",
                    self.composite - composite
                );
            }
            None => {
                let _ = writeln!(out, "runner-up: none");
            }
        }
        let nodes = if self.context_node_ids.is_empty() {
            "none".to_string()
        } else {
            self.context_node_ids
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ")
        };
        let _ = write!(out, "context nodes: {nodes}");
        out
    }
}

impl fmt::Display for Explanation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendError, Completion, CompletionBackend, CompletionRequest};
    use crate::graph::ContextSubgraph;
    use crate::registry::ModelDescriptor;
    use crate::selector::{Query, Selector};
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;

    struct Null;

    #[async_trait]
    impl CompletionBackend for Null {
        fn name(&self) -> &str {
            "null"
        }

        async fn complete(&self, _request: &CompletionRequest) -> Result<Completion, BackendError> {
            Err(BackendError::permanent("unused"))
        }
    }

    fn registry() -> ModelRegistry {
        let registry = ModelRegistry::default();
        registry
            .register(ModelDescriptor::new("alpha", Arc::new(Null)).with_capability("analysis", 1.0))
            .unwrap();
        registry
            .register(ModelDescriptor::new("beta", Arc::new(Null)).with_capability("analysis", 0.4))
            .unwrap();
        registry
    }

    fn decide(registry: &ModelRegistry, query: &Query) -> RoutingDecision {
        Selector::default()
            .select(query, &registry.snapshot(), &ContextSubgraph::default())
            .unwrap()
    }

    #[tokio::test]
    async fn test_feedback_is_not_idempotent() {
        let registry = registry();
        let log = DecisionLog::default();
        let decision = log.insert(decide(&registry, &Query::new("summarize this log")));

        let first = log.submit_feedback(&registry, &decision.id, 1.0);
        let second = log.submit_feedback(&registry, &decision.id, 0.0);

        let (FeedbackOutcome::Applied { satisfaction_avg: a, .. }, FeedbackOutcome::Applied { satisfaction_avg: b, .. }) =
            (first, second)
        else {
            panic!("feedback should apply");
        };
        assert!(a > 0.5);
        assert!(b < a);
        assert_eq!(log.feedback(&decision.id).len(), 2);
        assert_eq!(registry.record("alpha").unwrap().feedback_count, 2);
    }

    #[tokio::test]
    async fn test_unknown_and_invalid_feedback_ignored() {
        let registry = registry();
        let log = DecisionLog::default();
        let decision = log.insert(decide(&registry, &Query::new("summarize this log")));

        assert_eq!(
            log.submit_feedback(&registry, &DecisionId::new(), 1.0),
            FeedbackOutcome::UnknownDecision
        );
        assert_eq!(
            log.submit_feedback(&registry, &decision.id, f64::NAN),
            FeedbackOutcome::InvalidScore
        );
        assert!(registry.record("alpha").map_or(true, |r| r.feedback_count == 0));
    }

    #[tokio::test]
    async fn test_scores_are_clamped() {
        let registry = registry();
        let log = DecisionLog::default();
        let decision = log.insert(decide(&registry, &Query::new("summarize this log")));

        log.submit_feedback(&registry, &decision.id, 7.0);
        assert_eq!(log.feedback(&decision.id)[0].score, 1.0);
    }

    #[tokio::test]
    async fn test_capacity_drops_oldest() {
        let registry = registry();
        let log = DecisionLog::new(FeedbackConfig {
            max_decisions: 2,
            ..Default::default()
        });
        let first = log.insert(decide(&registry, &Query::new("one")));
        let second = log.insert(decide(&registry, &Query::new("two")));
        let third = log.insert(decide(&registry, &Query::new("three")));

        assert_eq!(log.len(), 2);
        assert!(log.get(&first.id).is_none());
        assert!(log.get(&second.id).is_some());
        assert!(log.get(&third.id).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_decisions_are_unknown() {
        let registry = registry();
        let log = DecisionLog::new(FeedbackConfig {
            decision_ttl_secs: 60,
            ..Default::default()
        });
        let decision = log.insert(decide(&registry, &Query::new("summarize this log")));

        tokio::time::advance(Duration::from_secs(61)).await;

        assert!(matches!(
            log.explain(&decision.id),
            Err(RouterError::UnknownDecision(_))
        ));
        assert_eq!(
            log.submit_feedback(&registry, &decision.id, 1.0),
            FeedbackOutcome::UnknownDecision
        );
    }

    #[tokio::test]
    async fn test_explanation_is_stable() {
        let registry = registry();
        let log = DecisionLog::default();
        let query = Query::new("summarize this log").with_context_type("analysis");
        let decision = log.insert(decide(&registry, &query));

        let before = log.explain(&decision.id).unwrap().render();
        registry.record_outcome("alpha", Duration::from_millis(20_000), false);
        registry.record_feedback("alpha", 0.0);
        let after = log.explain(&decision.id).unwrap().render();

        assert_eq!(before, after);
        assert!(before.contains("routed to alpha"));
        assert!(before.contains("capability_match"));
        assert!(before.contains("selection: highest composite score"));
        assert!(before.contains("runner-up: beta"));
        assert!(before.ends_with("context nodes: none"));
    }

    #[tokio::test]
    async fn test_factor_contributions_sum_to_composite() {
        let registry = registry();
        let decision = decide(&registry, &Query::new("summarize this log"));
        let explanation = Explanation::from_decision(&decision);

        let total: f64 = explanation.factors.iter().map(|l| l.contribution).sum();
        assert!((total - decision.composite).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_conversation_satisfaction() {
        let registry = registry();
        let log = DecisionLog::default();
        let a = log.insert(decide(&registry, &Query::new("first").with_conversation("c1")));
        let b = log.insert(decide(&registry, &Query::new("second").with_conversation("c1")));
        let other = log.insert(decide(&registry, &Query::new("third").with_conversation("c2")));

        log.submit_feedback(&registry, &a.id, 1.0);
        log.submit_feedback(&registry, &b.id, 0.5);
        log.submit_feedback(&registry, &other.id, 0.0);

        let avg = log.conversation_satisfaction("c1").unwrap();
        assert!((avg - 0.75).abs() < 1e-9);
        assert_eq!(log.conversation_satisfaction("nobody"), None);
    }
}
