//! Adaptive Model Selector
//!
//! Scores every eligible model for a query and picks the best one.
//!
//! # Scoring
//!
//! ```text
//! composite = w_cap  * capability_match
//!           + w_lat  * (1 - normalized_latency)
//!           + w_succ * success_rate
//!           + w_sat  * satisfaction_avg
//!           + w_aff  * context_affinity
//! ```
//!
//! - `capability_match` is a weighted mean of the model's proficiency over
//!   the query's tags. Tags held by fewer candidates count for more
//!   (`1 / (1 + ln df)`), so a niche skill outweighs one everybody has.
//! - `normalized_latency` is the latency EMA divided by the slowest
//!   eligible candidate's.
//! - `context_affinity` is the share of retrieved context nodes this model
//!   handled successfully.
//!
//! Ties (scores equal to 1e-9) go to the model with fewer requests in
//! flight, then to the lexicographically smaller id.
//!
//! [`Selector::rank`] is a pure function of its inputs; only
//! [`Selector::select`] mints an id and timestamp.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::RouterError;
use crate::graph::{ContextSubgraph, NodeId};
use crate::registry::{Eligibility, HealthState, RegistrySnapshot};

// ============================================================================
// Query
// ============================================================================

/// Weight of the caller-supplied context type
const CONTEXT_TYPE_WEIGHT: f64 = 1.0;
/// Weight of a tag inferred from keywords
const INFERRED_TAG_WEIGHT: f64 = 0.5;
/// Tag used when nothing else applies
const FALLBACK_TAG: &str = "general";

const KEYWORD_TAGS: &[(&str, &[&str])] = &[
    (
        "code",
        &[
            "code", "function", "implement", "bug", "fix", "compile", "refactor", "debug",
            "stacktrace",
        ],
    ),
    (
        "analysis",
        &[
            "analyze", "analyse", "analysis", "compare", "evaluate", "explain", "investigate",
            "diagnose", "log", "logs",
        ],
    ),
    (
        "summarization",
        &["summarize", "summarise", "summary", "tldr", "condense", "recap"],
    ),
    (
        "math",
        &["calculate", "solve", "equation", "prove", "math", "integral", "derivative"],
    ),
    (
        "creative",
        &["story", "poem", "creative", "imagine", "brainstorm", "fiction"],
    ),
];

const GREETINGS: &[&str] = &["hi", "hello", "hey", "thanks"];

/// A request to route
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Query {
    /// The user's text
    pub text: String,
    /// Caller-declared kind of request (e.g. "analysis")
    #[serde(default)]
    pub context_type: Option<String>,
    /// Model the caller wants, if any
    #[serde(default)]
    pub explicit_model: Option<String>,
    /// Conversation this query continues
    #[serde(default)]
    pub conversation_id: Option<String>,
}

impl Query {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_context_type(mut self, context_type: impl Into<String>) -> Self {
        self.context_type = Some(context_type.into());
        self
    }

    #[must_use]
    pub fn with_model(mut self, model_id: impl Into<String>) -> Self {
        self.explicit_model = Some(model_id.into());
        self
    }

    #[must_use]
    pub fn with_conversation(mut self, conversation_id: impl Into<String>) -> Self {
        self.conversation_id = Some(conversation_id.into());
        self
    }

    /// Capability tags this query asks for, with their weights
    ///
    /// The declared context type weighs 1.0; tags inferred from keywords
    /// weigh 0.5. A query with no tags at all asks for `general`.
    #[must_use]
    pub fn tags(&self) -> BTreeMap<String, f64> {
        let mut tags = BTreeMap::new();
        let lower = self.text.to_lowercase();
        let words: Vec<&str> = lower
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .collect();

        for (tag, keywords) in KEYWORD_TAGS {
            if words.iter().any(|w| keywords.contains(w)) {
                tags.insert((*tag).to_string(), INFERRED_TAG_WEIGHT);
            }
        }
        if lower.contains("```") {
            tags.insert("code".to_string(), INFERRED_TAG_WEIGHT);
        }
        if words.len() < 10 && words.iter().any(|w| GREETINGS.contains(w)) {
            tags.insert("quick".to_string(), INFERRED_TAG_WEIGHT);
        }

        if let Some(context_type) = self.context_type.as_deref().map(str::trim) {
            if !context_type.is_empty() {
                tags.insert(context_type.to_lowercase(), CONTEXT_TYPE_WEIGHT);
            }
        }

        if tags.is_empty() {
            tags.insert(FALLBACK_TAG.to_string(), INFERRED_TAG_WEIGHT);
        }
        tags
    }
}

// ============================================================================
// Weights and factors
// ============================================================================

/// Weights of the composite score; they sum to 1
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoreWeights {
    pub capability: f64,
    pub latency: f64,
    pub success: f64,
    pub satisfaction: f64,
    pub affinity: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            capability: 0.35,
            latency: 0.20,
            success: 0.20,
            satisfaction: 0.15,
            affinity: 0.10,
        }
    }
}

impl ScoreWeights {
    /// Check every weight is non-negative and the total is 1
    ///
    /// # Errors
    ///
    /// Returns a description of the problem.
    pub fn validate(&self) -> Result<(), String> {
        let all = [
            self.capability,
            self.latency,
            self.success,
            self.satisfaction,
            self.affinity,
        ];
        if all.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err("score weights must be finite and non-negative".to_string());
        }
        let sum: f64 = all.iter().sum();
        if (sum - 1.0).abs() > 1e-6 {
            return Err(format!("score weights must sum to 1, got {sum}"));
        }
        Ok(())
    }

    /// Combine factor scores into one number in [0, 1]
    #[must_use]
    pub fn composite(&self, factors: &FactorScores) -> f64 {
        self.capability * factors.capability_match
            + self.latency * (1.0 - factors.normalized_latency)
            + self.success * factors.success_rate
            + self.satisfaction * factors.satisfaction_avg
            + self.affinity * factors.context_affinity
    }
}

/// Per-factor inputs to the composite score, each in [0, 1]
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FactorScores {
    pub capability_match: f64,
    /// 1.0 is the slowest eligible candidate
    pub normalized_latency: f64,
    pub success_rate: f64,
    pub satisfaction_avg: f64,
    pub context_affinity: f64,
}

// ============================================================================
// Ranking
// ============================================================================

/// One scored candidate
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RankedCandidate {
    pub model_id: String,
    pub factors: FactorScores,
    pub composite: f64,
    pub in_flight: usize,
    pub health: HealthState,
    /// Dispatching to this model would be a recovery probe
    pub probe: bool,
}

impl RankedCandidate {
    fn score_key(&self) -> i64 {
        (self.composite * 1e9).round() as i64
    }
}

/// Eligible candidates, best first
#[derive(Clone, Debug, PartialEq)]
pub struct Ranking {
    pub candidates: Vec<RankedCandidate>,
    pub query_tags: BTreeMap<String, f64>,
    pub context_node_ids: Vec<NodeId>,
    /// The first candidate is there because the caller asked for it
    pub overridden: bool,
}

impl Ranking {
    #[must_use]
    pub fn top(&self) -> Option<&RankedCandidate> {
        self.candidates.first()
    }
}

// ============================================================================
// Decision
// ============================================================================

/// Identifier of a routing decision
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DecisionId(Uuid);

impl DecisionId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    #[must_use]
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for DecisionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for DecisionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for DecisionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// The selector's verdict for one query
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RoutingDecision {
    pub id: DecisionId,
    pub decided_at: DateTime<Utc>,
    /// Chosen model
    pub model_id: String,
    pub conversation_id: Option<String>,
    pub query_tags: BTreeMap<String, f64>,
    /// Factor scores of the chosen model
    pub factors: FactorScores,
    pub composite: f64,
    /// Weights in effect when the decision was made
    pub weights: ScoreWeights,
    /// Health of the chosen model at decision time
    pub health: HealthState,
    pub overridden: bool,
    pub context_node_ids: Vec<NodeId>,
    /// Full ranking, chosen model first
    pub ranking: Vec<RankedCandidate>,
}

impl RoutingDecision {
    /// Best candidate other than the chosen one
    #[must_use]
    pub fn runner_up(&self) -> Option<&RankedCandidate> {
        self.ranking.get(1)
    }

    /// Candidates the dispatcher may fall back to, in order
    pub fn fallbacks(&self) -> impl Iterator<Item = &str> {
        self.ranking.iter().skip(1).map(|c| c.model_id.as_str())
    }
}

// ============================================================================
// Selector
// ============================================================================

/// Scores eligible models and picks one
#[derive(Clone, Debug, Default)]
pub struct Selector {
    weights: ScoreWeights,
}

impl Selector {
    #[must_use]
    pub fn new(weights: ScoreWeights) -> Self {
        Self { weights }
    }

    #[must_use]
    pub fn weights(&self) -> &ScoreWeights {
        &self.weights
    }

    /// Score and order every eligible model
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::NoAvailableModel`] when no model is eligible.
    pub fn rank(
        &self,
        query: &Query,
        snapshot: &RegistrySnapshot,
        context: &ContextSubgraph,
    ) -> Result<Ranking, RouterError> {
        let eligible: Vec<_> = snapshot.eligible().collect();
        if eligible.is_empty() {
            return Err(RouterError::NoAvailableModel {
                candidates: snapshot.len(),
            });
        }

        let query_tags = query.tags();
        let specificity: BTreeMap<&str, f64> = query_tags
            .keys()
            .map(|tag| {
                let df = eligible
                    .iter()
                    .filter(|s| s.capabilities.get(tag).is_some_and(|p| *p > 0.0))
                    .count();
                let s = if df == 0 {
                    1.0
                } else {
                    1.0 / (1.0 + (df as f64).ln())
                };
                (tag.as_str(), s)
            })
            .collect();
        let denominator: f64 = query_tags
            .iter()
            .map(|(tag, w)| w * specificity[tag.as_str()])
            .sum();

        let max_latency = eligible
            .iter()
            .map(|s| s.latency_ema_ms)
            .fold(0.0_f64, f64::max);

        let total_nodes = context.len();

        let mut candidates: Vec<RankedCandidate> = eligible
            .iter()
            .map(|stats| {
                let capability_match = if denominator > 0.0 {
                    query_tags
                        .iter()
                        .map(|(tag, w)| {
                            let p = stats.capabilities.get(tag).copied().unwrap_or(0.0);
                            w * p * specificity[tag.as_str()]
                        })
                        .sum::<f64>()
                        / denominator
                } else {
                    0.0
                };
                let normalized_latency = if max_latency > 0.0 {
                    (stats.latency_ema_ms / max_latency).clamp(0.0, 1.0)
                } else {
                    0.0
                };
                let context_affinity = if total_nodes > 0 {
                    context.successes_for(&stats.model_id) as f64 / total_nodes as f64
                } else {
                    0.0
                };

                let factors = FactorScores {
                    capability_match,
                    normalized_latency,
                    success_rate: stats.success_rate.clamp(0.0, 1.0),
                    satisfaction_avg: stats.satisfaction_avg.clamp(0.0, 1.0),
                    context_affinity,
                };
                RankedCandidate {
                    model_id: stats.model_id.clone(),
                    composite: self.weights.composite(&factors),
                    factors,
                    in_flight: stats.in_flight,
                    health: stats.health,
                    probe: stats.eligibility == Eligibility::ProbeReady,
                }
            })
            .collect();

        candidates.sort_by(compare_candidates);

        let mut overridden = false;
        if let Some(ref wanted) = query.explicit_model {
            match candidates.iter().position(|c| &c.model_id == wanted) {
                Some(idx) => {
                    let chosen = candidates.remove(idx);
                    candidates.insert(0, chosen);
                    overridden = true;
                }
                None if snapshot.get(wanted).is_some() => {
                    warn!(model_id = %wanted, "Requested model is not eligible, ignoring override");
                }
                None => {
                    warn!(model_id = %wanted, "Requested model is not registered, ignoring override");
                }
            }
        }

        Ok(Ranking {
            candidates,
            query_tags,
            context_node_ids: context.node_ids(),
            overridden,
        })
    }

    /// Rank and wrap the winner in a [`RoutingDecision`]
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::NoAvailableModel`] when no model is eligible.
    pub fn select(
        &self,
        query: &Query,
        snapshot: &RegistrySnapshot,
        context: &ContextSubgraph,
    ) -> Result<RoutingDecision, RouterError> {
        let ranking = self.rank(query, snapshot, context)?;
        let top = ranking
            .top()
            .cloned()
            .ok_or(RouterError::NoAvailableModel {
                candidates: snapshot.len(),
            })?;

        let decision = RoutingDecision {
            id: DecisionId::new(),
            decided_at: Utc::now(),
            model_id: top.model_id,
            conversation_id: query.conversation_id.clone(),
            query_tags: ranking.query_tags,
            factors: top.factors,
            composite: top.composite,
            weights: self.weights.clone(),
            health: top.health,
            overridden: ranking.overridden,
            context_node_ids: ranking.context_node_ids,
            ranking: ranking.candidates,
        };

        debug!(
            decision_id = %decision.id,
            model_id = %decision.model_id,
            composite = decision.composite,
            candidates = decision.ranking.len(),
            overridden = decision.overridden,
            "Selected model"
        );

        Ok(decision)
    }
}

fn compare_candidates(a: &RankedCandidate, b: &RankedCandidate) -> Ordering {
    b.score_key()
        .cmp(&a.score_key())
        .then_with(|| a.in_flight.cmp(&b.in_flight))
        .then_with(|| a.model_id.cmp(&b.model_id))
}
