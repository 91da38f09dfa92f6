//! Router facade
//!
//! Wires the registry, context graph, selector, dispatcher and decision log
//! into the inbound interface.
//!
//! ```text
//! route(query)
//!   ├─► graph.retrieve_relevant ──► registry.snapshot ──► selector.select
//!   ├─► decisions.insert
//!   ├─► dispatcher.dispatch  (retries / fallback / timeout / cancel)
//!   └─► graph.insert         (success only, FollowUp within a conversation)
//! ```

use std::path::Path;
use std::sync::Arc;

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::advisor::Advisor;
use crate::backend::{CompletionBackend, CompletionRequest};
use crate::config::RouterConfig;
use crate::dispatch::{Dispatcher, Response};
use crate::error::RouterError;
use crate::feedback::{DecisionLog, Explanation, FeedbackOutcome};
use crate::graph::{ContextGraph, NewNode, NodeId};
use crate::metrics::{MetricsSnapshot, RouterMetrics};
use crate::persistence::{self, StateSnapshot};
use crate::registry::{ModelDescriptor, ModelRegistry, RegistrySnapshot};
use crate::selector::{DecisionId, Query, Selector};

/// Characters of query and response text kept in a context node summary
const SUMMARY_CHARS: usize = 240;

/// Answer to a routed query
#[derive(Clone, Debug, PartialEq)]
pub struct RouteResponse {
    pub response: Response,
    pub decision_id: DecisionId,
}

/// The routing core behind one process
pub struct Router {
    config: RouterConfig,
    registry: Arc<ModelRegistry>,
    graph: Arc<ContextGraph>,
    selector: Selector,
    dispatcher: Dispatcher,
    decisions: DecisionLog,
    metrics: Arc<RouterMetrics>,
    /// Latest context node of each conversation
    conversations: DashMap<String, NodeId>,
}

impl Router {
    /// Build a router and register every model in `config`
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid, a backend cannot be
    /// built, or two models share an id.
    pub fn new(config: RouterConfig) -> Result<Self, RouterError> {
        let router = Self::empty(config)?;
        for entry in &router.config.models {
            router.registry.register(entry.to_descriptor()?)?;
        }
        info!(
            models = router.registry.len(),
            source = %router.config.source(),
            "Router ready"
        );
        Ok(router)
    }

    /// Build a router with no models registered
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn empty(config: RouterConfig) -> Result<Self, RouterError> {
        config.validate()?;
        let metrics = Arc::new(RouterMetrics::new());
        let registry = Arc::new(ModelRegistry::new(&config.registry));
        Ok(Self {
            registry: Arc::clone(&registry),
            graph: Arc::new(ContextGraph::new(config.graph.clone())),
            selector: Selector::new(config.selector.weights.clone()),
            dispatcher: Dispatcher::new(registry, config.dispatch.clone(), Arc::clone(&metrics)),
            decisions: DecisionLog::new(config.feedback.clone()),
            metrics,
            conversations: DashMap::new(),
            config,
        })
    }

    #[must_use]
    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    #[must_use]
    pub fn graph(&self) -> &Arc<ContextGraph> {
        &self.graph
    }

    #[must_use]
    pub fn decisions(&self) -> &DecisionLog {
        &self.decisions
    }

    /// # Errors
    ///
    /// Returns [`RouterError::DuplicateModel`] if the id is taken.
    pub fn register_model(&self, descriptor: ModelDescriptor) -> Result<(), RouterError> {
        self.registry.register(descriptor)
    }

    /// # Errors
    ///
    /// Returns [`RouterError::UnknownModel`] if nothing is registered under `model_id`.
    pub fn remove_model(&self, model_id: &str) -> Result<ModelDescriptor, RouterError> {
        self.registry.remove(model_id)
    }

    /// Per-model statistics
    #[must_use]
    pub fn stats(&self) -> RegistrySnapshot {
        self.registry.snapshot()
    }

    #[must_use]
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Advisor sharing this router's registry
    #[must_use]
    pub fn advisor(&self) -> Arc<Advisor> {
        Arc::new(Advisor::new(
            Arc::clone(&self.registry),
            self.config.advisor.clone(),
        ))
    }

    // ========================================================================
    // Inbound interface
    // ========================================================================

    /// Route free text with an optional context type and model override
    ///
    /// # Errors
    ///
    /// See [`Router::route_with_cancel`].
    pub async fn route_query(
        &self,
        text: &str,
        context_type: Option<&str>,
        explicit_model: Option<&str>,
    ) -> Result<RouteResponse, RouterError> {
        let mut query = Query::new(text);
        if let Some(context_type) = context_type {
            query = query.with_context_type(context_type);
        }
        if let Some(model_id) = explicit_model {
            query = query.with_model(model_id);
        }
        self.route(query).await
    }

    /// # Errors
    ///
    /// See [`Router::route_with_cancel`].
    pub async fn route(&self, query: Query) -> Result<RouteResponse, RouterError> {
        self.route_with_cancel(query, &CancellationToken::new())
            .await
    }

    /// Select a model for `query`, dispatch it and remember the exchange
    ///
    /// # Errors
    ///
    /// - [`RouterError::NoAvailableModel`] when nothing is eligible
    /// - [`RouterError::AllBackendsFailed`] when every attempt failed
    /// - [`RouterError::Cancelled`] when `cancel` fires first
    pub async fn route_with_cancel(
        &self,
        query: Query,
        cancel: &CancellationToken,
    ) -> Result<RouteResponse, RouterError> {
        self.metrics.queries.inc();

        let context = self
            .graph
            .retrieve_relevant(&query, self.config.graph.retrieve_max_nodes);
        let snapshot = self.registry.snapshot();

        let decision = match self.selector.select(&query, &snapshot, &context) {
            Ok(decision) => decision,
            Err(e) => {
                if matches!(e, RouterError::NoAvailableModel { .. }) {
                    self.metrics.no_model_available.inc();
                }
                warn!(error = %e, "Selection failed");
                return Err(e);
            }
        };
        self.metrics.decisions.inc();
        if decision.overridden {
            self.metrics.overrides.inc();
        }
        let decision = self.decisions.insert(decision);

        let response = self
            .dispatcher
            .dispatch_with_cancel(&decision, &query, &context, cancel)
            .await?;
        self.decisions.record_served(&decision.id, &response.model_id);

        self.remember(&query, &response);

        info!(
            decision_id = %decision.id,
            model_id = %response.model_id,
            attempts = response.attempts,
            latency_ms = response.latency.as_millis() as u64,
            "Query routed"
        );

        Ok(RouteResponse {
            response,
            decision_id: decision.id,
        })
    }

    fn remember(&self, query: &Query, response: &Response) {
        let summary = format!(
            "{} => {}",
            truncate_chars(&query.text, SUMMARY_CHARS),
            truncate_chars(&response.text, SUMMARY_CHARS)
        );
        let mut node = NewNode::new(summary)
            .with_context_type(query.context_type.as_deref())
            .handled_by(&response.model_id, true);

        let previous = query
            .conversation_id
            .as_ref()
            .and_then(|c| self.conversations.get(c).map(|n| *n))
            .filter(|id| self.graph.contains(*id));
        if let Some(previous) = previous {
            node = node.follows(previous);
        }

        let insertion = self.graph.insert(node);
        self.metrics.nodes_added.inc();
        self.metrics.nodes_evicted.add(insertion.evicted.len() as u64);
        if !insertion.evicted.is_empty() {
            if let Err(e) = self.graph.verify() {
                error!(
                    error = %e,
                    evicted = insertion.evicted.len(),
                    "Context graph inconsistent after eviction"
                );
                debug_assert!(false, "context graph inconsistent after eviction: {e}");
            }
        }

        if let Some(conversation_id) = &query.conversation_id {
            self.conversations
                .insert(conversation_id.clone(), insertion.id);
        }
        debug!(
            node_id = %insertion.id,
            auto_links = insertion.auto_links,
            evicted = insertion.evicted.len(),
            "Remembered exchange"
        );
    }

    /// Rate a decision; unknown ids are logged and ignored
    pub fn submit_feedback(&self, decision_id: &DecisionId, score: f64) -> FeedbackOutcome {
        let outcome = self
            .decisions
            .submit_feedback(&self.registry, decision_id, score);
        if outcome.is_applied() {
            self.metrics.feedback_applied.inc();
        } else {
            self.metrics.feedback_ignored.inc();
        }
        outcome
    }

    /// # Errors
    ///
    /// Returns [`RouterError::UnknownDecision`] if the id is unknown or expired.
    pub fn explanation(&self, decision_id: &DecisionId) -> Result<Explanation, RouterError> {
        self.decisions.explain(decision_id)
    }

    /// Rendered explanation text
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::UnknownDecision`] if the id is unknown or expired.
    pub fn get_explanation(&self, decision_id: &DecisionId) -> Result<String, RouterError> {
        self.explanation(decision_id).map(|e| e.render())
    }

    /// Ask `backend` to paraphrase an explanation
    ///
    /// Falls back to the structured text if the backend fails or times out.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::UnknownDecision`] if the id is unknown or expired.
    pub async fn narrate(
        &self,
        decision_id: &DecisionId,
        backend: &dyn CompletionBackend,
    ) -> Result<String, RouterError> {
        let structured = self.get_explanation(decision_id)?;
        let request = CompletionRequest::new(format!(
            "Rewrite this routing explanation as two short sentences for an end user. \
             Keep model names and numbers.\n\n{structured}"
        ))
        .with_temperature(0.2);

        match tokio::time::timeout(self.config.dispatch.timeout(), backend.complete(&request)).await {
            Ok(Ok(completion)) if !completion.text.trim().is_empty() => {
                Ok(completion.text.trim().to_string())
            }
            Ok(Ok(_)) => Ok(structured),
            Ok(Err(e)) => {
                warn!(decision_id = %decision_id, error = %e, "Narration failed, using structured text");
                Ok(structured)
            }
            Err(_) => {
                warn!(decision_id = %decision_id, "Narration timed out, using structured text");
                Ok(structured)
            }
        }
    }

    /// Mean feedback score of a conversation's decisions
    #[must_use]
    pub fn conversation_satisfaction(&self, conversation_id: &str) -> Option<f64> {
        self.decisions.conversation_satisfaction(conversation_id)
    }

    // ========================================================================
    // Persistence
    // ========================================================================

    /// Write performance records and the context graph to `path`
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::Persistence`] if the file cannot be written.
    pub async fn save_state(&self, path: &Path) -> Result<(), RouterError> {
        let snapshot = StateSnapshot::new(self.registry.export_records(), self.graph.export());
        persistence::save(path, &snapshot).await?;
        Ok(())
    }

    /// Load state saved by [`Router::save_state`]; returns whether a file existed
    ///
    /// # Errors
    ///
    /// Returns an error if the file is unreadable or its graph is inconsistent.
    pub async fn restore_state(&self, path: &Path) -> Result<bool, RouterError> {
        let Some(snapshot) = persistence::load(path).await? else {
            return Ok(false);
        };
        let records = snapshot.records.len();
        let nodes = snapshot.graph.nodes.len();
        self.graph.restore(snapshot.graph)?;
        self.registry.restore_records(snapshot.records);
        self.conversations.clear();
        info!(
            path = %path.display(),
            records,
            nodes,
            saved_at = %snapshot.saved_at,
            "Restored router state"
        );
        Ok(true)
    }
}

fn truncate_chars(text: &str, max: usize) -> String {
    let text = text.trim();
    match text.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}
