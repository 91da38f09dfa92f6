//! Request Dispatcher
//!
//! Sends a routed query to its backend and falls back down the ranking when
//! the backend fails.
//!
//! ```text
//! decision.model_id --fail--> ranking[1] --fail--> ranking[2] --fail--> AllBackendsFailed
//!        |                        |                    |
//!        ok                       ok                   ok
//!        v                        v                    v
//!     Response                 Response             Response
//! ```
//!
//! - At most `1 + max_retries` backend calls per query.
//! - Each call is bounded by the dispatch timeout.
//! - Only transient failures move on to the next candidate; a permanent
//!   one ends the chain.
//! - Candidates that became ineligible since the decision are skipped.
//!
//! Every call's outcome is buffered and written to the registry before the
//! dispatcher returns. A call abandoned mid-flight (token cancelled or
//! future dropped) is recorded as cancelled by the buffer's `Drop`.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::{CompletionRequest, TokenUsage};
use crate::config::DispatchConfig;
use crate::error::{AttemptError, AttemptErrorKind, RouterError};
use crate::graph::ContextSubgraph;
use crate::metrics::RouterMetrics;
use crate::registry::{Admission, ModelRegistry};
use crate::selector::{Query, RoutingDecision};

/// A successful backend response
#[derive(Clone, Debug, PartialEq)]
pub struct Response {
    pub text: String,
    pub token_usage: Option<TokenUsage>,
    /// Model that actually answered
    pub model_id: String,
    /// Backend calls made, including the successful one
    pub attempts: usize,
    /// Wall time from dispatch to answer
    pub latency: Duration,
}

/// Build the prompt a backend sees: retrieved context, then the query
#[must_use]
pub fn compose_prompt(query: &Query, context: &ContextSubgraph) -> String {
    if context.is_empty() {
        return query.text.clone();
    }
    let mut prompt = String::from("Relevant earlier context:\n");
    for node in context.iter() {
        prompt.push_str("- ");
        prompt.push_str(&node.summary);
        prompt.push('\n');
    }
    prompt.push('\n');
    prompt.push_str(&query.text);
    prompt
}

// ============================================================================
// Outcome buffer
// ============================================================================

enum Outcome {
    Completed { latency: Duration, success: bool },
    Cancelled,
}

/// Buffers per-call outcomes and writes them to the registry
struct OutcomeLedger<'a> {
    registry: &'a ModelRegistry,
    pending: Vec<(String, Outcome)>,
    /// Model with a call currently outstanding
    current: Option<String>,
}

impl<'a> OutcomeLedger<'a> {
    fn new(registry: &'a ModelRegistry) -> Self {
        Self {
            registry,
            pending: Vec::new(),
            current: None,
        }
    }

    fn begin(&mut self, model_id: &str) {
        self.current = Some(model_id.to_string());
    }

    fn finish(&mut self, latency: Duration, success: bool) {
        if let Some(model_id) = self.current.take() {
            self.pending
                .push((model_id, Outcome::Completed { latency, success }));
        }
    }

    fn flush(&mut self) {
        for (model_id, outcome) in self.pending.drain(..) {
            match outcome {
                Outcome::Completed { latency, success } => {
                    self.registry.record_outcome(&model_id, latency, success);
                }
                Outcome::Cancelled => self.registry.record_cancelled(&model_id),
            }
        }
    }
}

impl Drop for OutcomeLedger<'_> {
    fn drop(&mut self) {
        if let Some(model_id) = self.current.take() {
            debug!(model_id = %model_id, "Recording abandoned call as cancelled");
            self.pending.push((model_id, Outcome::Cancelled));
        }
        self.flush();
    }
}

// ============================================================================
// Dispatcher
// ============================================================================

/// Executes routing decisions against backends
pub struct Dispatcher {
    registry: Arc<ModelRegistry>,
    config: DispatchConfig,
    metrics: Arc<RouterMetrics>,
}

impl Dispatcher {
    #[must_use]
    pub fn new(
        registry: Arc<ModelRegistry>,
        config: DispatchConfig,
        metrics: Arc<RouterMetrics>,
    ) -> Self {
        Self {
            registry,
            config,
            metrics,
        }
    }

    #[must_use]
    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// Dispatch without an external cancellation signal
    ///
    /// # Errors
    ///
    /// See [`Dispatcher::dispatch_with_cancel`].
    pub async fn dispatch(
        &self,
        decision: &RoutingDecision,
        query: &Query,
        context: &ContextSubgraph,
    ) -> Result<Response, RouterError> {
        self.dispatch_with_cancel(decision, query, context, &CancellationToken::new())
            .await
    }

    /// Run the attempt chain for a decision
    ///
    /// # Errors
    ///
    /// - [`RouterError::Cancelled`] if `cancel` fires first
    /// - [`RouterError::AllBackendsFailed`] if every attempt failed
    /// - [`RouterError::NoAvailableModel`] if no candidate could be admitted at all
    pub async fn dispatch_with_cancel(
        &self,
        decision: &RoutingDecision,
        query: &Query,
        context: &ContextSubgraph,
        cancel: &CancellationToken,
    ) -> Result<Response, RouterError> {
        let request = CompletionRequest::new(compose_prompt(query, context))
            .with_max_tokens(self.config.max_tokens)
            .with_temperature(self.config.temperature);

        let mut seen = HashSet::new();
        let plan: Vec<&str> = std::iter::once(decision.model_id.as_str())
            .chain(decision.fallbacks())
            .filter(|id| seen.insert(*id))
            .collect();

        let max_attempts = self.config.max_retries as usize + 1;
        let started = Instant::now();
        let mut ledger = OutcomeLedger::new(&self.registry);
        let mut errors: Vec<AttemptError> = Vec::new();
        let mut next = 0;

        while errors.len() < max_attempts {
            let Some(idx) = (next..plan.len()).find(|&i| {
                self.registry
                    .eligibility(plan[i])
                    .is_some_and(|e| e.allows_selection())
            }) else {
                break;
            };
            next = idx + 1;
            let model_id = plan[idx];

            if !errors.is_empty() {
                let retry = u32::try_from(errors.len() - 1).unwrap_or(u32::MAX);
                let backoff = self.config.backoff_for_attempt(retry);
                self.metrics.retries.inc();
                debug!(
                    decision_id = %decision.id,
                    model_id = %model_id,
                    backoff_ms = backoff.as_millis() as u64,
                    "Falling back"
                );
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => {
                        self.metrics.cancellations.inc();
                        return Err(RouterError::Cancelled);
                    }
                    () = tokio::time::sleep(backoff) => {}
                }
            }

            let Some(descriptor) = self.registry.descriptor(model_id) else {
                continue;
            };
            let Some(admission) = self.registry.admit(model_id) else {
                continue;
            };

            let _in_flight = self.registry.begin_request(model_id);
            ledger.begin(model_id);
            self.metrics.attempts.inc();
            let call_started = Instant::now();

            let outcome = tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    self.metrics.cancellations.inc();
                    info!(decision_id = %decision.id, model_id = %model_id, "Request cancelled by caller");
                    return Err(RouterError::Cancelled);
                }
                result = tokio::time::timeout(self.config.timeout(), descriptor.backend.complete(&request)) => result,
            };
            let latency = call_started.elapsed();

            match outcome {
                Ok(Ok(completion)) => {
                    ledger.finish(latency, true);
                    ledger.flush();

                    let total = started.elapsed();
                    self.metrics.dispatch_successes.inc();
                    self.metrics.dispatch_latency.record(total);
                    if model_id != decision.model_id || admission == Admission::Probe {
                        info!(
                            decision_id = %decision.id,
                            model_id = %model_id,
                            attempts = errors.len() + 1,
                            probe = admission == Admission::Probe,
                            "Answered by fallback candidate"
                        );
                    }

                    return Ok(Response {
                        text: completion.text,
                        token_usage: completion.token_usage,
                        model_id: model_id.to_string(),
                        attempts: errors.len() + 1,
                        latency: total,
                    });
                }
                Ok(Err(err)) => {
                    ledger.finish(latency, false);
                    warn!(
                        decision_id = %decision.id,
                        model_id = %model_id,
                        status = ?err.status,
                        transient = err.transient,
                        error = %err,
                        "Backend call failed"
                    );
                    let transient = err.transient;
                    errors.push(AttemptError {
                        model_id: model_id.to_string(),
                        kind: AttemptErrorKind::Backend {
                            status: err.status,
                            transient,
                        },
                        message: err.message,
                    });
                    if !transient {
                        break;
                    }
                }
                Err(_elapsed) => {
                    let timeout = self.config.timeout();
                    ledger.finish(timeout, false);
                    self.metrics.timeouts.inc();
                    warn!(
                        decision_id = %decision.id,
                        model_id = %model_id,
                        timeout_ms = timeout.as_millis() as u64,
                        "Backend call timed out"
                    );
                    errors.push(AttemptError {
                        model_id: model_id.to_string(),
                        kind: AttemptErrorKind::Timeout { after: timeout },
                        message: "deadline elapsed".to_string(),
                    });
                }
            }
        }

        ledger.flush();
        self.metrics.dispatch_failures.inc();

        if errors.is_empty() {
            warn!(decision_id = %decision.id, "No candidate could be admitted");
            return Err(RouterError::NoAvailableModel {
                candidates: plan.len(),
            });
        }
        warn!(
            decision_id = %decision.id,
            attempts = errors.len(),
            "All backends failed"
        );
        Err(RouterError::AllBackendsFailed { attempts: errors })
    }
}
