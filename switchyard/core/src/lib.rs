//! Switchyard Core - Adaptive Request Routing
//!
//! Routes each incoming query to whichever registered text-completion backend
//! is most likely to answer it well, learning from outcomes and user feedback
//! as it goes. The crate is headless: GUIs, voice front-ends and CLIs sit on
//! top of [`Router`] and only ever see responses, decision ids and
//! explanations.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────────┐
//! │                             Router                                  │
//! │                                                                     │
//! │   query ──► ContextGraph ──► ModelRegistry ──► Selector             │
//! │             (retrieve)       (snapshot)        (rank + decide)      │
//! │                                                    │                │
//! │                                                    ▼                │
//! │   response ◄── Dispatcher ◄──────────────── DecisionLog             │
//! │                (timeout, fallback,           (feedback, explain)    │
//! │                 cancellation)                                       │
//! │                    │                                                │
//! │                    ├──► ModelRegistry   (latency / success EMAs,    │
//! │                    │                     circuit breaker)           │
//! │                    └──► ContextGraph    (remember the exchange)     │
//! └────────────────────────────────────────────────────────────────────┘
//!            ▲                                            │
//!            │ Advisor (interval task: fold, probe, suggest)
//!            └────────────────────────────────────────────┘
//! ```
//!
//! # Module Overview
//!
//! - [`registry`]: model descriptors, performance records, health monitor
//! - [`selector`]: composite scoring and routing decisions
//! - [`graph`]: bounded context memory graph
//! - [`dispatch`]: backend calls with retry, fallback and cancellation
//! - [`feedback`]: decision log, satisfaction feedback, explanations
//! - [`router`]: facade wiring everything together
//! - [`advisor`]: background health probes and suggestions
//! - [`backend`]: completion adapter trait plus Ollama / OpenAI-compatible variants
//! - [`persistence`]: JSON state snapshots
//! - [`config`]: TOML configuration with environment overrides
//! - [`metrics`]: in-process counters and histograms

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]

pub mod advisor;
pub mod backend;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod feedback;
pub mod graph;
pub mod metrics;
pub mod persistence;
pub mod registry;
pub mod router;
pub mod selector;

// Re-exports for convenience
pub use advisor::{Advisor, Suggestion, SuggestionKind};
pub use backend::{
    BackendError, BackendSpec, Completion, CompletionBackend, CompletionRequest,
    OllamaBackend, OpenAiCompatibleBackend, TokenUsage,
};
pub use dispatch::{Dispatcher, Response};
pub use error::{AttemptError, AttemptErrorKind, RouterError};
pub use feedback::{DecisionLog, Explanation, FeedbackOutcome, FeedbackRecord};
pub use graph::{ContextGraph, ContextSubgraph, NewNode, NodeId, RelationType};
pub use metrics::{MetricsSnapshot, RouterMetrics};
pub use persistence::{default_state_path, StateSnapshot};
pub use registry::{
    CostClass, HealthState, LatencyClass, ModelDescriptor, ModelRegistry, ModelStats,
    PerformanceRecord, RegistrySnapshot,
};
pub use router::{RouteResponse, Router};
pub use selector::{DecisionId, Query, RoutingDecision, ScoreWeights, Selector};

// Config exports
pub use config::{
    default_config_path, load_config, load_config_from_path, ConfigError, ConfigSource,
    RouterConfig,
};
