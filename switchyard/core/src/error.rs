//! Router Errors
//!
//! Every fallible public operation in this crate returns [`RouterError`].
//! Callers always receive either a complete success or exactly one of these
//! variants; per-attempt failures inside the dispatcher are collected into
//! [`RouterError::AllBackendsFailed`] rather than surfaced one by one.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::config::ConfigError;
use crate::persistence::PersistenceError;
use crate::selector::DecisionId;

/// What went wrong during a single dispatch attempt
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AttemptErrorKind {
    /// The backend answered with an error (or could not be reached)
    Backend {
        /// HTTP status, when the adapter saw one
        status: Option<u16>,
        /// Whether the failure was worth retrying
        transient: bool,
    },
    /// The per-call timeout elapsed
    Timeout {
        /// The timeout that was exceeded
        after: Duration,
    },
}

/// One failed attempt against one model
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AttemptError {
    /// Model the attempt was sent to
    pub model_id: String,
    /// Failure classification
    pub kind: AttemptErrorKind,
    /// Human-readable detail
    pub message: String,
}

impl AttemptError {
    /// Whether the dispatcher may move on to another candidate
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self.kind {
            AttemptErrorKind::Backend { transient, .. } => transient,
            AttemptErrorKind::Timeout { .. } => true,
        }
    }
}

impl fmt::Display for AttemptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            AttemptErrorKind::Backend {
                status: Some(status),
                ..
            } => write!(f, "{}: backend error {status}: {}", self.model_id, self.message),
            AttemptErrorKind::Backend { status: None, .. } => {
                write!(f, "{}: backend error: {}", self.model_id, self.message)
            }
            AttemptErrorKind::Timeout { after } => {
                write!(f, "{}: timed out after {}ms", self.model_id, after.as_millis())
            }
        }
    }
}

/// Errors surfaced by the router and its components
#[derive(Debug, Error)]
pub enum RouterError {
    /// A model with this id is already registered
    #[error("model already registered: {0}")]
    DuplicateModel(String),

    /// No model with this id is registered
    #[error("model not registered: {0}")]
    UnknownModel(String),

    /// Every candidate is unavailable; nothing can be retried
    #[error("no available model among {candidates} candidate(s)")]
    NoAvailableModel {
        /// Number of models that were considered
        candidates: usize,
    },

    /// Every dispatch attempt failed
    #[error("all backends failed after {} attempt(s): {}", .attempts.len(), summarize(.attempts))]
    AllBackendsFailed {
        /// Per-attempt failures in the order they happened
        attempts: Vec<AttemptError>,
    },

    /// Feedback or explanation referenced a decision that is not (or no longer) stored
    #[error("unknown or expired decision: {0}")]
    UnknownDecision(DecisionId),

    /// An internal invariant of the context graph was violated
    #[error("context graph inconsistency: {0}")]
    GraphConsistency(String),

    /// The caller cancelled the request
    #[error("request cancelled by caller")]
    Cancelled,

    /// Configuration could not be loaded or is invalid
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Persisted state could not be read or written
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

fn summarize(attempts: &[AttemptError]) -> String {
    attempts
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
