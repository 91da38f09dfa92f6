//! Completion Backend Traits
//!
//! Trait definitions for model backends. The router only ever talks to a
//! model through [`CompletionBackend`], so provider-specific details (API
//! formats, auth, response shapes) stay inside the adapters.
//!
//! Adapters classify every failure as transient or permanent. The dispatcher
//! retries transient failures on the next candidate; permanent ones end the
//! attempt chain immediately.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A single completion request, already composed with any retrieved context
#[derive(Clone, Debug, PartialEq)]
pub struct CompletionRequest {
    /// Fully composed prompt text
    pub prompt: String,
    /// Maximum tokens in the response (0 = backend default)
    pub max_tokens: u32,
    /// Sampling temperature (0.0-1.0)
    pub temperature: f32,
}

impl Default for CompletionRequest {
    fn default() -> Self {
        Self {
            prompt: String::new(),
            max_tokens: 0,
            temperature: 0.7,
        }
    }
}

impl CompletionRequest {
    /// Create a request for a prompt
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Default::default()
        }
    }

    /// Set temperature
    #[must_use]
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature.clamp(0.0, 1.0);
        self
    }

    /// Set max tokens
    #[must_use]
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }
}

/// Token accounting reported by a backend
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Tokens consumed by the prompt
    pub prompt_tokens: u32,
    /// Tokens generated in the response
    pub completion_tokens: u32,
}

impl TokenUsage {
    /// Sum of prompt and completion tokens
    #[must_use]
    pub fn total(&self) -> u32 {
        self.prompt_tokens.saturating_add(self.completion_tokens)
    }
}

/// A completed response
#[derive(Clone, Debug, PartialEq)]
pub struct Completion {
    /// Generated text
    pub text: String,
    /// Token usage, when the backend reports it
    pub token_usage: Option<TokenUsage>,
}

/// Failure reported by a backend adapter
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct BackendError {
    /// Human-readable detail
    pub message: String,
    /// HTTP status, when one was received
    pub status: Option<u16>,
    /// Whether retrying elsewhere is worthwhile
    pub transient: bool,
}

impl BackendError {
    /// A failure worth retrying (overload, connection reset, ...)
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status: None,
            transient: true,
        }
    }

    /// A failure that will not go away on retry (bad request, auth, ...)
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status: None,
            transient: false,
        }
    }

    /// Classify a non-success HTTP status
    ///
    /// 408, 425, 429 and every 5xx are transient; other statuses are not.
    pub fn from_status(status: u16, body: impl Into<String>) -> Self {
        let transient = matches!(status, 408 | 425 | 429) || (500..600).contains(&status);
        Self {
            message: format!("status {status}: {}", body.into()),
            status: Some(status),
            transient,
        }
    }

    /// Classify a transport-level failure
    pub fn from_reqwest(err: &reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            return Self::from_status(status.as_u16(), err.to_string());
        }
        if err.is_decode() || err.is_builder() {
            return Self::permanent(err.to_string());
        }
        // timeouts, refused connections and resets
        Self::transient(err.to_string())
    }
}

/// Completion backend trait
///
/// Implement this trait to add support for a model provider.
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    /// Backend name (e.g., "ollama", "openai")
    fn name(&self) -> &str;

    /// Send a request and wait for the complete response
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, BackendError>;

    /// Lightweight reachability probe
    ///
    /// The default issues a one-token completion.
    async fn health_check(&self, timeout: Duration) -> Result<(), BackendError> {
        let request = CompletionRequest::new("ping").with_max_tokens(1);
        match tokio::time::timeout(timeout, self.complete(&request)).await {
            Ok(result) => result.map(|_| ()),
            Err(_) => Err(BackendError::transient(format!(
                "health check timed out after {}ms",
                timeout.as_millis()
            ))),
        }
    }
}
