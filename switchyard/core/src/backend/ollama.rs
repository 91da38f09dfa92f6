//! Ollama Backend Implementation
//!
//! Completion backend for Ollama (local LLM server). Uses the non-streaming
//! `/api/generate` endpoint; the router needs the whole response before it
//! can record an outcome.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use super::traits::{BackendError, Completion, CompletionBackend, CompletionRequest, TokenUsage};

/// Ollama backend client
#[derive(Clone)]
pub struct OllamaBackend {
    /// Host address
    host: String,
    /// Port number
    port: u16,
    /// Model name as Ollama knows it
    model: String,
    /// HTTP client
    http_client: reqwest::Client,
}

impl OllamaBackend {
    /// Create a new Ollama backend for one model
    pub fn new(host: impl Into<String>, port: u16, model: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            model: model.into(),
            http_client: reqwest::Client::new(),
        }
    }

    /// Model this backend targets
    #[must_use]
    pub fn model(&self) -> &str {
        &self.model
    }

    fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    fn generate_url(&self) -> String {
        format!("{}/api/generate", self.base_url())
    }

    fn tags_url(&self) -> String {
        format!("{}/api/tags", self.base_url())
    }

    fn request_body(&self, request: &CompletionRequest) -> Value {
        let mut body = serde_json::json!({
            "model": self.model,
            "prompt": request.prompt,
            "stream": false,
            "options": {
                "temperature": request.temperature,
            },
        });

        if request.max_tokens > 0 {
            body["options"]["num_predict"] = serde_json::json!(request.max_tokens);
        }

        body
    }
}

/// Pull text and token counts out of an `/api/generate` response
fn parse_generate_response(data: &Value) -> Result<Completion, BackendError> {
    let text = data
        .get("response")
        .and_then(Value::as_str)
        .ok_or_else(|| BackendError::permanent("ollama response has no `response` field"))?
        .to_string();

    let count = |key: &str| {
        data.get(key)
            .and_then(Value::as_u64)
            .map(|c| u32::try_from(c).unwrap_or(u32::MAX))
    };
    let token_usage = match (count("prompt_eval_count"), count("eval_count")) {
        (None, None) => None,
        (prompt, completion) => Some(TokenUsage {
            prompt_tokens: prompt.unwrap_or(0),
            completion_tokens: completion.unwrap_or(0),
        }),
    };

    Ok(Completion { text, token_usage })
}

#[async_trait]
impl CompletionBackend for OllamaBackend {
    fn name(&self) -> &str {
        "ollama"
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, BackendError> {
        let response = self
            .http_client
            .post(self.generate_url())
            .json(&self.request_body(request))
            .send()
            .await
            .map_err(|e| BackendError::from_reqwest(&e))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(BackendError::from_status(status, body));
        }

        let data: Value = response
            .json()
            .await
            .map_err(|e| BackendError::from_reqwest(&e))?;

        parse_generate_response(&data)
    }

    async fn health_check(&self, timeout: Duration) -> Result<(), BackendError> {
        let response = self
            .http_client
            .get(self.tags_url())
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| BackendError::from_reqwest(&e))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(BackendError::from_status(response.status().as_u16(), "tags"))
        }
    }
}
