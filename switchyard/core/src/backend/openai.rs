//! OpenAI-compatible Backend
//!
//! Talks to any server exposing `/v1/chat/completions` (OpenAI, vLLM,
//! llama.cpp server, LM Studio, ...). The composed prompt is sent as a
//! single user message.

use async_trait::async_trait;
use serde_json::Value;

use super::traits::{BackendError, Completion, CompletionBackend, CompletionRequest, TokenUsage};

/// Backend for OpenAI-style chat completion APIs
#[derive(Clone)]
pub struct OpenAiCompatibleBackend {
    base_url: String,
    model: String,
    api_key: Option<String>,
    http_client: reqwest::Client,
}

impl OpenAiCompatibleBackend {
    /// Create a backend for `model` served at `base_url`
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            api_key: None,
            http_client: reqwest::Client::new(),
        }
    }

    /// Attach a bearer token
    #[must_use]
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    fn completions_url(&self) -> String {
        format!("{}/v1/chat/completions", self.base_url)
    }

    fn request_body(&self, request: &CompletionRequest) -> Value {
        let mut body = serde_json::json!({
            "model": self.model,
            "messages": [{ "role": "user", "content": request.prompt }],
            "temperature": request.temperature,
            "stream": false,
        });
        if request.max_tokens > 0 {
            body["max_tokens"] = serde_json::json!(request.max_tokens);
        }
        body
    }
}

fn parse_chat_response(data: &Value) -> Result<Completion, BackendError> {
    let text = data
        .pointer("/choices/0/message/content")
        .and_then(Value::as_str)
        .ok_or_else(|| BackendError::permanent("chat response has no choices[0].message.content"))?
        .to_string();

    let token_usage = data.get("usage").map(|usage| {
        let field = |key: &str| {
            usage
                .get(key)
                .and_then(Value::as_u64)
                .map_or(0, |c| u32::try_from(c).unwrap_or(u32::MAX))
        };
        TokenUsage {
            prompt_tokens: field("prompt_tokens"),
            completion_tokens: field("completion_tokens"),
        }
    });

    Ok(Completion { text, token_usage })
}

#[async_trait]
impl CompletionBackend for OpenAiCompatibleBackend {
    fn name(&self) -> &str {
        "openai-compatible"
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, BackendError> {
        let mut builder = self
            .http_client
            .post(self.completions_url())
            .json(&self.request_body(request));
        if let Some(ref key) = self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder
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

        parse_chat_response(&data)
    }
}
