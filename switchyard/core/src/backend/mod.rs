//! Model Backend Integration
//!
//! Abstracted access to model providers through [`CompletionBackend`].
//!
//! # Available Backends
//!
//! - **Ollama**: local LLM server
//! - **OpenAI-compatible**: any `/v1/chat/completions` endpoint
//!
//! # Usage
//!
//! ```ignore
//! use switchyard_core::backend::{BackendSpec, CompletionRequest};
//!
//! let spec = BackendSpec::Ollama { host: "localhost".into(), port: 11434, model: "llama3".into() };
//! let backend = spec.build()?;
//! let completion = backend.complete(&CompletionRequest::new("Hello!")).await?;
//! ```

mod ollama;
mod openai;
mod traits;

use std::sync::Arc;

use serde::{Deserialize, Serialize};

pub use ollama::OllamaBackend;
pub use openai::OpenAiCompatibleBackend;
pub use traits::{BackendError, Completion, CompletionBackend, CompletionRequest, TokenUsage};

fn default_ollama_host() -> String {
    "localhost".to_string()
}

fn default_ollama_port() -> u16 {
    11434
}

/// Backend connection configuration, as it appears in the config file
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackendSpec {
    /// Direct Ollama connection
    Ollama {
        /// Ollama host address
        #[serde(default = "default_ollama_host")]
        host: String,
        /// Ollama port number
        #[serde(default = "default_ollama_port")]
        port: u16,
        /// Model name on the Ollama server
        model: String,
    },
    /// OpenAI-compatible API
    OpenaiCompatible {
        /// Base URL without the `/v1/...` suffix
        base_url: String,
        /// Model name on that server
        model: String,
        /// Environment variable holding the API key, if one is needed
        #[serde(default)]
        api_key_env: Option<String>,
    },
}

impl BackendSpec {
    /// Instantiate the adapter this spec describes
    pub fn build(&self) -> Result<Arc<dyn CompletionBackend>, BackendError> {
        match self {
            Self::Ollama { host, port, model } => {
                Ok(Arc::new(OllamaBackend::new(host.clone(), *port, model.clone())))
            }
            Self::OpenaiCompatible {
                base_url,
                model,
                api_key_env,
            } => {
                let mut backend = OpenAiCompatibleBackend::new(base_url.clone(), model.clone());
                if let Some(var) = api_key_env {
                    let key = std::env::var(var).map_err(|_| {
                        BackendError::permanent(format!("API key variable {var} is not set"))
                    })?;
                    backend = backend.with_api_key(key);
                }
                Ok(Arc::new(backend))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spec_from_toml_applies_defaults() {
        let spec: BackendSpec = toml::from_str(
            r#"
            kind = "ollama"
            model = "llama3"
            "#,
        )
        .unwrap();

        assert_eq!(
            spec,
            BackendSpec::Ollama {
                host: "localhost".to_string(),
                port: 11434,
                model: "llama3".to_string(),
            }
        );
        assert_eq!(spec.build().unwrap().name(), "ollama");
    }

    #[test]
    fn test_missing_api_key_is_permanent() {
        let spec = BackendSpec::OpenaiCompatible {
            base_url: "http://localhost:8000".to_string(),
            model: "mistral".to_string(),
            api_key_env: Some("SWITCHYARD_TEST_KEY_THAT_IS_NEVER_SET".to_string()),
        };
        let err = spec.build().err().unwrap();
        assert!(!err.transient);
    }
}
