//! Shared fixtures for the integration tests

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use switchyard_core::{
    BackendError, Completion, CompletionBackend, CompletionRequest, ModelDescriptor, Router,
    RouterConfig, TokenUsage,
};

/// One scripted backend reply
#[derive(Clone, Debug)]
pub enum Step {
    Reply(&'static str),
    Fail(u16),
    Stall(Duration),
}

/// Backend that replays a script, then answers with its default reply
pub struct ScriptedBackend {
    name: String,
    script: Mutex<VecDeque<Step>>,
    default_reply: String,
    calls: AtomicUsize,
}

impl ScriptedBackend {
    pub fn new(name: &str) -> Arc<Self> {
        Self::with_script(name, Vec::new())
    }

    pub fn with_script(name: &str, script: Vec<Step>) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            script: Mutex::new(script.into()),
            default_reply: format!("{name} says hi"),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn push(&self, step: Step) {
        self.script.lock().push_back(step);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CompletionBackend for ScriptedBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let step = self.script.lock().pop_front();
        match step {
            Some(Step::Fail(status)) => Err(BackendError::from_status(status, "scripted failure")),
            Some(Step::Stall(delay)) => {
                tokio::time::sleep(delay).await;
                Ok(self.reply(&self.default_reply, request))
            }
            Some(Step::Reply(text)) => Ok(self.reply(text, request)),
            None => Ok(self.reply(&self.default_reply, request)),
        }
    }
}

impl ScriptedBackend {
    fn reply(&self, text: &str, request: &CompletionRequest) -> Completion {
        Completion {
            text: text.to_string(),
            token_usage: Some(TokenUsage {
                prompt_tokens: request.prompt.split_whitespace().count() as u32,
                completion_tokens: text.split_whitespace().count() as u32,
            }),
        }
    }
}

/// Config with instant backoff so retries do not slow tests down
pub fn test_config() -> RouterConfig {
    let mut config = RouterConfig::default();
    config.dispatch.initial_backoff_ms = 1;
    config.dispatch.max_backoff_ms = 1;
    config.dispatch.use_jitter = false;
    config
}

/// Router with the given `(id, backend, capabilities)` models registered
pub fn router_with(models: Vec<(&str, Arc<ScriptedBackend>, Vec<(&str, f64)>)>) -> Router {
    let router = Router::empty(test_config()).expect("valid config");
    for (id, backend, capabilities) in models {
        let mut descriptor = ModelDescriptor::new(id, backend as Arc<dyn CompletionBackend>);
        for (tag, proficiency) in capabilities {
            descriptor = descriptor.with_capability(tag, proficiency);
        }
        router.register_model(descriptor).expect("unique id");
    }
    router
}
