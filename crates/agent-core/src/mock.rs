//! Scripted Provider
//!
//! For testing and demo purposes. Plays back a queue of canned replies and
//! records every request it receives.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{AgentError, Result};
use crate::message::Message;
use crate::provider::{Completion, GenerationOptions, LlmProvider, ModelInfo, ProviderInfo};
use crate::tool::ToolCall;

/// One scripted provider response
#[derive(Clone, Debug)]
pub enum ScriptStep {
    Text(String),
    ToolCalls(Vec<ToolCall>),
    /// Neither text nor tool calls
    Empty,
    /// A non-retryable backend failure
    Fail(String),
}

/// A request as seen by the provider
#[derive(Clone, Debug)]
pub struct RecordedRequest {
    pub messages: Vec<Message>,
    pub tools: Vec<Value>,
}

/// Provider that replays a fixed script
#[derive(Debug, Default)]
pub struct ScriptedProvider {
    script: Mutex<VecDeque<ScriptStep>>,
    /// Step repeated once the script runs out
    fallback: Option<ScriptStep>,
    latency: Option<Duration>,
    requests: Mutex<Vec<RecordedRequest>>,
    served: AtomicUsize,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn then(self, step: ScriptStep) -> Self {
        self.script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(step);
        self
    }

    #[must_use]
    pub fn then_text(self, text: impl Into<String>) -> Self {
        self.then(ScriptStep::Text(text.into()))
    }

    #[must_use]
    pub fn then_tool_call(self, id: &str, name: &str, arguments: &Value) -> Self {
        self.then(ScriptStep::ToolCalls(vec![ToolCall::from_value(id, name, arguments)]))
    }

    #[must_use]
    pub fn then_tool_calls(self, calls: Vec<ToolCall>) -> Self {
        self.then(ScriptStep::ToolCalls(calls))
    }

    #[must_use]
    pub fn then_empty(self) -> Self {
        self.then(ScriptStep::Empty)
    }

    #[must_use]
    pub fn then_error(self, message: impl Into<String>) -> Self {
        self.then(ScriptStep::Fail(message.into()))
    }

    /// Repeat `step` forever after the script is exhausted
    #[must_use]
    pub fn repeat(mut self, step: ScriptStep) -> Self {
        self.fallback = Some(step);
        self
    }

    /// Delay every response
    #[must_use]
    pub const fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Number of `complete` calls served so far
    pub fn call_count(&self) -> usize {
        self.served.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn next_step(&self, serial: usize) -> Option<ScriptStep> {
        let scripted = self
            .script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();

        scripted.or_else(|| {
            self.fallback.clone().map(|step| match step {
                // Fresh ids per repetition keep every call id unique
                ScriptStep::ToolCalls(calls) => ScriptStep::ToolCalls(
                    calls
                        .into_iter()
                        .map(|c| ToolCall::new(format!("{}-{serial}", c.id), c.name, c.arguments))
                        .collect(),
                ),
                other => other,
            })
        })
    }
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
    async fn info(&self) -> Result<ProviderInfo> {
        Ok(ProviderInfo {
            name: "Scripted".into(),
            version: None,
            models: self.list_models().await?,
            supports_tools: true,
        })
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(true)
    }

    async fn complete(
        &self,
        messages: &[Message],
        tools: &[Value],
        options: &GenerationOptions,
    ) -> Result<Completion> {
        let serial = self.served.fetch_add(1, Ordering::SeqCst);
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(RecordedRequest {
                messages: messages.to_vec(),
                tools: tools.to_vec(),
            });

        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        match self.next_step(serial) {
            Some(ScriptStep::Text(text)) => Ok(Completion::text(&options.model, text)),
            Some(ScriptStep::ToolCalls(calls)) => Ok(Completion::tool_calls(&options.model, calls)),
            Some(ScriptStep::Empty) => Err(AgentError::EmptyResponse),
            Some(ScriptStep::Fail(message)) => Err(AgentError::Provider(message)),
            None => Err(AgentError::Provider("script exhausted".into())),
        }
    }

    async fn list_models(&self) -> Result<Vec<ModelInfo>> {
        Ok(vec![ModelInfo {
            id: "scripted".into(),
            name: "scripted".into(),
            context_length: None,
        }])
    }
}
