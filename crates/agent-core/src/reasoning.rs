//! Reasoning Loop
//!
//! Implements the ReAct (Reason + Act) pattern for agent behavior.
//! The agent sends the session history to the provider, runs whatever tools
//! the model asks for (through the approval gate when a tool is dangerous),
//! feeds the results back, and repeats until the model answers in text or
//! the iteration budget runs out.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tracing::Instrument;

use crate::approval::{ApprovalGate, ApprovalPolicy, ApprovalRequest};
use crate::error::{AgentError, Result};
use crate::events::{AgentEvent, EventBus, LoopState};
use crate::message::Message;
use crate::provider::{Completion, GenerationOptions, LlmProvider, Reply};
use crate::registry::ToolRegistry;
use crate::session::{Session, SessionId};
use crate::store::{MemorySessionStore, SessionStore};
use crate::tool::{DangerClass, Tool, ToolArguments, ToolCall, ToolResult};

/// Agent configuration
#[derive(Clone, Debug)]
pub struct AgentConfig {
    /// Default system prompt, sent ahead of sessions that carry none.
    /// Never written into the session itself.
    pub system_prompt: Option<String>,

    /// Maximum model calls per chat before giving up
    pub max_iterations: usize,

    /// Extra attempts after the provider returns an empty response
    pub empty_response_retries: usize,

    /// Deadline for a single provider call
    pub provider_timeout: Option<Duration>,

    /// Deadline for an approval decision; expiry counts as denial
    pub approval_timeout: Duration,

    /// Generation options
    pub generation: GenerationOptions,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            system_prompt: Some(DEFAULT_SYSTEM_PROMPT.into()),
            max_iterations: 10,
            empty_response_retries: 2,
            provider_timeout: None,
            approval_timeout: Duration::from_secs(300),
            generation: GenerationOptions::default(),
        }
    }
}

const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful AI assistant. \
Use the available tools when they help answer the user, then reply with a concise answer. \
If a tool call fails or is rejected, adapt instead of repeating the same call.";

/// How a chat ended
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ChatOutcome {
    /// The model produced a final text answer
    Answer { text: String, iterations: usize },
    /// The iteration budget ran out before a text answer
    Exhausted { iterations: usize },
}

impl ChatOutcome {
    pub const fn iterations(&self) -> usize {
        match self {
            Self::Answer { iterations, .. } | Self::Exhausted { iterations } => *iterations,
        }
    }

    pub fn text(&self) -> Option<&str> {
        match self {
            Self::Answer { text, .. } => Some(text),
            Self::Exhausted { .. } => None,
        }
    }

    pub const fn is_exhausted(&self) -> bool {
        matches!(self, Self::Exhausted { .. })
    }

    /// The answer text, with exhaustion as [`AgentError::MaxIterations`]
    pub fn into_answer(self) -> Result<String> {
        match self {
            Self::Answer { text, .. } => Ok(text),
            Self::Exhausted { iterations } => Err(AgentError::MaxIterations(iterations)),
        }
    }
}

/// The main Agent struct
pub struct Agent {
    provider: Arc<dyn LlmProvider>,
    tools: Arc<ToolRegistry>,
    sessions: Arc<dyn SessionStore>,
    approval: Arc<dyn ApprovalGate>,
    events: EventBus,
    config: AgentConfig,
}

impl Agent {
    /// Create a new agent
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        tools: Arc<ToolRegistry>,
        sessions: Arc<dyn SessionStore>,
        approval: Arc<dyn ApprovalGate>,
        config: AgentConfig,
    ) -> Self {
        Self {
            provider,
            tools,
            sessions,
            approval,
            events: EventBus::default(),
            config,
        }
    }

    pub fn builder() -> AgentBuilder {
        AgentBuilder::new()
    }

    /// Chat in the session named `session_id`, creating it on first use
    pub async fn chat(&self, session_id: &SessionId, text: &str) -> Result<ChatOutcome> {
        let handle = self.sessions.get_or_create(session_id);
        let mut session = handle.lock().await;
        self.chat_in(&mut session, text).await
    }

    /// One-shot question on a throwaway session
    pub async fn ask(&self, question: &str) -> Result<String> {
        let mut session = Session::new();
        self.chat_in(&mut session, question).await?.into_answer()
    }

    /// Run the loop on a borrowed session
    pub async fn chat_in(&self, session: &mut Session, text: &str) -> Result<ChatOutcome> {
        let span = tracing::info_span!("chat", session_id = %session.id);
        self.run(session, text).instrument(span).await
    }

    async fn run(&self, session: &mut Session, text: &str) -> Result<ChatOutcome> {
        let session_id = session.id.to_string();
        session.push(Message::user(text));
        session.touch();

        let mut iterations = 0;

        loop {
            if iterations >= self.config.max_iterations {
                tracing::warn!(iterations, "Iteration budget exhausted without a final answer");
                self.transition(&session_id, LoopState::Exhausted, iterations);
                self.events.publish(AgentEvent::Exhausted {
                    session_id,
                    iterations,
                });
                return Ok(ChatOutcome::Exhausted { iterations });
            }
            iterations += 1;

            self.transition(&session_id, LoopState::AwaitingModel, iterations);
            let messages = self.request_messages(session);
            let schemas = self.tools.schemas();
            let completion = self.call_model(&messages, &schemas).await?;

            match completion.reply {
                Reply::Text { content } => {
                    session.push(Message::assistant(&content));
                    session.touch();
                    self.transition(&session_id, LoopState::Done, iterations);
                    self.events.publish(AgentEvent::FinalMessage {
                        session_id,
                        content: content.clone(),
                        iterations,
                    });
                    return Ok(ChatOutcome::Answer {
                        text: content,
                        iterations,
                    });
                }
                Reply::ToolCalls { calls, content } => {
                    self.transition(&session_id, LoopState::ExecutingTools, iterations);
                    tracing::debug!(iteration = iterations, count = calls.len(), "Model requested tools");

                    session.push(Message::assistant_tool_calls(content, calls.clone()));
                    // Results are appended one by one, in the order the model issued the calls
                    for call in &calls {
                        let result = self.dispatch(&session_id, call, iterations).await;
                        session.push(result.into_message());
                    }
                    session.touch();
                }
            }
        }
    }

    fn transition(&self, session_id: &str, state: LoopState, iteration: usize) {
        tracing::debug!(?state, iteration, "Loop transition");
        self.events.publish(AgentEvent::LoopStateChanged {
            session_id: session_id.to_string(),
            state,
            iteration,
        });
    }

    /// Session history, preceded by a system prompt if the session has none
    fn request_messages(&self, session: &Session) -> Vec<Message> {
        let mut messages = Vec::with_capacity(session.message_count() + 1);
        if !session.conversation.has_system_prompt() {
            let prompt = session
                .metadata
                .system_prompt
                .as_ref()
                .or(self.config.system_prompt.as_ref());
            if let Some(prompt) = prompt {
                messages.push(Message::system(prompt));
            }
        }
        messages.extend_from_slice(session.messages());
        messages
    }

    /// Call the provider, retrying empty responses a bounded number of times
    async fn call_model(&self, messages: &[Message], schemas: &[serde_json::Value]) -> Result<Completion> {
        let attempts = self.config.empty_response_retries + 1;

        for attempt in 1..=attempts {
            match self.request(messages, schemas).await {
                Ok(completion) if completion.reply.is_blank() => {
                    tracing::warn!(attempt, attempts, "Provider returned a blank reply");
                }
                Err(AgentError::EmptyResponse) => {
                    tracing::warn!(attempt, attempts, "Provider returned an empty response");
                }
                other => return other,
            }
        }

        Err(AgentError::NoUsableResponse { attempts })
    }

    async fn request(&self, messages: &[Message], schemas: &[serde_json::Value]) -> Result<Completion> {
        let call = self.provider.complete(messages, schemas, &self.config.generation);
        match self.config.provider_timeout {
            Some(limit) => tokio::time::timeout(limit, call)
                .await
                .map_err(|_| AgentError::Timeout(format!("provider call exceeded {limit:?}")))?,
            None => call.await,
        }
    }

    /// Run one tool call; every failure becomes a tool result for the model
    async fn dispatch(&self, session_id: &str, call: &ToolCall, iteration: usize) -> ToolResult {
        self.events.publish(AgentEvent::ToolStarted {
            session_id: session_id.to_string(),
            call_id: call.id.clone(),
            tool: call.name.clone(),
        });

        let result = match self.tools.lookup(&call.name) {
            None => {
                tracing::warn!(tool = %call.name, call_id = %call.id, "Model called an unknown tool");
                ToolResult::failure(call, format!("Unknown tool '{}'", call.name))
            }
            Some(entry) => match call.parse_arguments() {
                Err(e) => ToolResult::failure(call, e.to_string()),
                Ok(args) => {
                    let approved = entry.danger() != DangerClass::RequiresApproval
                        || self.approve(session_id, call, &args, iteration).await;
                    if approved {
                        self.execute(entry.tool().as_ref(), call, args).await
                    } else {
                        let denied = AgentError::ApprovalDenied(call.name.clone());
                        ToolResult::failure(call, denied.to_string())
                    }
                }
            },
        };

        self.events.publish(AgentEvent::ToolFinished {
            session_id: session_id.to_string(),
            call_id: call.id.clone(),
            tool: call.name.clone(),
            success: result.success,
        });
        result
    }

    async fn execute(&self, tool: &dyn Tool, call: &ToolCall, args: ToolArguments) -> ToolResult {
        if let Err(e) = tool.validate(&args) {
            return ToolResult::failure(call, e.to_string());
        }

        match AssertUnwindSafe(tool.execute(args)).catch_unwind().await {
            Ok(Ok(output)) => {
                tracing::debug!(tool = %call.name, call_id = %call.id, "Tool succeeded");
                ToolResult::success(call, output)
            }
            Ok(Err(e)) => {
                tracing::debug!(tool = %call.name, call_id = %call.id, error = %e, "Tool failed");
                ToolResult::failure(call, e.to_string())
            }
            Err(_) => {
                tracing::error!(tool = %call.name, call_id = %call.id, "Tool panicked");
                ToolResult::failure(call, format!("Tool '{}' panicked", call.name))
            }
        }
    }

    async fn approve(
        &self,
        session_id: &str,
        call: &ToolCall,
        args: &ToolArguments,
        iteration: usize,
    ) -> bool {
        self.transition(session_id, LoopState::AwaitingApproval, iteration);
        self.events.publish(AgentEvent::ApprovalRequested {
            session_id: session_id.to_string(),
            call_id: call.id.clone(),
            tool: call.name.clone(),
        });

        let request = ApprovalRequest {
            session_id: session_id.to_string(),
            tool_name: call.name.clone(),
            arguments: args.clone(),
        };
        let approved = tokio::time::timeout(
            self.config.approval_timeout,
            self.approval.request_approval(&request),
        )
        .await
        .unwrap_or_else(|_| {
            tracing::warn!(tool = %call.name, "Approval timed out; treating as denial");
            false
        });

        tracing::info!(tool = %call.name, call_id = %call.id, approved, "Approval resolved");
        self.events.publish(AgentEvent::ApprovalResolved {
            session_id: session_id.to_string(),
            call_id: call.id.clone(),
            tool: call.name.clone(),
            approved,
        });
        approved
    }

    /// Subscribe to loop events
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<AgentEvent> {
        self.events.subscribe()
    }

    /// Get the tool registry
    pub fn tools(&self) -> &Arc<ToolRegistry> {
        &self.tools
    }

    /// Get the session store
    pub fn sessions(&self) -> &Arc<dyn SessionStore> {
        &self.sessions
    }

    pub fn provider(&self) -> &Arc<dyn LlmProvider> {
        &self.provider
    }

    /// Get configuration
    pub const fn config(&self) -> &AgentConfig {
        &self.config
    }
}

/// Builder for Agent configuration
pub struct AgentBuilder {
    provider: Option<Arc<dyn LlmProvider>>,
    tools: Arc<ToolRegistry>,
    sessions: Option<Arc<dyn SessionStore>>,
    approval: Option<Arc<dyn ApprovalGate>>,
    events: Option<EventBus>,
    config: AgentConfig,
}

impl Default for AgentBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentBuilder {
    pub fn new() -> Self {
        Self {
            provider: None,
            tools: Arc::new(ToolRegistry::new()),
            sessions: None,
            approval: None,
            events: None,
            config: AgentConfig::default(),
        }
    }

    #[must_use]
    pub fn provider(mut self, provider: Arc<dyn LlmProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    #[must_use]
    pub fn tool<T: Tool + 'static>(self, tool: T) -> Self {
        self.tools.register(tool);
        self
    }

    #[must_use]
    pub fn tools(mut self, tools: Arc<ToolRegistry>) -> Self {
        self.tools = tools;
        self
    }

    #[must_use]
    pub fn sessions(mut self, sessions: Arc<dyn SessionStore>) -> Self {
        self.sessions = Some(sessions);
        self
    }

    #[must_use]
    pub fn approval(mut self, gate: Arc<dyn ApprovalGate>) -> Self {
        self.approval = Some(gate);
        self
    }

    #[must_use]
    pub fn approval_policy(self, policy: ApprovalPolicy) -> Self {
        self.approval(policy.gate())
    }

    #[must_use]
    pub fn events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    #[must_use]
    pub fn config(mut self, config: AgentConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.config.system_prompt = Some(prompt.into());
        self
    }

    #[must_use]
    pub fn no_system_prompt(mut self) -> Self {
        self.config.system_prompt = None;
        self
    }

    #[must_use]
    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.generation.model = model.into();
        self
    }

    #[must_use]
    pub const fn temperature(mut self, temp: f32) -> Self {
        self.config.generation.temperature = temp;
        self
    }

    #[must_use]
    pub const fn max_iterations(mut self, max: usize) -> Self {
        self.config.max_iterations = max;
        self
    }

    #[must_use]
    pub const fn empty_response_retries(mut self, retries: usize) -> Self {
        self.config.empty_response_retries = retries;
        self
    }

    #[must_use]
    pub const fn provider_timeout(mut self, timeout: Duration) -> Self {
        self.config.provider_timeout = Some(timeout);
        self
    }

    #[must_use]
    pub const fn approval_timeout(mut self, timeout: Duration) -> Self {
        self.config.approval_timeout = timeout;
        self
    }

    pub fn build(self) -> Result<Agent> {
        let provider = self
            .provider
            .ok_or_else(|| AgentError::Config("Provider is required".into()))?;

        if self.config.max_iterations == 0 {
            return Err(AgentError::Config("max_iterations must be at least 1".into()));
        }

        let approval = self.approval.unwrap_or_else(|| {
            tracing::info!("No approval gate configured; dangerous tools will be denied");
            ApprovalPolicy::Deny.gate()
        });
        let sessions = self
            .sessions
            .unwrap_or_else(|| Arc::new(MemorySessionStore::new()));

        let mut agent = Agent::new(provider, self.tools, sessions, approval, self.config);
        if let Some(events) = self.events {
            agent.events = events;
        }
        Ok(agent)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use serde_json::json;

    use super::*;
    use crate::approval::{ApproveAll, CallbackApproval, DenyAll};
    use crate::message::Role;
    use crate::mock::{ScriptStep, ScriptedProvider};
    use crate::store::CreateSession;
    use crate::tool::{FunctionTool, ParamType, ParameterSchema};

    fn add_tool() -> FunctionTool {
        FunctionTool::builder("add")
            .description("Add two integers")
            .param(ParameterSchema::required("a", ParamType::Integer, "First"))
            .param(ParameterSchema::required("b", ParamType::Integer, "Second"))
            .handler(|args| async move {
                Ok((args.require_i64("a")? + args.require_i64("b")?).to_string())
            })
    }

    fn counting_tool(name: &str, counter: Arc<AtomicUsize>) -> FunctionTool {
        FunctionTool::builder(name)
            .description("Counts invocations")
            .requires_approval()
            .handler(move |_args| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok("deleted".to_string())
                }
            })
    }

    fn agent_with(provider: Arc<ScriptedProvider>) -> AgentBuilder {
        Agent::builder().provider(provider)
    }

    fn tool_messages(session: &Session) -> Vec<&Message> {
        session.messages().iter().filter(|m| m.role == Role::Tool).collect()
    }

    #[tokio::test]
    async fn test_plain_answer() {
        let provider = Arc::new(ScriptedProvider::new().then_text("4"));
        let agent = agent_with(provider.clone()).build().unwrap();
        let id = SessionId::from("s1");

        let outcome = agent.chat(&id, "What's 2+2?").await.unwrap();

        assert_eq!(
            outcome,
            ChatOutcome::Answer {
                text: "4".into(),
                iterations: 1
            }
        );
        let handle = agent.sessions().get(&id).unwrap();
        let session = handle.lock().await;
        assert_eq!(session.message_count(), 2);
        assert_eq!(session.messages()[0].role, Role::User);
        assert_eq!(session.messages()[1].role, Role::Assistant);
        assert_eq!(provider.call_count(), 1);
    }

    #[tokio::test]
    async fn test_single_tool_round_trip() {
        let provider = Arc::new(
            ScriptedProvider::new()
                .then_tool_call("c1", "add", &json!({"a": 2, "b": 3}))
                .then_text("5"),
        );
        let agent = agent_with(provider.clone()).tool(add_tool()).build().unwrap();
        let mut session = Session::with_id(SessionId::from("s1"));

        let outcome = agent.chat_in(&mut session, "add 2 and 3").await.unwrap();

        assert_eq!(outcome.text(), Some("5"));
        assert_eq!(outcome.iterations(), 2);
        let roles: Vec<Role> = session.messages().iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::User, Role::Assistant, Role::Tool, Role::Assistant]);
        let tools = tool_messages(&session);
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].content, "5");
        assert_eq!(tools[0].tool_call_id.as_deref(), Some("c1"));
        assert!(session.conversation.validate_pairing().is_ok());

        let second_request = &provider.requests()[1];
        assert_eq!(second_request.tools.len(), 1);
        assert_eq!(second_request.tools[0]["function"]["name"], "add");
    }

    #[tokio::test]
    async fn test_bounded_loop_exhausts() {
        let provider = Arc::new(
            ScriptedProvider::new()
                .repeat(ScriptStep::ToolCalls(vec![ToolCall::new("spin", "add", r#"{"a":1,"b":1}"#)])),
        );
        let agent = agent_with(provider.clone())
            .tool(add_tool())
            .max_iterations(4)
            .build()
            .unwrap();
        let mut session = Session::new();

        let outcome = agent.chat_in(&mut session, "loop forever").await.unwrap();

        assert_eq!(outcome, ChatOutcome::Exhausted { iterations: 4 });
        assert!(outcome.text().is_none());
        assert_eq!(provider.call_count(), 4);
        assert_eq!(tool_messages(&session).len(), 4);
        assert!(session.conversation.validate_pairing().is_ok());
        assert!(matches!(
            outcome.into_answer(),
            Err(AgentError::MaxIterations(4))
        ));
    }

    #[tokio::test]
    async fn test_denied_tool_never_runs() {
        let counter = Arc::new(AtomicUsize::new(0));
        let provider = Arc::new(
            ScriptedProvider::new()
                .then_tool_call("c1", "wipe", &json!({}))
                .then_text("I could not do that"),
        );
        let agent = agent_with(provider)
            .tool(counting_tool("wipe", Arc::clone(&counter)))
            .approval(Arc::new(DenyAll))
            .build()
            .unwrap();
        let mut session = Session::new();

        let outcome = agent.chat_in(&mut session, "wipe it").await.unwrap();

        assert_eq!(outcome.text(), Some("I could not do that"));
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        let tools = tool_messages(&session);
        assert_eq!(tools.len(), 1);
        assert!(tools[0]
            .content
            .ends_with(&AgentError::ApprovalDenied("wipe".into()).to_string()));
        assert_eq!(tools[0].tool_call_id.as_deref(), Some("c1"));
    }

    #[tokio::test]
    async fn test_approved_tool_runs() {
        let counter = Arc::new(AtomicUsize::new(0));
        let provider = Arc::new(
            ScriptedProvider::new()
                .then_tool_call("c1", "wipe", &json!({}))
                .then_text("done"),
        );
        let agent = agent_with(provider)
            .tool(counting_tool("wipe", Arc::clone(&counter)))
            .approval(Arc::new(ApproveAll))
            .build()
            .unwrap();

        agent.chat_in(&mut Session::new(), "wipe it").await.unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_approval_sees_session_and_arguments() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let recorder = Arc::clone(&seen);
        let gate = CallbackApproval::new(move |req: ApprovalRequest| {
            recorder.lock().unwrap().push(req);
            async { true }
        });
        let counter = Arc::new(AtomicUsize::new(0));
        let provider = Arc::new(
            ScriptedProvider::new()
                .then_tool_call("c1", "wipe", &json!({"path": "/tmp/x"}))
                .then_text("done"),
        );
        let agent = agent_with(provider)
            .tool(counting_tool("wipe", counter))
            .approval(Arc::new(gate))
            .build()
            .unwrap();

        agent.chat(&SessionId::from("s9"), "wipe").await.unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].session_id, "s9");
        assert_eq!(seen[0].tool_name, "wipe");
        assert_eq!(seen[0].arguments.str("path"), Some("/tmp/x"));
    }

    #[tokio::test]
    async fn test_approval_timeout_is_denial() {
        let counter = Arc::new(AtomicUsize::new(0));
        let gate = CallbackApproval::new(|_req: ApprovalRequest| async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            true
        });
        let provider = Arc::new(
            ScriptedProvider::new()
                .then_tool_call("c1", "wipe", &json!({}))
                .then_text("gave up"),
        );
        let agent = agent_with(provider)
            .tool(counting_tool("wipe", Arc::clone(&counter)))
            .approval(Arc::new(gate))
            .approval_timeout(Duration::from_millis(20))
            .build()
            .unwrap();

        let outcome = agent.chat_in(&mut Session::new(), "wipe").await.unwrap();
        assert_eq!(outcome.text(), Some("gave up"));
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unknown_tool_is_reported_to_model() {
        let provider = Arc::new(
            ScriptedProvider::new()
                .then_tool_call("c1", "teleport", &json!({}))
                .then_text("sorry"),
        );
        let agent = agent_with(provider).build().unwrap();
        let mut session = Session::new();

        let outcome = agent.chat_in(&mut session, "beam me up").await.unwrap();

        assert_eq!(outcome.text(), Some("sorry"));
        let tools = tool_messages(&session);
        assert!(tools[0].content.contains("Unknown tool 'teleport'"));
    }

    #[tokio::test]
    async fn test_malformed_arguments_are_reported_to_model() {
        let provider = Arc::new(
            ScriptedProvider::new()
                .then_tool_calls(vec![ToolCall::new("c1", "add", "{a: 2")])
                .then_text("retrying"),
        );
        let agent = agent_with(provider).tool(add_tool()).build().unwrap();
        let mut session = Session::new();

        let outcome = agent.chat_in(&mut session, "add").await.unwrap();

        assert_eq!(outcome.text(), Some("retrying"));
        assert!(tool_messages(&session)[0].content.contains("Malformed arguments"));
    }

    #[tokio::test]
    async fn test_executor_failure_is_reported_to_model() {
        let failing = FunctionTool::builder("flaky")
            .handler(|_args| async { Err(AgentError::ToolExecution("disk full".into())) });
        let provider = Arc::new(
            ScriptedProvider::new()
                .then_tool_call("c1", "flaky", &json!({}))
                .then_tool_call("c2", "add", &json!({"a": 1}))
                .then_text("ok"),
        );
        let agent = agent_with(provider)
            .tool(failing)
            .tool(add_tool())
            .build()
            .unwrap();
        let mut session = Session::new();

        let outcome = agent.chat_in(&mut session, "go").await.unwrap();

        assert_eq!(outcome.iterations(), 3);
        let tools = tool_messages(&session);
        assert!(tools[0].content.contains("disk full"));
        assert!(tools[1].content.contains("Missing required parameter: b"));
    }

    #[tokio::test]
    async fn test_panicking_tool_is_contained() {
        let panicky = FunctionTool::builder("panicky").handler(|_args| async {
            if true {
                panic!("kaboom");
            }
            Ok(String::new())
        });
        let provider = Arc::new(
            ScriptedProvider::new()
                .then_tool_call("c1", "panicky", &json!({}))
                .then_text("recovered"),
        );
        let agent = agent_with(provider).tool(panicky).build().unwrap();
        let mut session = Session::new();

        let outcome = agent.chat_in(&mut session, "go").await.unwrap();
        assert_eq!(outcome.text(), Some("recovered"));
        assert!(tool_messages(&session)[0].content.contains("panicked"));
    }

    #[tokio::test]
    async fn test_tool_calls_run_in_issued_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let recorder = Arc::clone(&log);
        let record = FunctionTool::builder("record")
            .param(ParameterSchema::required("item", ParamType::String, "Item"))
            .handler(move |args| {
                let recorder = Arc::clone(&recorder);
                async move {
                    let item = args.require_str("item")?.to_string();
                    recorder.lock().unwrap().push(item.clone());
                    Ok(item)
                }
            });
        let provider = Arc::new(
            ScriptedProvider::new()
                .then_tool_calls(vec![
                    ToolCall::new("c1", "record", r#"{"item":"first"}"#),
                    ToolCall::new("c2", "record", r#"{"item":"second"}"#),
                    ToolCall::new("c3", "record", r#"{"item":"third"}"#),
                ])
                .then_text("recorded"),
        );
        let agent = agent_with(provider).tool(record).build().unwrap();
        let mut session = Session::new();

        agent.chat_in(&mut session, "record").await.unwrap();

        assert_eq!(*log.lock().unwrap(), vec!["first", "second", "third"]);
        let ids: Vec<_> = tool_messages(&session)
            .iter()
            .map(|m| m.tool_call_id.clone().unwrap())
            .collect();
        assert_eq!(ids, vec!["c1", "c2", "c3"]);
    }

    #[tokio::test]
    async fn test_empty_response_is_retried() {
        let provider = Arc::new(ScriptedProvider::new().then_empty().then_text("finally"));
        let agent = agent_with(provider.clone()).build().unwrap();

        let outcome = agent.chat_in(&mut Session::new(), "hello").await.unwrap();
        assert_eq!(outcome.text(), Some("finally"));
        assert_eq!(provider.call_count(), 2);
    }

    #[tokio::test]
    async fn test_blank_text_is_retried() {
        let provider = Arc::new(
            ScriptedProvider::new()
                .then_text("")
                .then_text("  \n")
                .then_text("real"),
        );
        let agent = agent_with(provider.clone()).build().unwrap();
        let mut session = Session::new();

        let outcome = agent.chat_in(&mut session, "hello").await.unwrap();
        assert_eq!(outcome, ChatOutcome::Answer { text: "real".into(), iterations: 1 });
        assert_eq!(provider.call_count(), 3);
        assert_eq!(session.message_count(), 2);
    }

    #[tokio::test]
    async fn test_blank_text_never_answers() {
        let provider = Arc::new(ScriptedProvider::new().repeat(ScriptStep::Text(String::new())));
        let agent = agent_with(provider).empty_response_retries(1).build().unwrap();

        let result = agent.chat_in(&mut Session::new(), "hello").await;
        assert!(matches!(result, Err(AgentError::NoUsableResponse { attempts: 2 })));
    }

    #[tokio::test]
    async fn test_empty_tool_call_list_is_retried() {
        let provider = Arc::new(ScriptedProvider::new().then_tool_calls(vec![]).then_text("x"));
        let agent = agent_with(provider.clone()).build().unwrap();
        let mut session = Session::new();

        let outcome = agent.chat_in(&mut session, "hi").await.unwrap();
        assert_eq!(outcome.iterations(), 1);
        assert_eq!(provider.call_count(), 2);
        let roles: Vec<_> = session.messages().iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::User, Role::Assistant]);
        assert!(session.messages()[1].tool_calls.is_empty());
    }

    #[tokio::test]
    async fn test_persistent_empty_response_surfaces() {
        let provider = Arc::new(ScriptedProvider::new().repeat(ScriptStep::Empty));
        let agent = agent_with(provider.clone())
            .empty_response_retries(2)
            .build()
            .unwrap();

        let result = agent.chat_in(&mut Session::new(), "hello").await;
        assert!(matches!(result, Err(AgentError::NoUsableResponse { attempts: 3 })));
        assert_eq!(provider.call_count(), 3);
    }

    #[tokio::test]
    async fn test_provider_error_leaves_session_paired() {
        let provider = Arc::new(
            ScriptedProvider::new()
                .then_tool_call("c1", "add", &json!({"a": 1, "b": 2}))
                .then_error("connection reset"),
        );
        let agent = agent_with(provider.clone()).tool(add_tool()).build().unwrap();
        let mut session = Session::new();

        let result = agent.chat_in(&mut session, "add").await;

        assert!(matches!(result, Err(AgentError::Provider(_))));
        assert!(session.conversation.validate_pairing().is_ok());
        assert_eq!(provider.call_count(), 2);
    }

    #[tokio::test]
    async fn test_provider_timeout() {
        let provider = Arc::new(
            ScriptedProvider::new()
                .then_text("too late")
                .with_latency(Duration::from_millis(200)),
        );
        let agent = agent_with(provider)
            .provider_timeout(Duration::from_millis(10))
            .build()
            .unwrap();

        let result = agent.chat_in(&mut Session::new(), "hello").await;
        assert!(matches!(result, Err(AgentError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_concurrent_sessions_are_isolated() {
        let provider = Arc::new(
            ScriptedProvider::new()
                .repeat(ScriptStep::Text("ok".into()))
                .with_latency(Duration::from_millis(20)),
        );
        let agent = agent_with(provider).build().unwrap();
        let a = SessionId::from("a");
        let b = SessionId::from("b");

        let (ra, rb) = tokio::join!(agent.chat(&a, "from a"), agent.chat(&b, "from b"));
        ra.unwrap();
        rb.unwrap();

        let sa = agent.sessions().get(&a).unwrap();
        let sb = agent.sessions().get(&b).unwrap();
        let sa = sa.lock().await;
        assert_eq!(sa.message_count(), 2);
        assert_eq!(sa.messages()[0].content, "from a");
        assert_eq!(sb.lock().await.messages()[0].content, "from b");

        sb.lock().await.clear();
        assert_eq!(sa.message_count(), 2);
    }

    #[tokio::test]
    async fn test_system_prompt_is_transient() {
        let provider = Arc::new(ScriptedProvider::new().then_text("hi"));
        let agent = agent_with(provider.clone())
            .system_prompt("You are terse.")
            .build()
            .unwrap();
        let mut session = Session::new();

        agent.chat_in(&mut session, "hello").await.unwrap();

        let sent = &provider.requests()[0].messages;
        assert_eq!(sent[0].role, Role::System);
        assert_eq!(sent[0].content, "You are terse.");
        assert_eq!(session.message_count(), 2);
    }

    #[tokio::test]
    async fn test_per_session_system_prompt() {
        let provider = Arc::new(ScriptedProvider::new().repeat(ScriptStep::Text("ok".into())));
        let agent = agent_with(provider.clone()).build().unwrap();
        let mut metadata = crate::session::SessionMetadata::default();
        metadata.system_prompt = Some("You write poems.".into());
        agent
            .sessions()
            .create(CreateSession::new().id("writing").metadata(metadata))
            .unwrap();
        agent
            .sessions()
            .create(CreateSession::new().id("coding").system_message("You write Rust."))
            .unwrap();

        agent.chat(&SessionId::from("writing"), "a haiku").await.unwrap();
        agent.chat(&SessionId::from("coding"), "a struct").await.unwrap();

        let requests = provider.requests();
        assert_eq!(requests[0].messages[0].content, "You write poems.");
        assert_eq!(requests[1].messages[0].content, "You write Rust.");
        assert_eq!(requests[1].messages.len(), 2);
    }

    #[tokio::test]
    async fn test_events_are_emitted() {
        let provider = Arc::new(
            ScriptedProvider::new()
                .then_tool_call("c1", "add", &json!({"a": 2, "b": 3}))
                .then_text("5"),
        );
        let agent = agent_with(provider).tool(add_tool()).build().unwrap();
        let mut rx = agent.subscribe();

        agent.chat(&SessionId::from("s1"), "add").await.unwrap();

        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        assert!(events.iter().any(|e| matches!(e, AgentEvent::ToolStarted { tool, .. } if tool == "add")));
        assert!(events.iter().any(|e| matches!(e, AgentEvent::ToolFinished { success: true, .. })));
        assert!(matches!(
            events.last(),
            Some(AgentEvent::FinalMessage { content, iterations: 2, .. }) if content == "5"
        ));
    }

    #[tokio::test]
    async fn test_ask() {
        let provider = Arc::new(ScriptedProvider::new().then_text("Paris"));
        let agent = agent_with(provider).build().unwrap();
        assert_eq!(agent.ask("Capital of France?").await.unwrap(), "Paris");
    }

    #[test]
    fn test_builder_requires_provider() {
        assert!(matches!(Agent::builder().build(), Err(AgentError::Config(_))));
    }

    #[test]
    fn test_builder_rejects_zero_iterations() {
        let provider = Arc::new(ScriptedProvider::new());
        assert!(agent_with(provider).max_iterations(0).build().is_err());
    }
}
