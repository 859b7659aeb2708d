//! Conversation Messages
//!
//! Standard message format used across the agent system, plus the ordered
//! message log that enforces tool-call/tool-result pairing.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{AgentError, Result};
use crate::tool::ToolCall;

/// Role of a message sender
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System prompt/instructions
    System,
    /// User input
    User,
    /// Assistant (LLM) response
    Assistant,
    /// Tool result (injected as context)
    Tool,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::System => write!(f, "system"),
            Self::User => write!(f, "user"),
            Self::Assistant => write!(f, "assistant"),
            Self::Tool => write!(f, "tool"),
        }
    }
}

/// A single message in a conversation
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Message role
    pub role: Role,

    /// Text content, empty when an assistant message only carries tool calls
    #[serde(default)]
    pub content: String,

    /// Tool invocations requested by the assistant
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,

    /// Back-reference from a tool result to the call it answers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,

    /// Optional name (tool name on tool results, speaker in multi-user chats)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Timestamp
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl Message {
    /// Create a new message
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
            name: None,
            timestamp: Utc::now(),
        }
    }

    /// Create a system message
    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    /// Create a user message
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    /// Create an assistant message
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    /// Create an assistant message requesting tool execution
    pub fn assistant_tool_calls(content: impl Into<String>, calls: Vec<ToolCall>) -> Self {
        let mut msg = Self::new(Role::Assistant, content);
        msg.tool_calls = calls;
        msg
    }

    /// Create a tool result message paired with `tool_call_id`
    pub fn tool(
        tool_call_id: impl Into<String>,
        tool_name: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        let mut msg = Self::new(Role::Tool, content);
        msg.tool_call_id = Some(tool_call_id.into());
        msg.name = Some(tool_name.into());
        msg
    }

    /// Add a name to the message
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Whether this is an assistant message carrying tool calls
    pub fn has_tool_calls(&self) -> bool {
        self.role == Role::Assistant && !self.tool_calls.is_empty()
    }
}

/// Ordered, append-only message log
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Conversation {
    messages: Vec<Message>,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_system_prompt(prompt: impl Into<String>) -> Self {
        let mut conv = Self::new();
        conv.push(Message::system(prompt));
        conv
    }

    /// Seed from a previously produced message list
    pub fn from_messages(messages: Vec<Message>) -> Self {
        Self { messages }
    }

    /// Add a message
    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
    }

    /// Get all messages
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Take the message list out, leaving the conversation empty
    pub fn into_messages(self) -> Vec<Message> {
        self.messages
    }

    /// Get the last message
    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    /// Whether the log opens with a system message
    pub fn has_system_prompt(&self) -> bool {
        self.messages.first().is_some_and(|m| m.role == Role::System)
    }

    /// Clear all messages except system prompt
    pub fn clear_history(&mut self) {
        self.messages.retain(|m| m.role == Role::System);
    }

    /// Ids of tool calls in the trailing assistant block that still lack results
    pub fn pending_tool_calls(&self) -> Vec<String> {
        let Some(start) = self.messages.iter().rposition(Message::has_tool_calls) else {
            return Vec::new();
        };
        let answered: HashSet<&str> = self.messages[start + 1..]
            .iter()
            .filter(|m| m.role == Role::Tool)
            .filter_map(|m| m.tool_call_id.as_deref())
            .collect();
        self.messages[start]
            .tool_calls
            .iter()
            .filter(|c| !answered.contains(c.id.as_str()))
            .map(|c| c.id.clone())
            .collect()
    }

    /// Check that every tool result answers exactly one earlier call and every
    /// call is answered before the conversation moves on.
    pub fn validate_pairing(&self) -> Result<()> {
        let mut open: Vec<String> = Vec::new();

        for (idx, msg) in self.messages.iter().enumerate() {
            match msg.role {
                Role::Tool => {
                    let id = msg.tool_call_id.as_deref().ok_or_else(|| {
                        AgentError::UnpairedToolCall(format!("tool message #{idx} has no tool_call_id"))
                    })?;
                    let pos = open.iter().position(|o| o == id).ok_or_else(|| {
                        AgentError::UnpairedToolCall(format!(
                            "tool message #{idx} answers unknown or already answered call '{id}'"
                        ))
                    })?;
                    open.remove(pos);
                }
                _ => {
                    if let Some(id) = open.first() {
                        return Err(AgentError::UnpairedToolCall(format!(
                            "call '{id}' has no result before message #{idx}"
                        )));
                    }
                    if msg.has_tool_calls() {
                        open = msg.tool_calls.iter().map(|c| c.id.clone()).collect();
                    }
                }
            }
        }

        match open.first() {
            Some(id) => Err(AgentError::UnpairedToolCall(format!("call '{id}' has no result"))),
            None => Ok(()),
        }
    }

    /// Drop a trailing tool-call block whose results are incomplete.
    ///
    /// Returns the number of messages removed.
    pub fn rollback_unpaired(&mut self) -> usize {
        if self.pending_tool_calls().is_empty() {
            return 0;
        }
        let Some(start) = self.messages.iter().rposition(Message::has_tool_calls) else {
            return 0;
        };
        let removed = self.messages.len() - start;
        self.messages.truncate(start);
        removed
    }

    /// Number of messages
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}
