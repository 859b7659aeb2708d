//! Session Management
//!
//! A session is one isolated conversation: its ordered message log plus
//! metadata and activity timestamps.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::message::{Conversation, Message, Role};

/// Unique session identifier
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Session metadata
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionMetadata {
    /// Session title (auto-generated or user-set)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,

    /// Per-session system prompt, overriding the agent's default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,

    /// Extra key-value metadata
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

impl SessionMetadata {
    pub fn is_empty(&self) -> bool {
        self.title.is_none() && self.system_prompt.is_none() && self.extra.is_empty()
    }
}

/// Listing entry for a session
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub id: SessionId,
    pub title: String,
    pub message_count: usize,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

impl SessionSummary {
    /// Time since the last activity
    pub fn idle_for(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.last_activity
    }
}

/// Persistence record exchanged with external save/load collaborators
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    pub messages: Vec<Message>,
    #[serde(default, skip_serializing_if = "SessionMetadata::is_empty")]
    pub metadata: SessionMetadata,
}

/// A complete agent session
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Session {
    /// Unique identifier
    pub id: SessionId,

    /// Conversation history
    pub conversation: Conversation,

    /// Session metadata
    pub metadata: SessionMetadata,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// Last activity timestamp
    pub last_activity: DateTime<Utc>,
}

impl Session {
    /// Create a new session
    pub fn new() -> Self {
        Self::with_id(SessionId::new())
    }

    /// Create with specific ID
    pub fn with_id(id: SessionId) -> Self {
        let now = Utc::now();
        Self {
            id,
            conversation: Conversation::new(),
            metadata: SessionMetadata::default(),
            created_at: now,
            last_activity: now,
        }
    }

    /// Create with system prompt
    pub fn with_system_prompt(system_prompt: impl Into<String>) -> Self {
        let mut session = Self::new();
        session.conversation = Conversation::with_system_prompt(system_prompt);
        session
    }

    /// Rebuild a session from a persistence record
    pub fn from_record(record: SessionRecord) -> Self {
        Self {
            id: SessionId::from_string(record.session_id),
            conversation: Conversation::from_messages(record.messages),
            metadata: record.metadata,
            created_at: record.created_at,
            last_activity: Utc::now(),
        }
    }

    /// Produce a persistence record of the current state
    pub fn to_record(&self) -> SessionRecord {
        SessionRecord {
            session_id: self.id.as_str().to_string(),
            created_at: self.created_at,
            messages: self.conversation.messages().to_vec(),
            metadata: self.metadata.clone(),
        }
    }

    /// Update the activity timestamp
    pub fn touch(&mut self) {
        self.last_activity = Utc::now();
    }

    /// Append a message
    pub fn push(&mut self, message: Message) {
        self.conversation.push(message);
    }

    pub fn messages(&self) -> &[Message] {
        self.conversation.messages()
    }

    /// Set session title
    pub fn set_title(&mut self, title: impl Into<String>) {
        self.metadata.title = Some(title.into());
        self.touch();
    }

    /// Get or generate title
    pub fn title(&self) -> String {
        self.metadata.title.clone().unwrap_or_else(|| {
            self.conversation
                .messages()
                .iter()
                .find(|m| m.role == Role::User)
                .map_or_else(
                    || {
                        let short: String = self.id.as_str().chars().take(8).collect();
                        format!("Session {short}")
                    },
                    |m| {
                        let preview: String = m.content.chars().take(50).collect();
                        if m.content.chars().count() > 50 {
                            format!("{preview}...")
                        } else {
                            preview
                        }
                    },
                )
        })
    }

    /// Drop everything except system messages
    pub fn clear(&mut self) {
        self.conversation.clear_history();
        self.touch();
    }

    /// Message count
    pub fn message_count(&self) -> usize {
        self.conversation.len()
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            id: self.id.clone(),
            title: self.title(),
            message_count: self.message_count(),
            created_at: self.created_at,
            last_activity: self.last_activity,
        }
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}
