//! Agent Events
//!
//! Typed notifications emitted by the reasoning loop, so front-ends can
//! render progress without the loop knowing about them.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Reasoning loop states
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopState {
    AwaitingModel,
    ExecutingTools,
    AwaitingApproval,
    Done,
    Exhausted,
}

/// Event emitted while a chat runs
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    LoopStateChanged {
        session_id: String,
        state: LoopState,
        iteration: usize,
    },
    ToolStarted {
        session_id: String,
        call_id: String,
        tool: String,
    },
    ToolFinished {
        session_id: String,
        call_id: String,
        tool: String,
        success: bool,
    },
    ApprovalRequested {
        session_id: String,
        call_id: String,
        tool: String,
    },
    ApprovalResolved {
        session_id: String,
        call_id: String,
        tool: String,
        approved: bool,
    },
    FinalMessage {
        session_id: String,
        content: String,
        iterations: usize,
    },
    Exhausted {
        session_id: String,
        iterations: usize,
    },
}

impl AgentEvent {
    pub fn session_id(&self) -> &str {
        match self {
            Self::LoopStateChanged { session_id, .. }
            | Self::ToolStarted { session_id, .. }
            | Self::ToolFinished { session_id, .. }
            | Self::ApprovalRequested { session_id, .. }
            | Self::ApprovalResolved { session_id, .. }
            | Self::FinalMessage { session_id, .. }
            | Self::Exhausted { session_id, .. } => session_id,
        }
    }
}

/// Fan-out of agent events to any number of subscribers.
///
/// Publishing never blocks; slow subscribers miss events (lagged) rather
/// than stalling the loop.
#[derive(Clone, Debug)]
pub struct EventBus {
    tx: broadcast::Sender<AgentEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AgentEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: AgentEvent) {
        // No subscribers is fine
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
