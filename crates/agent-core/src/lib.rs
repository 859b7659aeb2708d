//! # agent-core
//!
//! Tool-calling agent orchestration with a provider-agnostic LLM abstraction.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                              Agent                                │
//! │  ┌─────────────┐  ┌──────────────┐  ┌──────────────────────────┐  │
//! │  │  Reasoning  │  │    Tool      │  │   LlmProvider            │  │
//! │  │    Loop     │──│   Registry   │  │   (Strategy)             │  │
//! │  └─────────────┘  └──────────────┘  └──────────────────────────┘  │
//! │         │                │                                        │
//! │  ┌─────────────┐  ┌──────────────┐  ┌──────────────────────────┐  │
//! │  │  Approval   │  │  MCP Bridge  │  │  SessionStore            │  │
//! │  │    Gate     │  │  (external)  │  │  (one lock per session)  │  │
//! │  └─────────────┘  └──────────────┘  └──────────────────────────┘  │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The `LlmProvider` trait enables swapping between Ollama, OpenAI, Anthropic,
//! or any other backend without changing agent logic. Tools bridged from MCP
//! servers land in the same registry as local tools, so the loop treats them
//! identically.

pub mod approval;
pub mod bridge;
pub mod error;
pub mod events;
pub mod message;
pub mod mock;
pub mod provider;
pub mod reasoning;
pub mod registry;
pub mod session;
pub mod store;
pub mod tool;

pub use approval::{ApprovalGate, ApprovalPolicy, ApprovalRequest};
pub use bridge::{BridgeConfig, McpBridge, McpConnector, McpServerConfig, McpTransport};
pub use error::{AgentError, Result};
pub use events::{AgentEvent, EventBus, LoopState};
pub use message::{Conversation, Message, Role};
pub use provider::{Completion, GenerationOptions, LlmProvider, Reply};
pub use reasoning::{Agent, AgentBuilder, AgentConfig, ChatOutcome};
pub use registry::{DangerPolicy, ToolRegistry};
pub use session::{Session, SessionId, SessionRecord, SessionSummary};
pub use store::{CreateSession, MemorySessionStore, SessionHandle, SessionStore};
pub use tool::{DangerClass, FunctionTool, Tool, ToolArguments, ToolCall, ToolResult, ToolSchema};

/// Re-exported so typed tool argument structs can derive it
pub use schemars::{self, JsonSchema};
