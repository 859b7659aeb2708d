//! # agent-runtime
//!
//! Concrete collaborators for the agent core.
//!
//! ## Components
//!
//! - **Ollama** (default feature): local LLM inference with native tool calling
//! - **MCP**: stdio JSON-RPC transport for external tool servers
//! - **Archive**: JSON file persistence for session records
//!
//! ## Usage
//!
//! ```rust,ignore
//! use agent_core::{Agent, McpBridge, ToolRegistry};
//! use agent_runtime::{OllamaProvider, StdioConnector};
//!
//! let tools = Arc::new(ToolRegistry::new());
//! let bridge = McpBridge::connect(&bridge_config, &StdioConnector).await;
//! tools.merge_bridge(&bridge);
//!
//! let agent = Agent::builder()
//!     .provider(Arc::new(OllamaProvider::from_env()))
//!     .tools(tools)
//!     .build()?;
//! ```

pub mod archive;
pub mod mcp;
#[cfg(feature = "ollama")]
pub mod ollama;

pub use archive::SessionArchive;
pub use mcp::{StdioConnector, StdioMcpClient};
#[cfg(feature = "ollama")]
pub use ollama::{OllamaConfig, OllamaProvider};

// Re-export core types for convenience
pub use agent_core::{
    Agent, AgentError, LlmProvider, Message, Result, Role, Session, Tool, ToolRegistry,
};
