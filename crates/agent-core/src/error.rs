//! Error Types

use thiserror::Error;

/// Result type alias for agent operations
pub type Result<T> = std::result::Result<T, AgentError>;

/// Agent error types
#[derive(Error, Debug)]
pub enum AgentError {
    /// LLM provider error
    #[error("Provider error: {0}")]
    Provider(String),

    /// Provider unavailable or not responding
    #[error("Provider unavailable: {0}")]
    ProviderUnavailable(String),

    /// Backend answered with neither text nor tool calls
    #[error("Provider returned an empty response")]
    EmptyResponse,

    /// Empty responses persisted past the retry budget
    #[error("No usable response from provider after {attempts} attempts")]
    NoUsableResponse { attempts: usize },

    /// Tool call arguments could not be parsed
    #[error("Malformed arguments for tool '{tool}': {reason}")]
    MalformedToolArguments { tool: String, reason: String },

    /// Tool not found in registry
    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    /// Tool validation failed
    #[error("Tool validation error: {0}")]
    ToolValidation(String),

    /// Tool execution failed
    #[error("Tool execution error: {0}")]
    ToolExecution(String),

    /// Approval gate refused a dangerous call
    #[error("Tool call '{0}' was rejected: approval denied")]
    ApprovalDenied(String),

    /// Maximum iterations reached in reasoning loop
    #[error("Maximum iterations ({0}) reached")]
    MaxIterations(usize),

    /// A session with this id already exists
    #[error("Session already exists: {0}")]
    SessionExists(String),

    /// No session with this id
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// Conversation holds tool calls without paired results (or vice versa)
    #[error("Unpaired tool call: {0}")]
    UnpairedToolCall(String),

    /// Operation exceeded its configured deadline
    #[error("Timed out: {0}")]
    Timeout(String),

    /// External tool server error
    #[error("Bridge error: {0}")]
    Bridge(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Rate limited
    #[error("Rate limited: {0}")]
    RateLimited(String),

    /// Authentication failed
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// Generic IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Other/unknown error
    #[error("{0}")]
    Other(String),
}

impl AgentError {
    /// Check if error is retryable
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ProviderUnavailable(_)
                | Self::RateLimited(_)
                | Self::Timeout(_)
                | Self::EmptyResponse
                | Self::Io(_)
        )
    }

    /// Convert to a user-friendly message
    pub fn user_message(&self) -> String {
        match self {
            Self::Provider(msg) => format!("The AI service encountered an error: {msg}"),
            Self::ProviderUnavailable(_) => {
                "The AI service is currently unavailable. Please try again.".into()
            }
            Self::EmptyResponse | Self::NoUsableResponse { .. } => {
                "The AI service returned no usable response. Please try again.".into()
            }
            Self::ToolNotFound(name) => format!("The tool '{name}' is not available."),
            Self::ToolValidation(msg) | Self::MalformedToolArguments { reason: msg, .. } => {
                format!("Invalid tool input: {msg}")
            }
            Self::ToolExecution(msg) => format!("Tool error: {msg}"),
            Self::ApprovalDenied(name) => format!("Running '{name}' was not approved."),
            Self::MaxIterations(_) => {
                "The request took too long to process. Please try a simpler query.".into()
            }
            Self::SessionExists(id) => format!("Session '{id}' already exists."),
            Self::SessionNotFound(id) => format!("Session '{id}' was not found."),
            Self::Timeout(_) => "The request timed out. Please try again.".into(),
            Self::RateLimited(_) => "You've made too many requests. Please wait a moment.".into(),
            Self::Auth(_) => "Authentication failed. Please check your credentials.".into(),
            _ => "An unexpected error occurred.".into(),
        }
    }
}

impl From<anyhow::Error> for AgentError {
    fn from(err: anyhow::Error) -> Self {
        Self::Other(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(AgentError::EmptyResponse.is_retryable());
        assert!(AgentError::RateLimited("slow down".into()).is_retryable());
        assert!(!AgentError::Auth("bad key".into()).is_retryable());
        assert!(!AgentError::NoUsableResponse { attempts: 3 }.is_retryable());
    }

    #[test]
    fn test_user_message_hides_internals() {
        let err = AgentError::Other("stack trace here".into());
        assert_eq!(err.user_message(), "An unexpected error occurred.");
    }
}
