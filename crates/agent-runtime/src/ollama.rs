//! Ollama LLM Provider
//!
//! Implementation of `LlmProvider` for local Ollama inference, using the
//! native `/api/chat` tool-calling protocol.

use std::time::Duration;

use agent_core::{
    error::{AgentError, Result},
    message::{Message, Role},
    provider::{
        Completion, FinishReason, GenerationOptions, LlmProvider, ModelInfo, ProviderInfo,
        TokenUsage,
    },
    tool::ToolCall,
};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{json, Map, Value};

/// Ollama provider configuration
#[derive(Clone, Debug)]
pub struct OllamaConfig {
    /// Ollama host URL
    pub host: String,

    /// Ollama port
    pub port: u16,

    /// Request timeout in seconds
    pub timeout_secs: u64,
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            host: "http://localhost".into(),
            port: 11434,
            timeout_secs: 120,
        }
    }
}

impl OllamaConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let host = std::env::var("OLLAMA_HOST").unwrap_or(defaults.host);
        let port = std::env::var("OLLAMA_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(defaults.port);
        let timeout_secs = std::env::var("OLLAMA_TIMEOUT_SECS")
            .ok()
            .and_then(|t| t.parse().ok())
            .unwrap_or(defaults.timeout_secs);

        Self {
            host,
            port,
            timeout_secs,
        }
    }

    /// Base URL; a port already present in `host` is respected
    pub fn base_url(&self) -> String {
        let host = self.host.trim_end_matches('/');
        let has_port = host
            .rsplit_once(':')
            .is_some_and(|(_, tail)| !tail.is_empty() && tail.chars().all(|c| c.is_ascii_digit()));
        if has_port {
            host.to_string()
        } else {
            format!("{host}:{}", self.port)
        }
    }
}

/// Ollama LLM provider
pub struct OllamaProvider {
    client: reqwest::Client,
    base_url: String,
}

impl OllamaProvider {
    /// Create a new Ollama provider with custom host/port
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self::from_config(OllamaConfig {
            host: host.into(),
            port,
            ..Default::default()
        })
    }

    /// Create from configuration
    pub fn from_config(config: OllamaConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .unwrap_or_default();

        Self {
            client,
            base_url: config.base_url(),
        }
    }

    /// Create from environment variables
    pub fn from_env() -> Self {
        Self::from_config(OllamaConfig::from_env())
    }

    /// Create with default localhost settings
    pub fn localhost() -> Self {
        Self::from_config(OllamaConfig::default())
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Convert agent messages to Ollama format
    fn convert_messages(messages: &[Message]) -> Vec<Value> {
        messages
            .iter()
            .map(|m| {
                let mut wire = json!({
                    "role": m.role.to_string(),
                    "content": m.content,
                });
                if !m.tool_calls.is_empty() {
                    wire["tool_calls"] = m
                        .tool_calls
                        .iter()
                        .map(|call| {
                            json!({
                                "function": {
                                    "name": call.name,
                                    "arguments": arguments_object(&call.arguments),
                                }
                            })
                        })
                        .collect();
                }
                if m.role == Role::Tool {
                    if let Some(name) = &m.name {
                        wire["tool_name"] = Value::String(name.clone());
                    }
                }
                wire
            })
            .collect()
    }

    fn build_request(messages: &[Message], tools: &[Value], opts: &GenerationOptions) -> Value {
        let mut options = json!({
            "temperature": opts.temperature,
            "top_p": opts.top_p,
            "num_predict": opts.max_tokens,
        });
        if !opts.stop_sequences.is_empty() {
            options["stop"] = json!(opts.stop_sequences);
        }

        let mut body = json!({
            "model": opts.model,
            "messages": Self::convert_messages(messages),
            "stream": false,
            "options": options,
        });
        if !tools.is_empty() {
            body["tools"] = Value::Array(tools.to_vec());
        }
        body
    }

    /// Convert an Ollama response to an agent completion
    fn convert_completion(response: ChatResponse, model: &str) -> Result<Completion> {
        // Ollama does not assign call ids, so every call gets a fresh one
        let calls: Vec<ToolCall> = response
            .message
            .tool_calls
            .into_iter()
            .map(|call| {
                let arguments = match call.function.arguments {
                    Value::String(raw) => raw,
                    Value::Null => String::new(),
                    other => other.to_string(),
                };
                ToolCall::new(ToolCall::generate_id(), call.function.name, arguments)
            })
            .collect();

        let prompt_tokens = response.prompt_eval_count.unwrap_or(0);
        let completion_tokens = response.eval_count.unwrap_or(0);
        let mut completion = Completion::from_parts(model, response.message.content, calls)?
            .with_usage(TokenUsage {
                prompt_tokens,
                completion_tokens,
                total_tokens: prompt_tokens + completion_tokens,
            });
        if response.done_reason.as_deref() == Some("length") {
            completion.finish_reason = Some(FinishReason::Length);
        }
        Ok(completion)
    }

    async fn fetch_tags(&self) -> Result<TagsResponse> {
        let response = self
            .client
            .get(format!("{}/api/tags", self.base_url))
            .send()
            .await
            .map_err(map_send_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(map_status(status, &body));
        }

        response
            .json()
            .await
            .map_err(|e| AgentError::Provider(format!("Failed to parse model list: {e}")))
    }
}

fn arguments_object(raw: &str) -> Value {
    serde_json::from_str::<Value>(raw)
        .ok()
        .filter(Value::is_object)
        .unwrap_or_else(|| Value::Object(Map::new()))
}

fn map_send_error(e: reqwest::Error) -> AgentError {
    if e.is_timeout() {
        AgentError::Timeout(format!("Ollama request timed out: {e}"))
    } else if e.is_connect() {
        AgentError::ProviderUnavailable(format!("Cannot reach Ollama: {e}"))
    } else {
        AgentError::Provider(e.to_string())
    }
}

fn map_status(status: StatusCode, body: &str) -> AgentError {
    let detail = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v["error"].as_str().map(str::to_string))
        .unwrap_or_else(|| body.to_string());

    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => AgentError::Auth(detail),
        StatusCode::TOO_MANY_REQUESTS => AgentError::RateLimited(detail),
        StatusCode::BAD_GATEWAY | StatusCode::SERVICE_UNAVAILABLE | StatusCode::GATEWAY_TIMEOUT => {
            AgentError::ProviderUnavailable(format!("{status}: {detail}"))
        }
        _ => AgentError::Provider(format!("{status}: {detail}")),
    }
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    message: ResponseMessage,
    #[serde(default)]
    done_reason: Option<String>,
    #[serde(default)]
    prompt_eval_count: Option<u32>,
    #[serde(default)]
    eval_count: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: String,
    #[serde(default)]
    tool_calls: Vec<ResponseToolCall>,
}

#[derive(Debug, Deserialize)]
struct ResponseToolCall {
    function: ResponseFunction,
}

#[derive(Debug, Deserialize)]
struct ResponseFunction {
    name: String,
    #[serde(default)]
    arguments: Value,
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<TagEntry>,
}

#[derive(Debug, Deserialize)]
struct TagEntry {
    name: String,
}

#[async_trait]
impl LlmProvider for OllamaProvider {
    async fn info(&self) -> Result<ProviderInfo> {
        let models = self.list_models().await.unwrap_or_default();

        Ok(ProviderInfo {
            name: "Ollama".into(),
            version: None, // Ollama API doesn't expose version
            models,
            supports_tools: true,
        })
    }

    async fn health_check(&self) -> Result<bool> {
        match self.fetch_tags().await {
            Ok(_) => Ok(true),
            Err(e) => {
                tracing::warn!(error = %e, "Ollama health check failed");
                Ok(false)
            }
        }
    }

    async fn complete(
        &self,
        messages: &[Message],
        tools: &[Value],
        options: &GenerationOptions,
    ) -> Result<Completion> {
        let body = Self::build_request(messages, tools, options);
        tracing::debug!(model = %options.model, messages = messages.len(), tools = tools.len(), "Ollama chat request");

        let response = self
            .client
            .post(format!("{}/api/chat", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(map_send_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(map_status(status, &body));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| AgentError::Provider(format!("Failed to parse response: {e}")))?;

        Self::convert_completion(parsed, &options.model)
    }

    async fn list_models(&self) -> Result<Vec<ModelInfo>> {
        let tags = self.fetch_tags().await?;

        Ok(tags
            .models
            .into_iter()
            .map(|m| ModelInfo {
                id: m.name.clone(),
                name: m.name,
                context_length: None, // Not exposed by /api/tags
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use agent_core::provider::Reply;

    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = OllamaConfig::default();
        assert_eq!(config.host, "http://localhost");
        assert_eq!(config.port, 11434);
        assert_eq!(config.base_url(), "http://localhost:11434");
    }

    #[test]
    fn test_base_url_keeps_explicit_port() {
        let config = OllamaConfig {
            host: "http://gpu-box:8080/".into(),
            ..Default::default()
        };
        assert_eq!(config.base_url(), "http://gpu-box:8080");
    }

    #[test]
    fn test_message_conversion() {
        let call = ToolCall::new("c1", "add", r#"{"a":2,"b":3}"#);
        let messages = vec![
            Message::system("You are helpful."),
            Message::user("add 2 and 3"),
            Message::assistant_tool_calls("", vec![call]),
            Message::tool("c1", "add", "5"),
        ];

        let converted = OllamaProvider::convert_messages(&messages);
        assert_eq!(converted.len(), 4);
        assert_eq!(converted[0]["role"], "system");
        assert_eq!(converted[2]["tool_calls"][0]["function"]["arguments"]["a"], 2);
        assert_eq!(converted[3]["role"], "tool");
        assert_eq!(converted[3]["tool_name"], "add");
    }

    #[test]
    fn test_request_includes_tools() {
        let tools = vec![json!({"type": "function", "function": {"name": "add"}})];
        let body = OllamaProvider::build_request(&[Message::user("hi")], &tools, &GenerationOptions::default());
        assert_eq!(body["stream"], false);
        assert_eq!(body["tools"][0]["function"]["name"], "add");

        let bare = OllamaProvider::build_request(&[Message::user("hi")], &[], &GenerationOptions::default());
        assert!(bare.get("tools").is_none());
    }

    #[test]
    fn test_tool_call_response() {
        let response: ChatResponse = serde_json::from_value(json!({
            "model": "llama3.2",
            "message": {
                "role": "assistant",
                "content": "",
                "tool_calls": [{"function": {"name": "add", "arguments": {"a": 2, "b": 3}}}]
            },
            "done": true,
            "prompt_eval_count": 10,
            "eval_count": 5
        }))
        .unwrap();

        let completion = OllamaProvider::convert_completion(response, "llama3.2").unwrap();
        let Reply::ToolCalls { calls, .. } = completion.reply else {
            panic!("expected tool calls");
        };
        assert_eq!(calls[0].name, "add");
        assert!(calls[0].id.starts_with("call_"));
        assert_eq!(calls[0].parse_arguments().unwrap().i64("b"), Some(3));
        assert_eq!(completion.usage.unwrap().total_tokens, 15);
    }

    #[test]
    fn test_empty_response() {
        let response: ChatResponse =
            serde_json::from_value(json!({"message": {"role": "assistant", "content": ""}, "done": true})).unwrap();
        assert!(matches!(
            OllamaProvider::convert_completion(response, "m"),
            Err(AgentError::EmptyResponse)
        ));
    }

    #[test]
    fn test_status_mapping() {
        assert!(matches!(map_status(StatusCode::UNAUTHORIZED, ""), AgentError::Auth(_)));
        assert!(matches!(
            map_status(StatusCode::TOO_MANY_REQUESTS, ""),
            AgentError::RateLimited(_)
        ));
        let err = map_status(StatusCode::NOT_FOUND, r#"{"error":"model 'x' not found"}"#);
        assert!(err.to_string().contains("model 'x' not found"));
    }

    #[tokio::test]
    async fn test_unreachable_server_is_unhealthy() {
        let provider = OllamaProvider::new("http://127.0.0.1", 9);
        assert!(!provider.health_check().await.unwrap());
    }
}
