//! External Tool Bridge
//!
//! Exposes tools hosted by out-of-process MCP servers through the regular
//! [`Tool`] contract. The reasoning loop never sees the bridge: bridged tools
//! are merged into the [`ToolRegistry`] and dispatched like any local tool.
//!
//! The wire transport is pluggable through [`McpConnector`] and
//! [`McpTransport`]; `agent-runtime` ships a stdio JSON-RPC implementation.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{AgentError, Result};
use crate::registry::ToolRegistry;
use crate::tool::{DangerClass, Tool, ToolArguments, ToolSchema};

/// Launch parameters for one MCP server
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct McpServerConfig {
    pub command: String,

    #[serde(default)]
    pub args: Vec<String>,

    /// Extra environment passed to the server process
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Route every tool of this server through the approval gate
    #[serde(default)]
    pub requires_approval: bool,

    /// Expose tools as `server__tool` instead of the bare remote name
    #[serde(default = "default_prefix_tools")]
    pub prefix_tools: bool,
}

const fn default_prefix_tools() -> bool {
    true
}

impl Default for McpServerConfig {
    fn default() -> Self {
        Self {
            command: String::new(),
            args: Vec::new(),
            env: HashMap::new(),
            requires_approval: false,
            prefix_tools: default_prefix_tools(),
        }
    }
}

/// Named MCP servers to connect at startup
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeConfig {
    #[serde(rename = "mcpServers", alias = "servers", default)]
    pub servers: BTreeMap<String, McpServerConfig>,
}

impl BridgeConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| AgentError::Config(format!("Invalid bridge config: {e}")))
    }

    /// Load a bridge configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            AgentError::Config(format!("Cannot read bridge config {}: {e}", path.display()))
        })?;
        Self::from_json(&raw)
    }

    #[must_use]
    pub fn with_server(mut self, name: impl Into<String>, server: McpServerConfig) -> Self {
        self.servers.insert(name.into(), server);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }
}

/// A tool as advertised by a remote server
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RemoteTool {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "inputSchema", default)]
    pub input_schema: Value,
}

/// A live connection to one MCP server
#[async_trait]
pub trait McpTransport: Send + Sync {
    async fn list_tools(&self) -> Result<Vec<RemoteTool>>;

    /// Invoke a remote tool and return its text output
    async fn call_tool(&self, name: &str, arguments: Value) -> Result<String>;

    async fn shutdown(&self) {}
}

/// Opens transports for configured servers
#[async_trait]
pub trait McpConnector: Send + Sync {
    async fn connect(&self, server: &str, config: &McpServerConfig) -> Result<Arc<dyn McpTransport>>;
}

/// A [`Tool`] that forwards calls to a remote server
pub struct McpTool {
    server: String,
    remote_name: String,
    schema: ToolSchema,
    transport: Arc<dyn McpTransport>,
}

impl McpTool {
    pub fn new(
        server: &str,
        remote: RemoteTool,
        config: &McpServerConfig,
        transport: Arc<dyn McpTransport>,
    ) -> Self {
        let name = if config.prefix_tools {
            format!("{server}__{}", remote.name)
        } else {
            remote.name.clone()
        };
        let description = if remote.description.is_empty() {
            format!("Tool '{}' provided by MCP server '{server}'", remote.name)
        } else {
            remote.description
        };

        let mut schema = ToolSchema::new(name, description, normalize_input_schema(remote.input_schema));
        schema.category = Some(format!("mcp:{server}"));
        if config.requires_approval {
            schema.danger = DangerClass::RequiresApproval;
        }

        Self {
            server: server.to_string(),
            remote_name: remote.name,
            schema,
            transport,
        }
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    pub fn remote_name(&self) -> &str {
        &self.remote_name
    }
}

impl std::fmt::Debug for McpTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("McpTool")
            .field("server", &self.server)
            .field("name", &self.schema.name)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Tool for McpTool {
    fn schema(&self) -> ToolSchema {
        self.schema.clone()
    }

    async fn execute(&self, args: ToolArguments) -> Result<String> {
        tracing::debug!(server = %self.server, tool = %self.remote_name, "Forwarding tool call");
        self.transport
            .call_tool(&self.remote_name, args.into_value())
            .await
            .map_err(|e| AgentError::ToolExecution(format!("MCP server '{}': {e}", self.server)))
    }
}

/// Make a remote input schema acceptable as function parameters
fn normalize_input_schema(schema: Value) -> Value {
    let mut object = match schema {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    // Some providers reject `$schema` inside function parameters
    object.remove("$schema");
    object
        .entry("type")
        .or_insert_with(|| Value::String("object".into()));
    object
        .entry("properties")
        .or_insert_with(|| Value::Object(Map::new()));
    Value::Object(object)
}

struct ConnectedServer {
    name: String,
    transport: Arc<dyn McpTransport>,
    tools: Vec<Arc<McpTool>>,
}

/// Every successfully connected server and the tools it exposes
#[derive(Default)]
pub struct McpBridge {
    servers: Vec<ConnectedServer>,
}

impl McpBridge {
    /// Connect every configured server.
    ///
    /// A server that fails to start or to list its tools is logged and
    /// skipped; the remaining servers stay usable.
    pub async fn connect(config: &BridgeConfig, connector: &dyn McpConnector) -> Self {
        let mut servers = Vec::with_capacity(config.servers.len());

        for (name, server_config) in &config.servers {
            tracing::info!(server = %name, command = %server_config.command, "Connecting to MCP server");

            let transport = match connector.connect(name, server_config).await {
                Ok(transport) => transport,
                Err(e) => {
                    tracing::error!(server = %name, error = %e, "Failed to connect MCP server");
                    continue;
                }
            };

            let remote_tools = match transport.list_tools().await {
                Ok(tools) => tools,
                Err(e) => {
                    tracing::error!(server = %name, error = %e, "Failed to list MCP tools");
                    transport.shutdown().await;
                    continue;
                }
            };

            let tools: Vec<Arc<McpTool>> = remote_tools
                .into_iter()
                .map(|remote| Arc::new(McpTool::new(name, remote, server_config, Arc::clone(&transport))))
                .collect();

            tracing::info!(
                server = %name,
                tools = ?tools.iter().map(|t| t.schema.name.as_str()).collect::<Vec<_>>(),
                "Registered MCP server"
            );
            servers.push(ConnectedServer {
                name: name.clone(),
                transport,
                tools,
            });
        }

        Self { servers }
    }

    pub fn server_names(&self) -> Vec<&str> {
        self.servers.iter().map(|s| s.name.as_str()).collect()
    }

    pub fn tools(&self) -> impl Iterator<Item = &Arc<McpTool>> {
        self.servers.iter().flat_map(|s| s.tools.iter())
    }

    pub fn tool_count(&self) -> usize {
        self.servers.iter().map(|s| s.tools.len()).sum()
    }

    pub async fn shutdown(&self) {
        for server in &self.servers {
            server.transport.shutdown().await;
        }
    }
}

impl ToolRegistry {
    /// Add every bridged tool; local tools keep their names on collision.
    /// Returns the number of tools added.
    pub fn merge_bridge(&self, bridge: &McpBridge) -> usize {
        bridge
            .tools()
            .filter(|tool| self.register_bridged(tool.server(), Arc::clone(tool) as Arc<dyn Tool>))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use serde_json::json;

    use super::*;
    use crate::registry::ToolOrigin;
    use crate::tool::FunctionTool;

    #[derive(Default)]
    struct FakeTransport {
        tools: Vec<RemoteTool>,
        calls: Mutex<Vec<(String, Value)>>,
    }

    #[async_trait]
    impl McpTransport for FakeTransport {
        async fn list_tools(&self) -> Result<Vec<RemoteTool>> {
            Ok(self.tools.clone())
        }

        async fn call_tool(&self, name: &str, arguments: Value) -> Result<String> {
            self.calls.lock().unwrap().push((name.to_string(), arguments));
            if name == "broken" {
                return Err(AgentError::Bridge("remote failure".into()));
            }
            Ok(format!("{name} ok"))
        }
    }

    struct FakeConnector {
        transport: Arc<FakeTransport>,
    }

    #[async_trait]
    impl McpConnector for FakeConnector {
        async fn connect(&self, server: &str, _config: &McpServerConfig) -> Result<Arc<dyn McpTransport>> {
            if server == "offline" {
                return Err(AgentError::Bridge("spawn failed".into()));
            }
            Ok(Arc::clone(&self.transport) as Arc<dyn McpTransport>)
        }
    }

    fn remote(name: &str) -> RemoteTool {
        RemoteTool {
            name: name.into(),
            description: format!("remote {name}"),
            input_schema: json!({
                "$schema": "http://json-schema.org/draft-07/schema#",
                "type": "object",
                "properties": {"q": {"type": "string"}},
                "required": ["q"]
            }),
        }
    }

    fn connector(tools: &[&str]) -> (FakeConnector, Arc<FakeTransport>) {
        let transport = Arc::new(FakeTransport {
            tools: tools.iter().map(|n| remote(n)).collect(),
            calls: Mutex::default(),
        });
        (
            FakeConnector {
                transport: Arc::clone(&transport),
            },
            transport,
        )
    }

    fn server(prefix_tools: bool) -> McpServerConfig {
        McpServerConfig {
            command: "fake".into(),
            prefix_tools,
            ..McpServerConfig::default()
        }
    }

    #[test]
    fn test_config_parsing() {
        let config = BridgeConfig::from_json(
            r#"{"mcpServers": {"files": {"command": "npx", "args": ["-y", "fs-server"], "requires_approval": true}}}"#,
        )
        .unwrap();
        let files = &config.servers["files"];
        assert_eq!(files.args, vec!["-y", "fs-server"]);
        assert!(files.requires_approval);
        assert!(files.prefix_tools);
        assert!(BridgeConfig::from_json("[1]").is_err());
    }

    #[tokio::test]
    async fn test_bridge_prefixes_and_strips_schema() {
        let (connector, _) = connector(&["search"]);
        let config = BridgeConfig::default().with_server("web", server(true));

        let bridge = McpBridge::connect(&config, &connector).await;

        let tool = bridge.tools().next().unwrap();
        let schema = tool.schema();
        assert_eq!(schema.name, "web__search");
        assert_eq!(tool.remote_name(), "search");
        assert!(schema.parameters.get("$schema").is_none());
        assert_eq!(schema.required(), vec!["q"]);
    }

    #[tokio::test]
    async fn test_failed_server_is_skipped() {
        let (connector, _) = connector(&["search"]);
        let config = BridgeConfig::default()
            .with_server("offline", server(true))
            .with_server("web", server(true));

        let bridge = McpBridge::connect(&config, &connector).await;

        assert_eq!(bridge.server_names(), vec!["web"]);
        assert_eq!(bridge.tool_count(), 1);
    }

    #[tokio::test]
    async fn test_merge_keeps_local_tools() {
        let (connector, _) = connector(&["search", "fetch"]);
        let config = BridgeConfig::default().with_server("web", server(false));
        let bridge = McpBridge::connect(&config, &connector).await;

        let registry = ToolRegistry::new();
        registry.register(FunctionTool::builder("search").handler(|_| async { Ok("local".into()) }));

        assert_eq!(registry.merge_bridge(&bridge), 1);
        assert_eq!(registry.lookup("search").unwrap().origin(), &ToolOrigin::Local);
        assert_eq!(
            registry.lookup("fetch").unwrap().origin(),
            &ToolOrigin::Bridge("web".into())
        );
        assert_eq!(registry.names(), vec!["fetch", "search"]);
    }

    #[tokio::test]
    async fn test_bridged_tool_forwards_calls() {
        let (connector, transport) = connector(&["search", "broken"]);
        let mut config = server(true);
        config.requires_approval = true;
        let bridge = McpBridge::connect(&BridgeConfig::default().with_server("web", config), &connector).await;
        let registry = ToolRegistry::new();
        registry.merge_bridge(&bridge);

        assert_eq!(registry.danger_class("web__search"), Some(DangerClass::RequiresApproval));

        let tool = registry.get("web__search").unwrap();
        let args = crate::tool::ToolCall::from_value("c1", "web__search", &json!({"q": "rust"}))
            .parse_arguments()
            .unwrap();
        assert_eq!(tool.execute(args).await.unwrap(), "search ok");
        assert_eq!(transport.calls.lock().unwrap()[0], ("search".to_string(), json!({"q": "rust"})));

        let broken = registry.get("web__broken").unwrap();
        let err = broken.execute(ToolArguments::default()).await.unwrap_err();
        assert!(err.to_string().contains("remote failure"));
    }
}
