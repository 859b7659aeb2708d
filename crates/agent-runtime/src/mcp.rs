//! Stdio MCP Transport
//!
//! JSON-RPC 2.0 over a child process's stdin/stdout, one message per line.
//! Plugs into the core bridge through [`StdioConnector`].

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use agent_core::bridge::{McpConnector, McpServerConfig, McpTransport, RemoteTool};
use agent_core::error::{AgentError, Result};
use anyhow::{anyhow, bail, Context};
use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;

/// Largest JSON-RPC response line accepted from a server
const MAX_RESPONSE_BYTES: usize = 512 * 1024;

/// Deadline for one request/response round-trip
const RPC_TIMEOUT: Duration = Duration::from_secs(60);

/// Deadline for the `initialize` handshake
const INIT_TIMEOUT: Duration = Duration::from_secs(30);

const PROTOCOL_VERSION: &str = "2024-11-05";

/// Host environment variables forwarded to server processes.
/// Everything else is dropped so credentials do not leak into tool servers.
const SAFE_ENV_KEYS: &[&str] = &[
    "PATH",
    "HOME",
    "USER",
    "LANG",
    "LC_ALL",
    "LC_CTYPE",
    "TERM",
    "SHELL",
    "TMPDIR",
    "TMP",
    "TEMP",
    "XDG_RUNTIME_DIR",
    "XDG_DATA_HOME",
    "XDG_CONFIG_HOME",
    "XDG_CACHE_HOME",
    // Node-based servers need these to find global packages
    "NODE_PATH",
    "NPM_CONFIG_PREFIX",
    "NVM_DIR",
];

/// Allowlisted host variables plus the server's own configured env
fn scrubbed_env(
    host: impl IntoIterator<Item = (String, String)>,
    extra: &HashMap<String, String>,
) -> HashMap<String, String> {
    let mut env: HashMap<String, String> = host
        .into_iter()
        .filter(|(key, _)| SAFE_ENV_KEYS.contains(&key.as_str()))
        .collect();
    env.extend(extra.iter().map(|(k, v)| (k.clone(), v.clone())));
    env
}

/// Join the text blocks of a `tools/call` result
fn call_result_text(result: &Value) -> anyhow::Result<String> {
    let text = result["content"].as_array().map_or_else(
        || result.to_string(),
        |blocks| {
            blocks
                .iter()
                .filter_map(|block| block["text"].as_str())
                .collect::<Vec<_>>()
                .join("\n")
        },
    );

    if result["isError"].as_bool().unwrap_or(false) {
        bail!("{text}");
    }
    Ok(text)
}

fn parse_tool_list(result: &Value) -> Vec<RemoteTool> {
    result["tools"]
        .as_array()
        .map(|tools| {
            tools
                .iter()
                .filter_map(|tool| match serde_json::from_value::<RemoteTool>(tool.clone()) {
                    Ok(remote) => Some(remote),
                    Err(e) => {
                        tracing::warn!(error = %e, "Skipping malformed MCP tool definition");
                        None
                    }
                })
                .collect()
        })
        .unwrap_or_default()
}

struct Pipes {
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

/// JSON-RPC client for one MCP server process
pub struct StdioMcpClient {
    server: String,
    pipes: Mutex<Pipes>,
    child: Mutex<Child>,
    next_id: AtomicU64,
}

impl StdioMcpClient {
    /// Spawn the server process and complete the `initialize` handshake
    pub async fn spawn(server: &str, config: &McpServerConfig) -> anyhow::Result<Self> {
        let env = scrubbed_env(std::env::vars(), &config.env);

        let mut child = Command::new(&config.command)
            .args(&config.args)
            .env_clear()
            .envs(env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn MCP server '{server}' ({})", config.command))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("Failed to capture MCP server stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("Failed to capture MCP server stdout"))?;

        // Forward stderr so server-side failures show up in our logs
        if let Some(stderr) = child.stderr.take() {
            let name = server.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if !line.trim().is_empty() {
                        tracing::warn!(mcp_server = %name, "{}", line.trim_end());
                    }
                }
            });
        }

        let client = Self {
            server: server.to_string(),
            pipes: Mutex::new(Pipes {
                stdin,
                stdout: BufReader::new(stdout),
            }),
            child: Mutex::new(child),
            next_id: AtomicU64::new(1),
        };

        tokio::time::timeout(
            INIT_TIMEOUT,
            client.round_trip(
                "initialize",
                json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": {},
                    "clientInfo": {
                        "name": env!("CARGO_PKG_NAME"),
                        "version": env!("CARGO_PKG_VERSION"),
                    }
                }),
            ),
        )
        .await
        .map_err(|_| anyhow!("MCP server '{server}' initialization timed out after {INIT_TIMEOUT:?}"))??;

        client.notify("notifications/initialized", json!({})).await?;
        tracing::debug!(mcp_server = %server, "MCP handshake complete");

        Ok(client)
    }

    /// Send a request and wait for its response
    pub async fn request(&self, method: &str, params: Value) -> anyhow::Result<Value> {
        tokio::time::timeout(RPC_TIMEOUT, self.round_trip(method, params))
            .await
            .map_err(|_| anyhow!("MCP call '{method}' timed out after {RPC_TIMEOUT:?}"))?
    }

    async fn round_trip(&self, method: &str, params: Value) -> anyhow::Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let request = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });

        // Holding the pipes for the whole exchange keeps concurrent calls from
        // reading each other's responses
        let mut pipes = self.pipes.lock().await;
        write_line(&mut pipes.stdin, &request).await?;

        loop {
            let mut line = String::new();
            let read = pipes.stdout.read_line(&mut line).await?;
            if read == 0 {
                bail!("MCP server '{}' closed stdout", self.server);
            }
            if line.len() > MAX_RESPONSE_BYTES {
                bail!(
                    "MCP response exceeded size limit ({} > {MAX_RESPONSE_BYTES} bytes)",
                    line.len()
                );
            }
            if line.trim().is_empty() {
                continue;
            }

            let message: Value = serde_json::from_str(&line).context("Invalid JSON-RPC message")?;
            // Server notifications and stale responses carry no matching id
            if message["id"].as_u64() != Some(id) {
                tracing::trace!(mcp_server = %self.server, "Ignoring unrelated MCP message");
                continue;
            }
            if let Some(error) = message.get("error") {
                bail!("MCP error: {error}");
            }
            return Ok(message["result"].clone());
        }
    }

    async fn notify(&self, method: &str, params: Value) -> anyhow::Result<()> {
        let notification = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
        });
        let mut pipes = self.pipes.lock().await;
        write_line(&mut pipes.stdin, &notification).await
    }

    pub async fn list_tools(&self) -> anyhow::Result<Vec<RemoteTool>> {
        let result = self.request("tools/list", json!({})).await?;
        Ok(parse_tool_list(&result))
    }

    pub async fn call_tool(&self, name: &str, arguments: Value) -> anyhow::Result<String> {
        let result = self
            .request("tools/call", json!({"name": name, "arguments": arguments}))
            .await?;
        call_result_text(&result)
    }

    /// Terminate the server process
    pub async fn shutdown(&self) {
        let mut child = self.child.lock().await;
        if let Err(e) = child.kill().await {
            tracing::debug!(mcp_server = %self.server, error = %e, "MCP server already exited");
        }
    }
}

async fn write_line(stdin: &mut ChildStdin, message: &Value) -> anyhow::Result<()> {
    let mut line = serde_json::to_string(message)?;
    line.push('\n');
    stdin.write_all(line.as_bytes()).await?;
    stdin.flush().await?;
    Ok(())
}

fn bridge_error(e: &anyhow::Error) -> AgentError {
    AgentError::Bridge(format!("{e:#}"))
}

#[async_trait]
impl McpTransport for StdioMcpClient {
    async fn list_tools(&self) -> Result<Vec<RemoteTool>> {
        Self::list_tools(self).await.map_err(|e| bridge_error(&e))
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<String> {
        Self::call_tool(self, name, arguments).await.map_err(|e| bridge_error(&e))
    }

    async fn shutdown(&self) {
        Self::shutdown(self).await;
    }
}

/// Spawns a [`StdioMcpClient`] per configured server
#[derive(Clone, Copy, Debug, Default)]
pub struct StdioConnector;

#[async_trait]
impl McpConnector for StdioConnector {
    async fn connect(&self, server: &str, config: &McpServerConfig) -> Result<Arc<dyn McpTransport>> {
        let client = StdioMcpClient::spawn(server, config)
            .await
            .map_err(|e| bridge_error(&e))?;
        Ok(Arc::new(client))
    }
}
