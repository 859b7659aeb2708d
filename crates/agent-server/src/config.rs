//! Server Configuration
//!
//! Read from the process environment (after `.env` is loaded).

use std::path::PathBuf;
use std::time::Duration;

use agent_core::ApprovalPolicy;
use anyhow::Context;

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub model: String,
    pub max_iterations: usize,
    /// Gate applied to dangerous tool calls
    pub approval: ApprovalPolicy,
    /// Tool names treated as dangerous on top of the conventional verbs
    pub dangerous_tools: Vec<String>,
    pub idle_timeout: Duration,
    pub sweep_interval: Duration,
    /// JSON file describing MCP servers to bridge
    pub mcp_config: Option<PathBuf>,
    /// Directory for saved sessions; persistence is off when unset
    pub archive_dir: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:3000".into(),
            model: "llama3.2".into(),
            max_iterations: 10,
            approval: ApprovalPolicy::Deny,
            dangerous_tools: Vec::new(),
            idle_timeout: Duration::from_secs(3600),
            sweep_interval: Duration::from_secs(60),
            mcp_config: None,
            archive_dir: None,
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let defaults = Self::default();
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let secs = |key: &str, default: Duration| -> anyhow::Result<Duration> {
            var(key).map_or(Ok(default), |v| {
                v.trim()
                    .parse()
                    .map(Duration::from_secs)
                    .with_context(|| format!("{key} must be a number of seconds"))
            })
        };

        let max_iterations = match var("AGENT_MAX_ITERATIONS") {
            Some(v) => v.trim().parse().context("AGENT_MAX_ITERATIONS must be a positive integer")?,
            None => defaults.max_iterations,
        };
        let approval = match var("AGENT_APPROVAL") {
            Some(v) => v.parse()?,
            None => defaults.approval,
        };
        let dangerous_tools = var("AGENT_DANGEROUS_TOOLS")
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            bind_addr: var("BIND_ADDR").unwrap_or(defaults.bind_addr),
            model: var("AGENT_MODEL").unwrap_or(defaults.model),
            max_iterations,
            approval,
            dangerous_tools,
            idle_timeout: secs("SESSION_IDLE_TIMEOUT_SECS", defaults.idle_timeout)?,
            sweep_interval: secs("SESSION_SWEEP_INTERVAL_SECS", defaults.sweep_interval)?,
            mcp_config: var("MCP_CONFIG").map(PathBuf::from),
            archive_dir: var("SESSION_ARCHIVE_DIR").map(PathBuf::from),
        })
    }
}
