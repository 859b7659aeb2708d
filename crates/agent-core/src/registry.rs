//! Tool Registry
//!
//! Holds the tools an agent may call, their effective danger classification,
//! and the schemas handed to the provider. Registration takes a write lock on
//! the whole table, so a concurrent lookup sees either the old or the new
//! entry, never a partial one.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{AgentError, Result};
use crate::tool::{DangerClass, Tool, ToolArguments, ToolCall, ToolSchema};

/// Where a registered tool came from
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolOrigin {
    /// Registered in-process
    Local,
    /// Forwarded to the named external tool server
    Bridge(String),
}

/// Externally configured set of tool names treated as dangerous.
///
/// Consulted once, when a tool is registered. The effective classification is
/// the stricter of the tool's own declaration and this policy.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DangerPolicy {
    /// Exact tool names
    #[serde(default)]
    pub names: BTreeSet<String>,

    /// Case-insensitive substrings matched against tool names
    #[serde(default)]
    pub patterns: Vec<String>,
}

impl DangerPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Common destructive verbs
    pub fn conventional() -> Self {
        Self {
            names: BTreeSet::new(),
            patterns: ["delete", "remove", "exec", "shell", "kill", "drop", "write"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.names.insert(name.into());
        self
    }

    #[must_use]
    pub fn with_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.patterns.push(pattern.into().to_lowercase());
        self
    }

    pub fn classify(&self, tool_name: &str) -> DangerClass {
        let lowered = tool_name.to_lowercase();
        let flagged = self.names.contains(tool_name)
            || self
                .patterns
                .iter()
                .any(|p| !p.is_empty() && lowered.contains(&p.to_lowercase()));

        if flagged {
            DangerClass::RequiresApproval
        } else {
            DangerClass::Safe
        }
    }
}

/// A tool as stored in the registry
#[derive(Clone)]
pub struct RegisteredTool {
    tool: Arc<dyn Tool>,
    schema: ToolSchema,
    origin: ToolOrigin,
}

impl RegisteredTool {
    pub fn tool(&self) -> &Arc<dyn Tool> {
        &self.tool
    }

    /// Schema with the effective danger classification applied
    pub const fn schema(&self) -> &ToolSchema {
        &self.schema
    }

    pub const fn danger(&self) -> DangerClass {
        self.schema.danger
    }

    pub const fn origin(&self) -> &ToolOrigin {
        &self.origin
    }
}

/// Registry for available tools
#[derive(Default)]
pub struct ToolRegistry {
    tools: RwLock<HashMap<String, Arc<RegisteredTool>>>,
    policy: DangerPolicy,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_policy(policy: DangerPolicy) -> Self {
        Self {
            tools: RwLock::default(),
            policy,
        }
    }

    pub const fn policy(&self) -> &DangerPolicy {
        &self.policy
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Arc<RegisteredTool>>> {
        self.tools.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Arc<RegisteredTool>>> {
        self.tools.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn entry(&self, tool: Arc<dyn Tool>, origin: ToolOrigin) -> Arc<RegisteredTool> {
        let mut schema = tool.schema();
        schema.danger = schema.danger.stricter(self.policy.classify(&schema.name));
        Arc::new(RegisteredTool { tool, schema, origin })
    }

    /// Register a new tool; an existing tool with the same name is replaced
    pub fn register<T: Tool + 'static>(&self, tool: T) {
        self.register_arc(Arc::new(tool));
    }

    /// Register a shared tool; an existing tool with the same name is replaced
    pub fn register_arc(&self, tool: Arc<dyn Tool>) {
        let entry = self.entry(tool, ToolOrigin::Local);
        let name = entry.schema.name.clone();
        let danger = entry.schema.danger;

        if let Some(previous) = self.write().insert(name.clone(), entry) {
            tracing::warn!(
                tool = %name,
                previous_origin = ?previous.origin,
                "Tool re-registered; replacing previous definition"
            );
        } else {
            tracing::debug!(tool = %name, ?danger, "Registered tool");
        }
    }

    /// Register a tool hosted by an external server.
    ///
    /// Local tools win on a name collision, and the first server to claim a
    /// name keeps it. Returns whether the tool was added.
    pub fn register_bridged(&self, server: &str, tool: Arc<dyn Tool>) -> bool {
        let entry = self.entry(tool, ToolOrigin::Bridge(server.to_string()));
        let name = entry.schema.name.clone();
        let mut tools = self.write();

        match tools.get(&name).map(|existing| existing.origin.clone()) {
            Some(ToolOrigin::Local) => {
                tracing::warn!(tool = %name, server, "Bridged tool shadowed by local tool");
                false
            }
            Some(ToolOrigin::Bridge(owner)) if owner != server => {
                tracing::warn!(tool = %name, server, owner = %owner, "Bridged tool name already claimed");
                false
            }
            _ => {
                tools.insert(name.clone(), entry);
                tracing::debug!(tool = %name, server, "Registered bridged tool");
                true
            }
        }
    }

    /// Remove a tool by name
    pub fn unregister(&self, name: &str) -> bool {
        self.write().remove(name).is_some()
    }

    /// Look up a tool together with its effective classification
    pub fn lookup(&self, name: &str) -> Option<Arc<RegisteredTool>> {
        self.read().get(name).cloned()
    }

    /// Get a tool by name
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.lookup(name).map(|entry| Arc::clone(&entry.tool))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.read().contains_key(name)
    }

    pub fn danger_class(&self, name: &str) -> Option<DangerClass> {
        self.read().get(name).map(|entry| entry.schema.danger)
    }

    /// All tool definitions, sorted by name
    pub fn definitions(&self) -> Vec<ToolSchema> {
        let mut defs: Vec<ToolSchema> = self.read().values().map(|e| e.schema.clone()).collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    /// Function-calling schemas for the provider, sorted by name
    pub fn schemas(&self) -> Vec<Value> {
        self.definitions()
            .iter()
            .map(ToolSchema::to_function_schema)
            .collect()
    }

    /// Get tool names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of registered tools
    pub fn len(&self) -> usize {
        self.read().len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Run a tool with already parsed arguments, bypassing any approval check
    pub async fn execute_parsed(&self, name: &str, args: ToolArguments) -> Result<String> {
        let entry = self
            .lookup(name)
            .ok_or_else(|| AgentError::ToolNotFound(name.to_string()))?;

        entry.tool.validate(&args)?;
        entry.tool.execute(args).await
    }

    /// Parse and run a tool call, bypassing any approval check
    pub async fn execute(&self, call: &ToolCall) -> Result<String> {
        let args = call.parse_arguments()?;
        self.execute_parsed(&call.name, args).await
    }
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.names())
            .field("policy", &self.policy)
            .finish()
    }
}
