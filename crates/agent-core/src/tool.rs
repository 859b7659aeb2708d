//! Tool System
//!
//! Extensible tool framework for agent capabilities.
//! Tools describe themselves with a [`ToolSchema`] and are invoked by the
//! reasoning loop through the [`ToolRegistry`](crate::registry::ToolRegistry).

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::{self, BoxFuture, FutureExt};
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::error::{AgentError, Result};

/// Tool call request from the LLM
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Opaque call ID assigned by the provider
    pub id: String,

    /// Tool identifier
    pub name: String,

    /// Arguments as serialized JSON text, parsed right before dispatch
    #[serde(default)]
    pub arguments: String,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments: arguments.into(),
        }
    }

    /// Build a call from already structured arguments
    pub fn from_value(id: impl Into<String>, name: impl Into<String>, arguments: &Value) -> Self {
        Self::new(id, name, arguments.to_string())
    }

    /// Generate a unique ID for backends that do not assign one
    pub fn generate_id() -> String {
        let raw = uuid::Uuid::new_v4().simple().to_string();
        format!("call_{}", &raw[..24])
    }

    /// Parse the argument text into a key/value map
    pub fn parse_arguments(&self) -> Result<ToolArguments> {
        let text = self.arguments.trim();
        if text.is_empty() {
            return Ok(ToolArguments::default());
        }

        let malformed = |reason: String| AgentError::MalformedToolArguments {
            tool: self.name.clone(),
            reason,
        };

        match serde_json::from_str::<Value>(text).map_err(|e| malformed(e.to_string()))? {
            Value::Object(map) => Ok(ToolArguments(map)),
            Value::Null => Ok(ToolArguments::default()),
            other => Err(malformed(format!("expected a JSON object, got {other}"))),
        }
    }
}

/// Parsed tool arguments
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ToolArguments(Map<String, Value>);

impl ToolArguments {
    pub fn new(map: Map<String, Value>) -> Self {
        Self(map)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    pub fn i64(&self, key: &str) -> Option<i64> {
        self.0.get(key).and_then(Value::as_i64)
    }

    pub fn f64(&self, key: &str) -> Option<f64> {
        self.0.get(key).and_then(Value::as_f64)
    }

    pub fn bool(&self, key: &str) -> Option<bool> {
        self.0.get(key).and_then(Value::as_bool)
    }

    pub fn require_str(&self, key: &str) -> Result<&str> {
        self.str(key).ok_or_else(|| missing(key, "string"))
    }

    pub fn require_i64(&self, key: &str) -> Result<i64> {
        self.i64(key).ok_or_else(|| missing(key, "integer"))
    }

    pub fn require_f64(&self, key: &str) -> Result<f64> {
        self.f64(key).ok_or_else(|| missing(key, "number"))
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }
}

fn missing(key: &str, kind: &str) -> AgentError {
    AgentError::ToolValidation(format!("Missing or non-{kind} parameter: {key}"))
}

/// Result from tool execution
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolResult {
    /// Tool that was called
    pub name: String,

    /// Call ID this result answers
    pub id: String,

    /// Whether execution succeeded
    pub success: bool,

    /// Output (success message or error)
    pub output: String,
}

impl ToolResult {
    pub fn success(call: &ToolCall, output: impl Into<String>) -> Self {
        Self {
            name: call.name.clone(),
            id: call.id.clone(),
            success: true,
            output: output.into(),
        }
    }

    pub fn failure(call: &ToolCall, error: impl Into<String>) -> Self {
        Self {
            name: call.name.clone(),
            id: call.id.clone(),
            success: false,
            output: error.into(),
        }
    }

    /// Convert into the tool message that is appended to the session
    pub fn into_message(self) -> crate::message::Message {
        let content = if self.success {
            self.output
        } else {
            format!("Error: {}", self.output)
        };
        crate::message::Message::tool(self.id, self.name, content)
    }
}

/// Whether a tool needs external confirmation before running
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DangerClass {
    #[default]
    Safe,
    RequiresApproval,
}

impl DangerClass {
    /// The stricter of two classifications
    #[must_use]
    pub fn stricter(self, other: Self) -> Self {
        self.max(other)
    }
}

/// JSON Schema primitive types accepted for tool parameters
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    String,
    Integer,
    Number,
    Boolean,
    Array,
    Object,
}

impl ParamType {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Integer => "integer",
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::Array => "array",
            Self::Object => "object",
        }
    }
}

/// Parameter definition for tool schema
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ParameterSchema {
    /// Parameter name
    pub name: String,

    /// JSON Schema type
    #[serde(rename = "type")]
    pub param_type: ParamType,

    /// Human-readable description
    pub description: String,

    /// Whether this parameter is required
    #[serde(default)]
    pub required: bool,

    /// Default value if not provided
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,

    /// Enum of allowed values
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enum_values: Option<Vec<Value>>,
}

impl ParameterSchema {
    pub fn required(name: impl Into<String>, param_type: ParamType, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            param_type,
            description: description.into(),
            required: true,
            default: None,
            enum_values: None,
        }
    }

    pub fn optional(name: impl Into<String>, param_type: ParamType, description: impl Into<String>) -> Self {
        Self {
            required: false,
            ..Self::required(name, param_type, description)
        }
    }

    /// Attach a default; a parameter with a default is never required
    #[must_use]
    pub fn with_default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self.required = false;
        self
    }

    #[must_use]
    pub fn with_enum(mut self, values: Vec<Value>) -> Self {
        self.enum_values = Some(values);
        self
    }

    fn to_property(&self) -> Value {
        let mut prop = Map::new();
        prop.insert("type".into(), json!(self.param_type.as_str()));
        prop.insert("description".into(), json!(self.description));
        if let Some(default) = &self.default {
            prop.insert("default".into(), default.clone());
        }
        if let Some(values) = &self.enum_values {
            prop.insert("enum".into(), Value::Array(values.clone()));
        }
        Value::Object(prop)
    }
}

/// Build a JSON Schema `object` from parameter definitions
pub fn object_schema(parameters: &[ParameterSchema]) -> Value {
    let properties: Map<String, Value> = parameters
        .iter()
        .map(|p| (p.name.clone(), p.to_property()))
        .collect();
    let required: Vec<&str> = parameters
        .iter()
        .filter(|p| p.required)
        .map(|p| p.name.as_str())
        .collect();

    json!({
        "type": "object",
        "properties": properties,
        "required": required,
    })
}

/// Immutable tool description handed to providers
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolSchema {
    /// Unique tool identifier
    pub name: String,

    /// Human-readable description (shown to LLM)
    pub description: String,

    /// JSON Schema of the accepted arguments (an `object` schema)
    pub parameters: Value,

    /// Approval requirement
    #[serde(default)]
    pub danger: DangerClass,

    /// Category for grouping
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
}

impl ToolSchema {
    pub fn new(name: impl Into<String>, description: impl Into<String>, parameters: Value) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
            danger: DangerClass::Safe,
            category: None,
        }
    }

    /// Names listed in the schema's `required` array
    pub fn required(&self) -> Vec<String> {
        self.parameters
            .get("required")
            .and_then(Value::as_array)
            .map(|names| {
                names
                    .iter()
                    .filter_map(Value::as_str)
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Function-calling schema in the interchange shape providers expect
    pub fn to_function_schema(&self) -> Value {
        json!({
            "type": "function",
            "function": {
                "name": self.name,
                "description": self.description,
                "parameters": self.parameters,
            }
        })
    }
}

/// Tool trait - implement to add new capabilities
#[async_trait]
pub trait Tool: Send + Sync {
    /// Get the tool's schema for LLM function calling
    fn schema(&self) -> ToolSchema;

    /// Execute the tool with parsed arguments
    async fn execute(&self, args: ToolArguments) -> Result<String>;

    /// Validate arguments before execution (optional)
    fn validate(&self, args: &ToolArguments) -> Result<()> {
        for name in self.schema().required() {
            if !args.contains(&name) {
                return Err(AgentError::ToolValidation(format!(
                    "Missing required parameter: {name}"
                )));
            }
        }
        Ok(())
    }
}

type Handler = Arc<dyn Fn(ToolArguments) -> BoxFuture<'static, Result<String>> + Send + Sync>;

/// A tool backed by an async closure.
///
/// Built either by hand through [`FunctionTool::builder`] or from a typed
/// argument struct through [`FunctionTool::typed`], which derives the
/// parameter schema once, at construction time.
#[derive(Clone)]
pub struct FunctionTool {
    schema: ToolSchema,
    handler: Handler,
}

impl std::fmt::Debug for FunctionTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionTool")
            .field("schema", &self.schema)
            .finish_non_exhaustive()
    }
}

impl FunctionTool {
    pub fn builder(name: impl Into<String>) -> FunctionToolBuilder {
        FunctionToolBuilder {
            name: name.into(),
            description: String::new(),
            parameters: Vec::new(),
            danger: DangerClass::Safe,
            category: None,
        }
    }

    /// Create a tool whose arguments deserialize into `A`.
    ///
    /// The description defaults to the doc comment on `A`; required
    /// parameters are the fields that are neither `Option` nor `#[serde(default)]`.
    pub fn typed<A, F, Fut>(name: impl Into<String>, handler: F) -> Self
    where
        A: JsonSchema + DeserializeOwned + Send + 'static,
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<String>> + Send + 'static,
    {
        let name = name.into();
        let (parameters, description) = derive_parameters::<A>();
        let tool_name = name.clone();

        let handler: Handler = Arc::new(move |args: ToolArguments| {
            match serde_json::from_value::<A>(args.into_value()) {
                Ok(parsed) => handler(parsed).boxed(),
                Err(e) => future::ready(Err(AgentError::ToolValidation(format!(
                    "Invalid arguments for '{tool_name}': {e}"
                ))))
                .boxed(),
            }
        });

        Self {
            schema: ToolSchema::new(name, description.unwrap_or_default(), parameters),
            handler,
        }
    }

    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.schema.description = description.into();
        self
    }

    #[must_use]
    pub fn with_danger(mut self, danger: DangerClass) -> Self {
        self.schema.danger = danger;
        self
    }

    #[must_use]
    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.schema.category = Some(category.into());
        self
    }
}

#[async_trait]
impl Tool for FunctionTool {
    fn schema(&self) -> ToolSchema {
        self.schema.clone()
    }

    async fn execute(&self, args: ToolArguments) -> Result<String> {
        (self.handler)(args).await
    }
}

/// Builder for hand-described [`FunctionTool`]s
pub struct FunctionToolBuilder {
    name: String,
    description: String,
    parameters: Vec<ParameterSchema>,
    danger: DangerClass,
    category: Option<String>,
}

impl FunctionToolBuilder {
    #[must_use]
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    #[must_use]
    pub fn param(mut self, parameter: ParameterSchema) -> Self {
        self.parameters.push(parameter);
        self
    }

    #[must_use]
    pub const fn danger(mut self, danger: DangerClass) -> Self {
        self.danger = danger;
        self
    }

    #[must_use]
    pub const fn requires_approval(self) -> Self {
        self.danger(DangerClass::RequiresApproval)
    }

    #[must_use]
    pub fn category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn handler<F, Fut>(self, handler: F) -> FunctionTool
    where
        F: Fn(ToolArguments) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<String>> + Send + 'static,
    {
        FunctionTool {
            schema: ToolSchema {
                name: self.name,
                description: self.description,
                parameters: object_schema(&self.parameters),
                danger: self.danger,
                category: self.category,
            },
            handler: Arc::new(move |args| handler(args).boxed()),
        }
    }
}

/// Derive an `object` parameter schema (and the type's doc comment) from `A`
fn derive_parameters<A: JsonSchema>() -> (Value, Option<String>) {
    // Inline nested types so providers get one self-contained schema
    let root = schemars::r#gen::SchemaSettings::draft07()
        .with(|settings| settings.inline_subschemas = true)
        .into_generator()
        .into_root_schema_for::<A>();
    let mut value = serde_json::to_value(&root).unwrap_or_else(|_| json!({}));

    let Some(obj) = value.as_object_mut() else {
        return (object_schema(&[]), None);
    };
    obj.remove("$schema");
    obj.remove("title");
    let description = obj
        .remove("description")
        .and_then(|d| d.as_str().map(str::to_string));
    obj.entry("type").or_insert_with(|| json!("object"));
    obj.entry("properties").or_insert_with(|| json!({}));
    obj.entry("required").or_insert_with(|| json!([]));

    (value, description)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Add two integers together.
    #[derive(Deserialize, JsonSchema)]
    #[allow(dead_code)]
    struct AddArgs {
        /// First addend
        a: i64,
        /// Second addend
        b: i64,
        /// Optional multiplier
        scale: Option<i64>,
    }

    fn add_tool() -> FunctionTool {
        FunctionTool::typed("add", |args: AddArgs| async move {
            Ok((args.a + args.b).to_string())
        })
    }

    #[test]
    fn test_parse_arguments() {
        let call = ToolCall::new("c1", "add", r#"{"a": 2, "b": 3}"#);
        let args = call.parse_arguments().unwrap();
        assert_eq!(args.i64("a"), Some(2));

        let empty = ToolCall::new("c2", "now", "  ");
        assert!(empty.parse_arguments().unwrap().as_map().is_empty());
    }

    #[test]
    fn test_parse_arguments_malformed() {
        let call = ToolCall::new("c1", "add", "{a: 2");
        assert!(matches!(
            call.parse_arguments(),
            Err(AgentError::MalformedToolArguments { ref tool, .. }) if tool == "add"
        ));

        let not_object = ToolCall::new("c2", "add", "[1, 2]");
        assert!(not_object.parse_arguments().is_err());
    }

    #[test]
    fn test_generated_ids_are_unique() {
        let a = ToolCall::generate_id();
        let b = ToolCall::generate_id();
        assert!(a.starts_with("call_"));
        assert_ne!(a, b);
    }

    #[test]
    fn test_builder_schema_shape() {
        let tool = FunctionTool::builder("search")
            .description("Search the web")
            .param(ParameterSchema::required("query", ParamType::String, "Search terms"))
            .param(
                ParameterSchema::optional("limit", ParamType::Integer, "Max results")
                    .with_default(json!(5)),
            )
            .handler(|_args| async { Ok("nothing".to_string()) });

        let schema = tool.schema().to_function_schema();
        assert_eq!(schema["type"], "function");
        assert_eq!(schema["function"]["name"], "search");
        assert_eq!(schema["function"]["parameters"]["type"], "object");
        assert_eq!(
            schema["function"]["parameters"]["properties"]["query"]["type"],
            "string"
        );
        assert_eq!(schema["function"]["parameters"]["properties"]["limit"]["default"], 5);
        assert_eq!(schema["function"]["parameters"]["required"], json!(["query"]));
    }

    #[test]
    fn test_typed_schema_derivation() {
        let schema = add_tool().schema();
        assert_eq!(schema.description, "Add two integers together.");
        assert_eq!(schema.required(), vec!["a".to_string(), "b".to_string()]);
        assert_eq!(schema.parameters["properties"]["a"]["type"], "integer");
        assert_eq!(schema.parameters["properties"]["a"]["description"], "First addend");
        assert!(schema.parameters.get("$schema").is_none());
        assert!(schema.parameters.get("title").is_none());
    }

    #[test]
    fn test_schema_generation_is_idempotent() {
        let first = add_tool().schema().to_function_schema();
        let second = add_tool().schema().to_function_schema();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_typed_execution() {
        let tool = add_tool();
        let args = ToolCall::new("c1", "add", r#"{"a": 2, "b": 3}"#)
            .parse_arguments()
            .unwrap();
        assert!(tool.validate(&args).is_ok());
        assert_eq!(tool.execute(args).await.unwrap(), "5");
    }

    #[tokio::test]
    async fn test_typed_rejects_wrong_types() {
        let tool = add_tool();
        let args = ToolCall::new("c1", "add", r#"{"a": "two", "b": 3}"#)
            .parse_arguments()
            .unwrap();
        assert!(matches!(
            tool.execute(args).await,
            Err(AgentError::ToolValidation(_))
        ));
    }

    #[test]
    fn test_validate_missing_required() {
        let tool = add_tool();
        let args = ToolCall::new("c1", "add", r#"{"a": 2}"#).parse_arguments().unwrap();
        assert!(tool.validate(&args).is_err());
    }

    #[test]
    fn test_failure_result_message() {
        let call = ToolCall::new("c9", "add", "{}");
        let msg = ToolResult::failure(&call, "boom").into_message();
        assert_eq!(msg.tool_call_id.as_deref(), Some("c9"));
        assert_eq!(msg.content, "Error: boom");
    }

    #[test]
    fn test_danger_stricter() {
        assert_eq!(
            DangerClass::Safe.stricter(DangerClass::RequiresApproval),
            DangerClass::RequiresApproval
        );
        assert_eq!(DangerClass::Safe.stricter(DangerClass::Safe), DangerClass::Safe);
    }
}
