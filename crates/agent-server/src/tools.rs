//! Built-in Tools
//!
//! Local tools every agent served by this process gets.

use agent_core::tool::{FunctionTool, ParamType, ParameterSchema};
use agent_core::{AgentError, ToolRegistry};
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::json;

/// Arithmetic on two numbers
#[derive(Debug, Deserialize, JsonSchema)]
struct CalculateArgs {
    /// Left operand
    a: f64,
    /// Right operand
    b: f64,
    /// Operation to apply
    op: Operation,
}

#[derive(Clone, Copy, Debug, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
enum Operation {
    Add,
    Subtract,
    Multiply,
    Divide,
}

fn calculate(args: &CalculateArgs) -> agent_core::Result<f64> {
    match args.op {
        Operation::Add => Ok(args.a + args.b),
        Operation::Subtract => Ok(args.a - args.b),
        Operation::Multiply => Ok(args.a * args.b),
        Operation::Divide if args.b == 0.0 => Err(AgentError::ToolExecution("Division by zero".into())),
        Operation::Divide => Ok(args.a / args.b),
    }
}

pub fn calculator() -> FunctionTool {
    FunctionTool::typed("calculate", |args: CalculateArgs| async move {
        calculate(&args).map(|result| result.to_string())
    })
    .with_category("math")
}

pub fn datetime() -> FunctionTool {
    FunctionTool::builder("datetime")
        .description("Get the current date and time in UTC")
        .param(
            ParameterSchema::optional("format", ParamType::String, "Output format")
                .with_default(json!("human"))
                .with_enum(vec![json!("iso"), json!("human"), json!("unix")]),
        )
        .category("time")
        .handler(|args| async move {
            let now = chrono::Utc::now();
            match args.str("format").unwrap_or("human") {
                "iso" => Ok(now.to_rfc3339()),
                "unix" => Ok(now.timestamp().to_string()),
                "human" => Ok(now.format("%A, %B %-d, %Y at %H:%M:%S UTC").to_string()),
                other => Err(AgentError::ToolValidation(format!("Unknown format '{other}'"))),
            }
        })
}

pub fn register_builtin(registry: &ToolRegistry) {
    registry.register(datetime());
    registry.register(calculator());
}
