//! MCP Tool Implementations
//!
//! The three gateway operations, exposed as MCP tools and dispatched by name.
//! The same tools back the direct JSON-RPC methods of the same name.

mod execute;
mod registry;
mod schema;
mod validate;

pub use execute::ExecuteQueryTool;
pub use registry::ToolRegistry;
pub use schema::InformationSchemaTool;
pub use validate::ValidateSqlQueryTool;

use crate::audit::Operation;
use crate::error::GatewayError;
use crate::gateway::{Gateway, RequestContext};
use crate::protocol::ToolDefinition;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

/// Trait for MCP tools
#[async_trait]
pub trait McpTool: Send + Sync {
    /// Tool name (e.g., "execute_query")
    fn name(&self) -> &'static str;

    /// Human-readable description
    fn description(&self) -> &'static str;

    /// JSON Schema for input parameters
    fn input_schema(&self) -> Value;

    /// Run the tool. `Ok` carries the result payload.
    async fn call(
        &self,
        gateway: &Gateway,
        ctx: &RequestContext,
        args: Value,
    ) -> Result<Value, GatewayError>;

    /// Get the tool definition for tools/list
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            input_schema: self.input_schema(),
        }
    }
}

/// `{ sql }` arguments shared by validate and execute.
#[derive(Debug, Deserialize)]
struct SqlArgs {
    sql: String,
}

fn sql_input_schema(what: &str) -> Value {
    json!({
        "type": "object",
        "properties": {
            "sql": {
                "type": "string",
                "description": what
            }
        },
        "required": ["sql"]
    })
}

/// Decode `{ sql }`; a failure is audited against `operation`.
fn parse_sql_args(
    gateway: &Gateway,
    ctx: &RequestContext,
    operation: Operation,
    args: Value,
) -> Result<String, GatewayError> {
    serde_json::from_value::<SqlArgs>(args)
        .map(|args| args.sql)
        .map_err(|e| gateway.reject_params(ctx, operation, format!("expected {{\"sql\": string}}: {}", e)))
}

fn to_payload<T: serde::Serialize>(value: &T) -> Result<Value, GatewayError> {
    serde_json::to_value(value).map_err(|e| GatewayError::InvalidParams(e.to_string()))
}
