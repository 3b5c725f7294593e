//! Tool Registry - Tool Discovery and Dispatch
//!
//! Maintains the list of available tools and dispatches calls by name.

use super::*;
use std::collections::BTreeMap;
use tracing::debug;

/// Registry of available MCP tools
pub struct ToolRegistry {
    tools: BTreeMap<&'static str, Box<dyn McpTool>>,
}

impl ToolRegistry {
    /// Create a new tool registry with all tools registered
    pub fn new() -> Self {
        let mut registry = Self {
            tools: BTreeMap::new(),
        };

        registry.register(Box::new(InformationSchemaTool));
        registry.register(Box::new(ValidateSqlQueryTool));
        registry.register(Box::new(ExecuteQueryTool));

        debug!("Registered {} tools", registry.tools.len());

        registry
    }

    fn register(&mut self, tool: Box<dyn McpTool>) {
        debug!("Registering tool: {}", tool.name());
        self.tools.insert(tool.name(), tool);
    }

    /// List all available tools, sorted by name
    pub fn list_tools(&self) -> Vec<ToolDefinition> {
        self.tools.values().map(|t| t.definition()).collect()
    }

    /// Call a tool by name
    pub async fn call_tool(
        &self,
        name: &str,
        gateway: &Gateway,
        ctx: &RequestContext,
        args: Value,
    ) -> Result<Value, GatewayError> {
        let tool = self
            .get_tool(name)
            .ok_or_else(|| GatewayError::UnknownTool(name.to_string()))?;

        tool.call(gateway, ctx, args).await
    }

    /// Get a tool by name
    pub fn get_tool(&self, name: &str) -> Option<&dyn McpTool> {
        self.tools.get(name).map(|t| t.as_ref())
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}
