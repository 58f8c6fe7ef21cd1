//! Tool registry - central lookup and execution of registered tools

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::{MuxError, Result};

use super::{Tool, ToolContext};

/// Definition of a tool as presented to the decision policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// The name of the tool (must be unique)
    pub name: String,
    /// Human-readable description of what the tool does
    pub description: String,
    /// JSON Schema describing the tool's parameters
    pub parameters: Value,
}

/// Central registry for managing and executing tools.
///
/// # Example
/// ```
/// use kernelmux::tools::{EchoTool, ToolContext, ToolRegistry};
/// use serde_json::json;
///
/// # tokio_test::block_on(async {
/// let mut registry = ToolRegistry::new();
/// registry.register(Box::new(EchoTool));
///
/// let result = registry
///     .execute("echo", json!({"message": "Hi"}), &ToolContext::new())
///     .await;
/// assert_eq!(result.unwrap(), "Hi");
/// # });
/// ```
#[derive(Default)]
pub struct ToolRegistry {
    tools: Vec<Box<dyn Tool>>,
}

impl ToolRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a tool. A tool with the same name replaces the earlier
    /// registration.
    pub fn register(&mut self, tool: Box<dyn Tool>) {
        debug!(tool = tool.name(), "tool registered");
        self.tools.retain(|t| t.name() != tool.name());
        self.tools.push(tool);
    }

    /// Returns true if a tool with this name is registered.
    pub fn has(&self, name: &str) -> bool {
        self.tools.iter().any(|t| t.name() == name)
    }

    /// Number of registered tools.
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Returns true when no tools are registered.
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Names of all registered tools, in registration order.
    pub fn names(&self) -> Vec<&str> {
        self.tools.iter().map(|t| t.name()).collect()
    }

    /// Definitions of all registered tools, for the policy's prompt.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools
            .iter()
            .map(|t| ToolDefinition {
                name: t.name().to_string(),
                description: t.description().to_string(),
                parameters: t.parameters(),
            })
            .collect()
    }

    /// Executes the named tool.
    ///
    /// # Errors
    /// [`MuxError::NotFound`] if no tool with this name is registered, or
    /// whatever error the tool itself returns.
    pub async fn execute(&self, name: &str, args: Value, ctx: &ToolContext) -> Result<String> {
        let tool = self
            .tools
            .iter()
            .find(|t| t.name() == name)
            .ok_or_else(|| MuxError::NotFound(format!("tool '{}'", name)))?;
        tool.execute(args, ctx).await
    }
}
