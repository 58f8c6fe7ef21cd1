//! Tools module - Tool definitions and execution for the agent loop
//!
//! Tools are the actions the decision policy can take during ACT. They run
//! against a [`ToolContext`] that carries handles to the broker's moving
//! parts: the exchange correlator (for tools that execute code on the
//! backend), the decision policy (for tools that make side queries), the
//! dataset store, and the loop control flag a tool can flip to make its own
//! output the loop's final answer.
//!
//! # Built-in Tools
//!
//! - `EchoTool`: Simple echo tool for testing
//! - `DatasetInfoTool`: Profile the loaded dataset
//! - `GenerateCodeTool`: Produce a notebook code cell for the user's request
//! - `RunCodeTool`: Execute code on the backend and return its output
//! - `RepairCodeTool`: Rewrite broken code given the error it produced

pub mod dataset;
mod registry;
pub mod repair;
pub mod run_code;

pub use dataset::{DatasetInfoTool, DatasetMeta, DatasetStore, GenerateCodeTool};
pub use registry::{ToolDefinition, ToolRegistry};
pub use repair::RepairCodeTool;
pub use run_code::RunCodeTool;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;

use crate::agent::DecisionPolicy;
use crate::error::{MuxError, Result};
use crate::exchange::ExchangeCorrelator;

/// Trait that all tools must implement.
///
/// # Example
///
/// ```rust
/// use async_trait::async_trait;
/// use serde_json::Value;
/// use kernelmux::tools::{Tool, ToolContext};
/// use kernelmux::error::Result;
///
/// struct MyTool;
///
/// #[async_trait]
/// impl Tool for MyTool {
///     fn name(&self) -> &str { "my_tool" }
///     fn description(&self) -> &str { "Does something useful" }
///     fn parameters(&self) -> Value {
///         serde_json::json!({
///             "type": "object",
///             "properties": {},
///             "required": []
///         })
///     }
///     async fn execute(&self, _args: Value, _ctx: &ToolContext) -> Result<String> {
///         Ok("Done!".to_string())
///     }
/// }
/// ```
#[async_trait]
pub trait Tool: Send + Sync {
    /// The tool name the policy uses to request it. Unique within a registry.
    fn name(&self) -> &str;

    /// Description shown to the policy so it knows when to use the tool.
    fn description(&self) -> &str;

    /// JSON Schema for the tool's arguments.
    fn parameters(&self) -> Value;

    /// Executes the tool. The returned string becomes the turn's observation
    /// (or, when the tool stops the loop, the loop's final answer).
    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<String>;
}

/// Flag a tool flips to end the loop with its own output as the answer.
#[derive(Debug, Clone, Default)]
pub struct LoopControl {
    stopped: Arc<AtomicBool>,
}

impl LoopControl {
    /// Creates a fresh (not stopped) control.
    pub fn new() -> Self {
        Self::default()
    }

    /// Signals that the loop should terminate successfully after this ACT,
    /// using the tool's output as the final answer.
    pub fn stop_success(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    /// Returns true once a tool has signalled completion.
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

/// Context provided to tools during execution.
///
/// All handles are optional so tools can be exercised in isolation; a tool
/// that needs a missing handle fails with a tool error rather than
/// panicking.
#[derive(Clone, Default)]
pub struct ToolContext {
    /// Correlator for tools that execute code on the backend
    pub correlator: Option<Arc<ExchangeCorrelator>>,
    /// Policy handle for tools that make side queries
    pub policy: Option<Arc<dyn DecisionPolicy>>,
    /// The loaded dataset, if any
    pub dataset: Option<DatasetStore>,
    /// Loop completion flag
    pub loop_control: LoopControl,
}

impl ToolContext {
    /// Creates an empty context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attaches the exchange correlator (builder pattern).
    pub fn with_correlator(mut self, correlator: Arc<ExchangeCorrelator>) -> Self {
        self.correlator = Some(correlator);
        self
    }

    /// Attaches the decision policy (builder pattern).
    pub fn with_policy(mut self, policy: Arc<dyn DecisionPolicy>) -> Self {
        self.policy = Some(policy);
        self
    }

    /// Attaches the dataset store (builder pattern).
    pub fn with_dataset(mut self, dataset: DatasetStore) -> Self {
        self.dataset = Some(dataset);
        self
    }

    /// The correlator, or a tool error when none is attached.
    pub fn correlator(&self) -> Result<&Arc<ExchangeCorrelator>> {
        self.correlator
            .as_ref()
            .ok_or_else(|| MuxError::Tool("no compute backend attached".to_string()))
    }

    /// The policy, or a tool error when none is attached.
    pub fn policy(&self) -> Result<&Arc<dyn DecisionPolicy>> {
        self.policy
            .as_ref()
            .ok_or_else(|| MuxError::Tool("no decision policy attached".to_string()))
    }

    /// The dataset store, or a tool error when none is attached.
    pub fn dataset(&self) -> Result<&DatasetStore> {
        self.dataset
            .as_ref()
            .ok_or_else(|| MuxError::Tool("no dataset attached".to_string()))
    }
}

/// Extracts the first fenced code block from model output.
///
/// The opening fence may carry a language tag; the block body is returned
/// without the fences.
pub(crate) fn extract_fenced_code(text: &str) -> Option<String> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        Regex::new(r"(?s)```[A-Za-z0-9_+-]*\r?\n(.*?)```").expect("fence regex")
    });
    re.captures(text)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

/// A simple echo tool for testing purposes.
///
/// # Example
///
/// ```rust
/// use kernelmux::tools::{Tool, ToolContext, EchoTool};
/// use serde_json::json;
///
/// # tokio_test::block_on(async {
/// let tool = EchoTool;
/// let ctx = ToolContext::new();
/// let result = tool.execute(json!({"message": "Hello"}), &ctx).await;
/// assert_eq!(result.unwrap(), "Hello");
/// # });
/// ```
pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Echoes back the provided message"
    }

    fn parameters(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "message": {
                    "type": "string",
                    "description": "The message to echo"
                }
            },
            "required": ["message"]
        })
    }

    async fn execute(&self, args: Value, _ctx: &ToolContext) -> Result<String> {
        let message = args
            .get("message")
            .and_then(|v| v.as_str())
            .unwrap_or("(no message)");
        Ok(message.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_echo_tool_metadata() {
        let tool = EchoTool;
        assert_eq!(tool.name(), "echo");
        assert_eq!(tool.parameters()["properties"]["message"]["type"], "string");
    }

    #[tokio::test]
    async fn test_echo_tool_execute() {
        let tool = EchoTool;
        let ctx = ToolContext::new();
        let result = tool.execute(json!({"message": "Hello, World!"}), &ctx).await;
        assert_eq!(result.unwrap(), "Hello, World!");
    }

    #[tokio::test]
    async fn test_echo_tool_no_message() {
        let tool = EchoTool;
        let ctx = ToolContext::new();
        let result = tool.execute(json!({}), &ctx).await;
        assert_eq!(result.unwrap(), "(no message)");
    }

    #[test]
    fn test_loop_control_starts_running() {
        let control = LoopControl::new();
        assert!(!control.is_stopped());
        control.stop_success();
        assert!(control.is_stopped());
    }

    #[test]
    fn test_loop_control_clone_shares_flag() {
        let control = LoopControl::new();
        let alias = control.clone();
        alias.stop_success();
        assert!(control.is_stopped());
    }

    #[test]
    fn test_tool_context_missing_handles_error() {
        let ctx = ToolContext::new();
        assert!(matches!(ctx.correlator(), Err(MuxError::Tool(_))));
        assert!(matches!(ctx.policy(), Err(MuxError::Tool(_))));
        assert!(matches!(ctx.dataset(), Err(MuxError::Tool(_))));
    }

    #[test]
    fn test_extract_fenced_code_plain() {
        let text = "Here you go:\n```\nprint(1)\n```\nEnjoy.";
        assert_eq!(extract_fenced_code(text).unwrap(), "print(1)\n");
    }

    #[test]
    fn test_extract_fenced_code_with_language() {
        let text = "```python\ndf.describe()\n```";
        assert_eq!(extract_fenced_code(text).unwrap(), "df.describe()\n");
    }

    #[test]
    fn test_extract_fenced_code_multiline() {
        let text = "```python\nimport pandas as pd\ndf = df.dropna()\n```";
        assert_eq!(
            extract_fenced_code(text).unwrap(),
            "import pandas as pd\ndf = df.dropna()\n"
        );
    }

    #[test]
    fn test_extract_fenced_code_takes_first_block() {
        let text = "```\nfirst\n```\nand\n```\nsecond\n```";
        assert_eq!(extract_fenced_code(text).unwrap(), "first\n");
    }

    #[test]
    fn test_extract_fenced_code_none() {
        assert!(extract_fenced_code("no fences here").is_none());
    }
}
