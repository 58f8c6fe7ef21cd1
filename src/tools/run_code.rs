//! Code execution tool
//!
//! Runs a snippet on the compute backend through the exchange correlator and
//! returns what it printed or evaluated to. This is the recursive path in
//! the engine: an agent ACT opens a fresh exchange on the same bus the agent
//! request itself arrived on.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{MuxError, Result};

use super::{Tool, ToolContext};

/// Executes code on the backend kernel and returns its output.
///
/// An error *status* from the kernel is reported in the observation text,
/// not raised: the exchange itself succeeded, the user's code did not, and
/// the policy should see the traceback.
pub struct RunCodeTool;

#[async_trait]
impl Tool for RunCodeTool {
    fn name(&self) -> &str {
        "run_code"
    }

    fn description(&self) -> &str {
        "Execute Python code in the kernel and return its printed output and the value \
         of the last expression. The dataframe is available as `df`."
    }

    fn parameters(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "code": {
                    "type": "string",
                    "description": "The code to execute"
                }
            },
            "required": ["code"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<String> {
        let code = args
            .get("code")
            .and_then(Value::as_str)
            .ok_or_else(|| MuxError::Tool("run_code requires 'code'".to_string()))?;
        let correlator = ctx.correlator()?;

        let outcome = correlator.execute(code).await?;

        if !outcome.is_ok() {
            let stderr = outcome.stderr_text();
            return Ok(if stderr.is_empty() {
                "Execution failed with no error output.".to_string()
            } else {
                format!("Execution failed:\n{}", stderr)
            });
        }

        let mut parts = Vec::new();
        let stdout = outcome.stdout_text();
        if !stdout.is_empty() {
            parts.push(stdout);
        }
        if let Some(value) = &outcome.return_value {
            parts.push(value.clone());
        }
        if parts.is_empty() {
            return Ok("(no output)".to_string());
        }
        Ok(parts.join("\n"))
    }
}
