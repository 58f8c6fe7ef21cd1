//! Code repair tool
//!
//! Attempts to fix broken code given the error it produced. The rewrite is a
//! single side query to the decision policy; the result must contain exactly
//! one fenced code block.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{MuxError, Result};

use super::{extract_fenced_code, Tool, ToolContext};

/// Rewrites broken code to fix a reported error.
pub struct RepairCodeTool;

impl RepairCodeTool {
    fn query(code: &str, error: &str, language: &str, description: Option<&str>) -> String {
        let mut query = format!(
            "The following code is broken:\n\n```{}\n{}\n```\n\nHere is the issue:\n\n{}\n",
            language, code, error
        );
        if let Some(description) = description {
            query.push_str(&format!(
                "\nHere is a description of the code:\n{}\n",
                description
            ));
        }
        query.push_str(
            "\nPlease generate a new version of the code that fixes the issue.\n\n\
             Please include only one code block in your response. Do not write any other \
             code in your output, only write the code that fixes the issue.",
        );
        query
    }
}

#[async_trait]
impl Tool for RepairCodeTool {
    fn name(&self) -> &str {
        "repair_code"
    }

    fn description(&self) -> &str {
        "Attempt to fix broken code. Provide the code, the error, and an optional \
         description of what the code is trying to accomplish; returns a rewritten \
         version of the code that fixes the error."
    }

    fn parameters(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "code": {
                    "type": "string",
                    "description": "The code containing an issue to be fixed"
                },
                "error": {
                    "type": "string",
                    "description": "The error that is occurring: a stack trace or a verbal description"
                },
                "language": {
                    "type": "string",
                    "description": "The language the code is written in, e.g. 'python'"
                },
                "description": {
                    "type": "string",
                    "description": "Optional description of what the code is trying to accomplish"
                }
            },
            "required": ["code", "error", "language"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<String> {
        let code = args
            .get("code")
            .and_then(Value::as_str)
            .ok_or_else(|| MuxError::Tool("repair_code requires 'code'".to_string()))?;
        let error = args
            .get("error")
            .and_then(Value::as_str)
            .ok_or_else(|| MuxError::Tool("repair_code requires 'error'".to_string()))?;
        let language = args
            .get("language")
            .and_then(Value::as_str)
            .ok_or_else(|| MuxError::Tool("repair_code requires 'language'".to_string()))?;
        let description = args.get("description").and_then(Value::as_str);
        let policy = ctx.policy()?;

        let prompt = format!("You are an experienced {} developer.", language);
        let query = Self::query(code, error, language, description);

        let response = policy.oneshot(&prompt, &query).await?;
        extract_fenced_code(&response)
            .map(|code| code.trim_end().to_string())
            .ok_or_else(|| {
                MuxError::Tool("could not find a code block in the result".to_string())
            })
    }
}
