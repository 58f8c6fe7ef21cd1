//! Dataset context tools
//!
//! The analysis subject is a tabular dataset owned by an external data
//! service. [`DatasetStore`] fetches its metadata and download URL over
//! HTTP; the actual dataframe lives in the compute kernel as the variable
//! `df`. Two tools work against it: [`DatasetInfoTool`] profiles the live
//! dataframe, and [`GenerateCodeTool`] asks the policy for notebook code
//! satisfying a request, returning it as a structured `code_cell` action
//! and ending the loop.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{MuxError, Result};

use super::{extract_fenced_code, Tool, ToolContext};

/// Metadata describing one dataset, as returned by the data service.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DatasetMeta {
    /// Dataset identifier
    #[serde(default)]
    pub id: String,
    /// Human-readable name
    #[serde(default)]
    pub name: String,
    /// Free-text description
    #[serde(default)]
    pub description: String,
    /// Files belonging to the dataset; the first is loaded by default
    #[serde(default)]
    pub file_names: Vec<String>,
}

/// Client for the external data service, holding the currently selected
/// dataset.
///
/// Cloning shares the selection. HTTP failures surface as errors and are
/// never retried here: a missing dataset is an operator problem, not a
/// transient.
#[derive(Clone)]
pub struct DatasetStore {
    base_url: String,
    client: reqwest::Client,
    current: Arc<Mutex<Option<DatasetMeta>>>,
}

impl DatasetStore {
    /// Creates a store talking to the data service at `base_url`.
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
            current: Arc::new(Mutex::new(None)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<DatasetMeta>> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fetches metadata for `id` from the data service and selects it.
    ///
    /// # Errors
    /// [`MuxError::Dataset`] when the service is unconfigured or the dataset
    /// does not exist.
    pub async fn set_dataset(&self, id: &str) -> Result<DatasetMeta> {
        if self.base_url.is_empty() {
            return Err(MuxError::Dataset(
                "data service url not configured".to_string(),
            ));
        }
        let url = format!("{}/datasets/{}", self.base_url, id);
        debug!(%url, "fetching dataset metadata");
        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(MuxError::Dataset(format!(
                "dataset '{}' not found (HTTP {})",
                id,
                response.status()
            )));
        }
        let mut meta: DatasetMeta = response.json().await?;
        meta.id = id.to_string();
        *self.lock() = Some(meta.clone());
        Ok(meta)
    }

    /// Resolves a presigned download URL for `filename` (defaulting to the
    /// dataset's first file).
    pub async fn download_url(&self, filename: Option<&str>) -> Result<String> {
        let meta = self
            .current()
            .ok_or_else(|| MuxError::Dataset("no dataset selected".to_string()))?;
        let filename = match filename {
            Some(name) => name.to_string(),
            None => meta
                .file_names
                .first()
                .cloned()
                .ok_or_else(|| MuxError::Dataset("dataset has no files".to_string()))?,
        };
        let url = format!(
            "{}/datasets/{}/download-url?filename={}",
            self.base_url, meta.id, filename
        );
        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(MuxError::Dataset(format!(
                "unable to open dataset (HTTP {})",
                response.status()
            )));
        }
        let value: Value = response.json().await?;
        value
            .get("url")
            .and_then(Value::as_str)
            .map(String::from)
            .ok_or_else(|| MuxError::Dataset("unable to open dataset".to_string()))
    }

    /// Selects a dataset without going through the data service.
    ///
    /// Used by tests and by deployments that resolve metadata elsewhere.
    pub fn install(&self, meta: DatasetMeta) {
        *self.lock() = Some(meta);
    }

    /// Clears the selection.
    pub fn reset(&self) {
        *self.lock() = None;
    }

    /// The currently selected dataset, if any.
    pub fn current(&self) -> Option<DatasetMeta> {
        self.lock().clone()
    }

    /// Renders the analyst context block for the decision policy.
    ///
    /// Returns `None` when no dataset is selected.
    pub fn context_prompt(&self) -> Option<String> {
        let meta = self.current()?;
        Some(format!(
            "You are an analyst whose goal is to help with scientific data analysis and \
             manipulation in Python.\n\n\
             You are working on a dataset named: {}\n\n\
             The description of the dataset is:\n{}\n\n\
             The dataset is loaded in the variable `df`.\n\n\
             Please answer any user queries to the best of your ability, but do not guess \
             if you are not sure of an answer.\n\
             If you are asked to manipulate or visualize the dataset, use the \
             generate_code tool.",
            meta.name, meta.description
        ))
    }

    /// A metadata-only summary, used when the live kernel is unavailable.
    pub fn summary(&self) -> Option<String> {
        let meta = self.current()?;
        Some(format!(
            "Dataset: {}\n\nDescription:\n{}\n\nFiles: {}",
            meta.name,
            meta.description,
            meta.file_names.join(", ")
        ))
    }
}

/// Python snippet printing the four profile sections the policy expects.
const PROFILE_SNIPPET: &str = r#"print("Dataframe head:")
print(df.head(15))
print()
print("Columns:")
print(df.columns)
print()
print("dtypes:")
print(df.dtypes)
print()
print("Statistics:")
print(df.describe())
"#;

/// Inspects the loaded dataset and returns information about it.
///
/// Profiles the live dataframe in the kernel when a backend is attached;
/// falls back to the cached metadata otherwise.
pub struct DatasetInfoTool;

#[async_trait]
impl Tool for DatasetInfoTool {
    fn name(&self) -> &str {
        "dataset_info"
    }

    fn description(&self) -> &str {
        "Inspect the dataset and return information and metadata about it: columns, \
         dtypes, head rows, and summary statistics. Use this to answer questions \
         about the dataset's structure and contents."
    }

    fn parameters(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {},
            "required": []
        })
    }

    async fn execute(&self, _args: Value, ctx: &ToolContext) -> Result<String> {
        let dataset = ctx.dataset()?;

        // Prefer the live dataframe; fall back to metadata when the kernel
        // is unavailable or the probe fails.
        if let Some(correlator) = &ctx.correlator {
            match correlator.execute(PROFILE_SNIPPET).await {
                Ok(outcome) if outcome.is_ok() => return Ok(outcome.stdout_text()),
                Ok(outcome) => {
                    warn!(stderr = %outcome.stderr_text(), "dataset profile failed in kernel");
                }
                Err(e) => {
                    warn!(error = %e, "dataset profile exchange failed");
                }
            }
        }

        dataset
            .summary()
            .ok_or_else(|| MuxError::Tool("no dataset selected".to_string()))
    }
}

/// Generates notebook code for the user's request and ends the loop with a
/// structured `code_cell` action.
pub struct GenerateCodeTool;

impl GenerateCodeTool {
    fn prompt(profile: &str) -> String {
        format!(
            "You are a programmer writing code to help with scientific data analysis and \
             manipulation in Python.\n\n\
             Please write code that satisfies the user's request below.\n\n\
             You have access to a variable named `df` that is a Pandas Dataframe with the \
             following structure:\n{}\n\n\
             If you are asked to modify or update the dataframe, modify the dataframe in \
             place, keeping the updated variable to still be named `df`.\n\n\
             You also have access to the libraries pandas, numpy, scipy, matplotlib.\n\n\
             Please generate the code as if you were programming inside a Jupyter Notebook \
             and the code is to be executed inside a cell.\n\
             You MUST wrap the code with a line containing three backticks (```) before and \
             after the generated code.\n\
             No additional text is needed in the response, just the code block.",
            profile
        )
    }
}

#[async_trait]
impl Tool for GenerateCodeTool {
    fn name(&self) -> &str {
        "generate_code"
    }

    fn description(&self) -> &str {
        "Generate Python code to be run in an interactive notebook for the purpose of \
         exploring, modifying, or visualizing the loaded dataframe. Input is a full \
         grammatically correct question about, or request for an action to be performed \
         on, the loaded dataframe."
    }

    fn parameters(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "A fully grammatically correct request about the current dataset"
                }
            },
            "required": ["query"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<String> {
        let query = args
            .get("query")
            .and_then(Value::as_str)
            .ok_or_else(|| MuxError::Tool("generate_code requires a 'query'".to_string()))?;
        let policy = ctx.policy()?;

        let profile = ctx
            .dataset
            .as_ref()
            .and_then(|d| d.summary())
            .unwrap_or_else(|| "(no dataset profile available)".to_string());

        let response = policy.oneshot(&Self::prompt(&profile), query).await?;
        let code = extract_fenced_code(&response).ok_or_else(|| {
            MuxError::Tool("could not find a code block in the model response".to_string())
        })?;

        let payload = serde_json::json!({
            "action": "code_cell",
            "language": "python",
            "content": code.trim(),
        });
        // The generated cell is the deliverable; end the loop with it.
        ctx.loop_control.stop_success();
        Ok(payload.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::ScriptedPolicy;
    use serde_json::json;

    fn meta() -> DatasetMeta {
        DatasetMeta {
            id: "17".to_string(),
            name: "Flight delays".to_string(),
            description: "US domestic flight delays, 2015".to_string(),
            file_names: vec!["flights.csv".to_string()],
        }
    }

    #[test]
    fn test_store_install_and_reset() {
        let store = DatasetStore::new("http://data.example");
        assert!(store.current().is_none());

        store.install(meta());
        assert_eq!(store.current().unwrap().name, "Flight delays");

        store.reset();
        assert!(store.current().is_none());
    }

    #[test]
    fn test_store_clone_shares_selection() {
        let store = DatasetStore::new("");
        let alias = store.clone();
        store.install(meta());
        assert!(alias.current().is_some());
    }

    #[test]
    fn test_context_prompt_mentions_dataset() {
        let store = DatasetStore::new("");
        assert!(store.context_prompt().is_none());

        store.install(meta());
        let prompt = store.context_prompt().unwrap();
        assert!(prompt.contains("Flight delays"));
        assert!(prompt.contains("generate_code"));
    }

    #[test]
    fn test_summary() {
        let store = DatasetStore::new("");
        store.install(meta());
        let summary = store.summary().unwrap();
        assert!(summary.contains("flights.csv"));
    }

    #[tokio::test]
    async fn test_set_dataset_without_service_errors() {
        let store = DatasetStore::new("");
        let result = store.set_dataset("17").await;
        assert!(matches!(result, Err(MuxError::Dataset(_))));
    }

    #[tokio::test]
    async fn test_download_url_without_selection_errors() {
        let store = DatasetStore::new("http://data.example");
        let result = store.download_url(None).await;
        assert!(matches!(result, Err(MuxError::Dataset(_))));
    }

    #[tokio::test]
    async fn test_dataset_info_requires_dataset() {
        let tool = DatasetInfoTool;
        let result = tool.execute(json!({}), &ToolContext::new()).await;
        assert!(matches!(result, Err(MuxError::Tool(_))));
    }

    #[tokio::test]
    async fn test_dataset_info_metadata_fallback() {
        let store = DatasetStore::new("");
        store.install(meta());
        let ctx = ToolContext::new().with_dataset(store);

        let tool = DatasetInfoTool;
        let result = tool.execute(json!({}), &ctx).await.unwrap();
        assert!(result.contains("Flight delays"));
    }

    #[tokio::test]
    async fn test_generate_code_wraps_fenced_block() {
        let policy = Arc::new(ScriptedPolicy::new([
            "```python\ndf['delay'].mean()\n```",
        ]));
        let store = DatasetStore::new("");
        store.install(meta());
        let ctx = ToolContext::new().with_policy(policy).with_dataset(store);

        let tool = GenerateCodeTool;
        let result = tool
            .execute(json!({"query": "what is the mean delay?"}), &ctx)
            .await
            .unwrap();

        let payload: Value = serde_json::from_str(&result).unwrap();
        assert_eq!(payload["action"], "code_cell");
        assert_eq!(payload["language"], "python");
        assert_eq!(payload["content"], "df['delay'].mean()");
        // The tool ends the loop with its output as the answer
        assert!(ctx.loop_control.is_stopped());
    }

    #[tokio::test]
    async fn test_generate_code_without_fence_is_tool_error() {
        let policy = Arc::new(ScriptedPolicy::new(["just prose, no code block"]));
        let ctx = ToolContext::new().with_policy(policy);

        let tool = GenerateCodeTool;
        let result = tool.execute(json!({"query": "x"}), &ctx).await;
        assert!(matches!(result, Err(MuxError::Tool(_))));
        assert!(!ctx.loop_control.is_stopped());
    }

    #[tokio::test]
    async fn test_generate_code_requires_query() {
        let tool = GenerateCodeTool;
        let result = tool.execute(json!({}), &ToolContext::new()).await;
        assert!(matches!(result, Err(MuxError::Tool(_))));
    }
}
