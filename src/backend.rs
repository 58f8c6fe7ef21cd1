//! Compute backend session management
//!
//! The broker proxies a disposable kernel provisioned through the kernel
//! server's REST API. A [`BackendSession`] is an owned handle to one such
//! kernel: it is created by [`BackendSession::provision`], destroyed
//! explicitly, and replaced as a destroy-then-provision pair so a stale
//! kernel never leaks. Provisioning failures are surfaced, never retried
//! automatically.

use serde_json::Value;
use tracing::{info, warn};

use crate::config::BackendConfig;
use crate::error::{MuxError, Result};

/// An owned handle to one provisioned kernel.
#[derive(Debug)]
pub struct BackendSession {
    kernel_id: String,
    server_url: String,
    token: String,
    client: reqwest::Client,
}

impl BackendSession {
    /// Provisions a fresh kernel on the server.
    ///
    /// # Errors
    /// [`MuxError::Backend`] when the server responds with a non-success
    /// status or an id-less body.
    pub async fn provision(config: &BackendConfig) -> Result<Self> {
        let client = reqwest::Client::new();
        let server_url = config.server_url.trim_end_matches('/').to_string();
        let url = format!("{}/api/kernels", server_url);

        let response = client
            .post(&url)
            .header("Authorization", format!("token {}", config.token))
            .json(&serde_json::json!({"name": config.kernel_name, "path": ""}))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(MuxError::Backend(format!(
                "kernel provisioning failed: HTTP {}",
                status
            )));
        }

        let body: Value = response.json().await?;
        let kernel_id = body
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| MuxError::Backend("kernel server returned no kernel id".to_string()))?
            .to_string();

        info!(kernel_id = %kernel_id, kernel = %config.kernel_name, "kernel provisioned");
        Ok(Self {
            kernel_id,
            server_url,
            token: config.token.clone(),
            client,
        })
    }

    /// Destroys this kernel, consuming the handle.
    ///
    /// # Errors
    /// [`MuxError::Backend`] when the server refuses; the handle is consumed
    /// either way, so a half-dead kernel cannot be reused.
    pub async fn destroy(self) -> Result<()> {
        let url = format!("{}/api/kernels/{}", self.server_url, self.kernel_id);
        let response = self
            .client
            .delete(&url)
            .header("Authorization", format!("token {}", self.token))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            warn!(kernel_id = %self.kernel_id, %status, "kernel destruction refused");
            return Err(MuxError::Backend(format!(
                "kernel destruction failed: HTTP {}",
                status
            )));
        }
        info!(kernel_id = %self.kernel_id, "kernel destroyed");
        Ok(())
    }

    /// Destroys this kernel and provisions a replacement.
    ///
    /// The old kernel is always destroyed first; its failure aborts the
    /// replacement rather than leaving two kernels alive.
    pub async fn replace(self, config: &BackendConfig) -> Result<Self> {
        self.destroy().await?;
        Self::provision(config).await
    }

    /// The provisioned kernel's id.
    pub fn kernel_id(&self) -> &str {
        &self.kernel_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_provision_unreachable_server_is_surfaced() {
        // Nothing listens here; the error must surface, not retry
        let config = BackendConfig {
            server_url: "http://127.0.0.1:1".to_string(),
            token: "t".to_string(),
            kernel_name: "python3".to_string(),
        };
        let result = BackendSession::provision(&config).await;
        assert!(result.is_err());
    }
}
