//! Configuration management for KernelMux
//!
//! Configuration is loaded from a `kernelmux.toml` file with environment
//! variable overrides. The original deployment environment used
//! `JUPYTER_SERVER`, `JUPYTER_TOKEN` and `DATA_SERVICE_URL`; those names are
//! honored alongside the `KERNELMUX_*` scheme.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{MuxError, Result};

/// Main configuration struct for KernelMux.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Compute backend (kernel server) configuration
    pub backend: BackendConfig,
    /// External data service configuration
    pub data_service: DataServiceConfig,
    /// Agent loop configuration (iteration caps, repair attempts)
    pub agent: AgentConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Kernel server connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Base URL of the kernel server REST API
    pub server_url: String,
    /// Authorization token for the kernel server
    pub token: String,
    /// Kernel spec name to provision
    pub kernel_name: String,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:8888".to_string(),
            token: String::new(),
            kernel_name: "python3".to_string(),
        }
    }
}

/// External data service settings (dataset metadata and download URLs).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct DataServiceConfig {
    /// Base URL of the data service
    pub base_url: String,
}

/// Agent loop settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Maximum think/act iterations per loop invocation
    pub max_iterations: u32,
    /// Maximum reprompt attempts when policy output cannot be parsed
    pub max_repair_attempts: u32,
    /// Maximum nesting depth for loop invocations triggered from inside tools
    pub max_depth: u32,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_iterations: 12,
            max_repair_attempts: 2,
            max_depth: 3,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Compact text formatter (human-readable, grep-friendly)
    Compact,
    /// Structured JSON lines for log aggregators
    Json,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Output format
    pub format: LogFormat,
    /// Default level filter when `RUST_LOG` is unset
    pub level: String,
    /// Optional log file path (JSON format only)
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Compact,
            level: "info".to_string(),
            file: None,
        }
    }
}

impl Config {
    /// Load configuration from `kernelmux.toml` in the working directory,
    /// falling back to defaults when the file does not exist, then apply
    /// environment variable overrides.
    ///
    /// A `.env` file is loaded first if present.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();
        let path = Path::new("kernelmux.toml");
        let mut config = if path.exists() {
            Self::load_from_path(path)?
        } else {
            Config::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load configuration from a specific TOML file, without env overrides.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| MuxError::Config(e.to_string()))
    }

    /// Apply environment variable overrides to the configuration.
    ///
    /// `KERNELMUX_*` variables take precedence over the legacy names.
    fn apply_env_overrides(&mut self) {
        // Legacy deployment names first, so KERNELMUX_* can override them.
        if let Ok(val) = std::env::var("JUPYTER_SERVER") {
            self.backend.server_url = val;
        }
        if let Ok(val) = std::env::var("JUPYTER_TOKEN") {
            self.backend.token = val;
        }
        if let Ok(val) = std::env::var("DATA_SERVICE_URL") {
            self.data_service.base_url = val;
        }

        if let Ok(val) = std::env::var("KERNELMUX_BACKEND_SERVER_URL") {
            self.backend.server_url = val;
        }
        if let Ok(val) = std::env::var("KERNELMUX_BACKEND_TOKEN") {
            self.backend.token = val;
        }
        if let Ok(val) = std::env::var("KERNELMUX_BACKEND_KERNEL_NAME") {
            self.backend.kernel_name = val;
        }
        if let Ok(val) = std::env::var("KERNELMUX_DATA_SERVICE_BASE_URL") {
            self.data_service.base_url = val;
        }
        if let Ok(val) = std::env::var("KERNELMUX_AGENT_MAX_ITERATIONS") {
            if let Ok(v) = val.parse() {
                self.agent.max_iterations = v;
            }
        }
        if let Ok(val) = std::env::var("KERNELMUX_AGENT_MAX_REPAIR_ATTEMPTS") {
            if let Ok(v) = val.parse() {
                self.agent.max_repair_attempts = v;
            }
        }
        if let Ok(val) = std::env::var("KERNELMUX_AGENT_MAX_DEPTH") {
            if let Ok(v) = val.parse() {
                self.agent.max_depth = v;
            }
        }
        if let Ok(val) = std::env::var("KERNELMUX_LOG_LEVEL") {
            self.logging.level = val;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.backend.server_url, "http://127.0.0.1:8888");
        assert_eq!(config.backend.kernel_name, "python3");
        assert!(config.backend.token.is_empty());
        assert_eq!(config.agent.max_iterations, 12);
        assert_eq!(config.agent.max_repair_attempts, 2);
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.logging.format, LogFormat::Compact);
    }

    #[test]
    fn test_parse_toml() {
        let toml_str = r#"
            [backend]
            server_url = "http://jupyter:8888"
            token = "secret"

            [agent]
            max_iterations = 5

            [logging]
            format = "json"
            level = "debug"
        "#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.backend.server_url, "http://jupyter:8888");
        assert_eq!(config.backend.token, "secret");
        // Unspecified fields keep their defaults
        assert_eq!(config.backend.kernel_name, "python3");
        assert_eq!(config.agent.max_iterations, 5);
        assert_eq!(config.agent.max_repair_attempts, 2);
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_parse_empty_toml() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.backend.server_url, "http://127.0.0.1:8888");
    }

    #[test]
    fn test_log_format_roundtrip() {
        let cfg = LoggingConfig {
            format: LogFormat::Json,
            level: "trace".to_string(),
            file: Some("/tmp/kernelmux.log".to_string()),
        };
        let json = serde_json::to_string(&cfg).unwrap();
        let restored: LoggingConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.format, LogFormat::Json);
        assert_eq!(restored.level, "trace");
        assert_eq!(restored.file.as_deref(), Some("/tmp/kernelmux.log"));
    }

    #[test]
    fn test_config_serialize_roundtrip() {
        let config = Config::default();
        let serialized = toml::to_string(&config).unwrap();
        let restored: Config = toml::from_str(&serialized).unwrap();
        assert_eq!(restored.backend.server_url, config.backend.server_url);
        assert_eq!(restored.agent.max_iterations, config.agent.max_iterations);
    }
}
