//! Engine configuration
//!
//! Configuration for downloads and task scheduling. All values have
//! sensible defaults; `validate()` catches the combinations that would
//! misbehave at runtime.

use crate::error::{EngineError, Result};
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Main configuration for the engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Directory to save downloads
    pub download_dir: PathBuf,

    /// Maximum concurrently running tasks per manager
    pub max_concurrent_tasks: usize,

    /// Maximum connections per download (range-splitting)
    pub max_connections_per_download: usize,

    /// Don't split resources smaller than this (bytes)
    pub min_split_size: u64,

    /// Default user agent
    pub user_agent: String,

    /// HTTP configuration
    pub http: HttpConfig,

    /// Retry policy for whole tasks (outer tier)
    #[serde(default = "RetryPolicy::task_default")]
    pub task_retry: RetryPolicy,

    /// Retry policy for individual connections (inner tier)
    #[serde(default = "RetryPolicy::connection_default")]
    pub connection_retry: RetryPolicy,
}

/// HTTP-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    /// Connection timeout in seconds
    pub connect_timeout: u64,

    /// Read timeout in seconds
    pub read_timeout: u64,

    /// Maximum redirects to follow
    pub max_redirects: usize,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            connect_timeout: 30,
            read_timeout: 60,
            max_redirects: 10,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            download_dir: PathBuf::from("downloads"),
            max_concurrent_tasks: 4,
            max_connections_per_download: 4,
            min_split_size: 1024 * 1024,
            user_agent: format!("downdraft/{}", env!("CARGO_PKG_VERSION")),
            http: HttpConfig::default(),
            task_retry: RetryPolicy::task_default(),
            connection_retry: RetryPolicy::connection_default(),
        }
    }
}

impl EngineConfig {
    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_tasks == 0 {
            return Err(EngineError::invalid_input(
                "max_concurrent_tasks",
                "must be at least 1",
            ));
        }
        if self.max_connections_per_download == 0 {
            return Err(EngineError::invalid_input(
                "max_connections_per_download",
                "must be at least 1",
            ));
        }
        if self.min_split_size == 0 {
            return Err(EngineError::invalid_input(
                "min_split_size",
                "must be non-zero",
            ));
        }
        if self.user_agent.is_empty() {
            return Err(EngineError::invalid_input("user_agent", "must not be empty"));
        }
        Ok(())
    }

    /// Load configuration from a JSON file
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| EngineError::storage(path, format!("Failed to read config: {}", e)))?;
        let config: Self = serde_json::from_str(&data)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a JSON file
    pub async fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let data = serde_json::to_string_pretty(self)?;
        tokio::fs::write(path, data)
            .await
            .map_err(|e| EngineError::storage(path, format!("Failed to write config: {}", e)))?;
        Ok(())
    }

    /// Build a reqwest client honoring the HTTP settings
    pub fn build_client(&self) -> Result<reqwest::Client> {
        reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(self.http.connect_timeout))
            .read_timeout(std::time::Duration::from_secs(self.http.read_timeout))
            .redirect(reqwest::redirect::Policy::limited(self.http.max_redirects))
            .build()
            .map_err(|e| EngineError::Internal(format!("Failed to create HTTP client: {}", e)))
    }
}
