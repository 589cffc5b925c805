use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::api::ApiConfig;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// Runtime settings for the download core.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DownloaderConfig {
    /// Managed storage directory for finished downloads and the index.
    pub cache_dir: PathBuf,
    pub catalog_base_url: String,
    pub billing_base_url: String,
    /// An attempt fails with `timeout` after this long without receiving data.
    pub idle_timeout_secs: u64,
    /// Extension used when the remote URL has none.
    pub default_extension: String,
    /// Chunk count at which progress for an unknown-size body reaches 0.5.
    pub unknown_size_horizon: u32,
}

impl Default for DownloaderConfig {
    fn default() -> Self {
        let api = ApiConfig::default();
        Self {
            cache_dir: PathBuf::from("./downloads"),
            catalog_base_url: api.catalog_base_url,
            billing_base_url: api.billing_base_url,
            idle_timeout_secs: 30,
            default_extension: "mp3".to_string(),
            unknown_size_horizon: 16,
        }
    }
}

impl DownloaderConfig {
    /// Loads a JSON config file; absent fields keep their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn api_config(&self) -> ApiConfig {
        ApiConfig {
            catalog_base_url: self.catalog_base_url.clone(),
            billing_base_url: self.billing_base_url.clone(),
        }
    }
}
