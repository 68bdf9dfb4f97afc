//! Configuration file handling.
//!
//! This module handles loading and merging configuration from
//! `tessera.toml` files.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Root configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Metadata store settings.
    #[serde(default)]
    pub store: StoreConfig,

    /// Dataset service settings.
    #[serde(default)]
    pub dataset: DatasetConfig,

    /// Compute-party settings.
    #[serde(default)]
    pub compute: ComputeConfig,

    /// Streaming auto-batcher settings.
    #[serde(default)]
    pub streaming: StreamingConfig,
}

/// Metadata store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// JSON snapshot file the store persists to between runs.
    /// An empty path keeps the store purely in memory.
    #[serde(default = "default_store_path")]
    pub path: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

fn default_store_path() -> String {
    "tessera-store.json".to_string()
}

/// Dataset service (bulk time-series store) settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetConfig {
    /// Base URL of the dataset service.
    #[serde(default = "default_dataset_endpoint")]
    pub endpoint: String,

    /// Timeout for ingest calls, in seconds.
    #[serde(default = "default_ingest_timeout")]
    pub ingest_timeout_seconds: u64,

    /// Timeout for event queries, in seconds. Bulk ciphertext reads are
    /// slower than ingests, so this is looser.
    #[serde(default = "default_query_timeout")]
    pub query_timeout_seconds: u64,
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            endpoint: default_dataset_endpoint(),
            ingest_timeout_seconds: default_ingest_timeout(),
            query_timeout_seconds: default_query_timeout(),
        }
    }
}

fn default_dataset_endpoint() -> String {
    "http://localhost:8300".to_string()
}

fn default_ingest_timeout() -> u64 {
    5
}

fn default_query_timeout() -> u64 {
    10
}

/// Compute-party settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComputeConfig {
    /// Base URL of the FHE compute server.
    #[serde(default = "default_fhe_endpoint")]
    pub fhe_endpoint: String,

    /// Timeout for job pushes and status checks, in seconds.
    #[serde(default = "default_party_timeout")]
    pub timeout_seconds: u64,
}

impl Default for ComputeConfig {
    fn default() -> Self {
        Self {
            fhe_endpoint: default_fhe_endpoint(),
            timeout_seconds: default_party_timeout(),
        }
    }
}

fn default_fhe_endpoint() -> String {
    "http://localhost:8400".to_string()
}

fn default_party_timeout() -> u64 {
    5
}

/// Streaming auto-batcher settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamingConfig {
    /// Delay before a flushed streaming batch is pushed to the parties,
    /// in milliseconds.
    #[serde(default = "default_submit_delay")]
    pub submit_delay_ms: u64,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            submit_delay_ms: default_submit_delay(),
        }
    }
}

fn default_submit_delay() -> u64 {
    500
}

impl Config {
    /// Load configuration from a file path.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Try to load configuration from the default location.
    ///
    /// Returns `Ok(None)` if the file doesn't exist, `Err` if it exists but can't be parsed.
    pub fn load_default() -> Result<Option<Self>> {
        let default_path = Path::new("tessera.toml");

        if default_path.exists() {
            Ok(Some(Self::load(default_path)?))
        } else {
            Ok(None)
        }
    }

    /// Merge this configuration with CLI arguments.
    ///
    /// CLI arguments take precedence over config file settings.
    /// This method only overrides config when CLI provides explicit values.
    pub fn merge_with_args(&mut self, args: &crate::cli::Args) {
        if let Some(ref store) = args.store {
            self.store.path = store.display().to_string();
        }
        if let Some(ref endpoint) = args.dataset_endpoint {
            self.dataset.endpoint = endpoint.clone();
        }
        if let Some(ref endpoint) = args.fhe_endpoint {
            self.compute.fhe_endpoint = endpoint.clone();
        }
    }

    /// Generate a default configuration file content.
    pub fn default_toml() -> String {
        let config = Config::default();
        toml::to_string_pretty(&config).unwrap_or_else(|_| String::new())
    }
}
