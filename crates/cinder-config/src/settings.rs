//! Core configuration.
//!
//! Consulted once at startup by the cache, the queue and the processor. Every
//! field has a default, so an empty `{}` file is a valid configuration.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Where the session queue keeps its records.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum StorageMode {
  /// Non-durable; sessions are lost on restart.
  #[default]
  Memory,
  /// SQLite database file. Relative paths resolve against the data directory.
  Sqlite { path: PathBuf },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
  /// Maximum total weight of the invocation cache. 0 disables caching.
  pub node_cache_size: usize,
  /// Number of session processor loops.
  pub workers: usize,
  /// Maximum number of independent steps run concurrently within a session.
  pub node_concurrency: usize,
  pub storage: StorageMode,
  /// Default per-invocation timeout, overridden by a node's own `timeout_ms`.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub invocation_timeout_ms: Option<u64>,
}

impl Default for CoreConfig {
  fn default() -> Self {
    Self {
      node_cache_size: 512,
      workers: 1,
      node_concurrency: 1,
      storage: StorageMode::Memory,
      invocation_timeout_ms: None,
    }
  }
}

impl CoreConfig {
  /// Load and validate a configuration file.
  pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
      path: path.to_path_buf(),
      source,
    })?;
    Self::from_json(&content)
  }

  /// Parse and validate a configuration from a JSON string.
  pub fn from_json(content: &str) -> Result<Self, ConfigError> {
    let config: CoreConfig = serde_json::from_str(content)?;
    config.validate()?;
    Ok(config)
  }

  pub fn validate(&self) -> Result<(), ConfigError> {
    if self.workers == 0 {
      return Err(ConfigError::Invalid {
        message: "workers must be at least 1".to_string(),
      });
    }
    if self.node_concurrency == 0 {
      return Err(ConfigError::Invalid {
        message: "node_concurrency must be at least 1".to_string(),
      });
    }
    Ok(())
  }
}
