use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while loading the core configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
  #[error("failed to read config file {path}")]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("failed to parse config: {0}")]
  Parse(#[from] serde_json::Error),

  #[error("invalid config: {message}")]
  Invalid { message: String },
}
