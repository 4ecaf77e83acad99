//! Error type for model construction, configuration loading and inference.

use attention::AttentionError;
use thiserror::Error;

/// Errors surfaced by the `lamda` crate.
#[derive(Debug, Error)]
pub enum LamdaError {
    /// One or more configuration fields are out of range.
    #[error("invalid configuration: {}", .0.join("; "))]
    Config(Vec<String>),
    #[error(transparent)]
    Tensor(#[from] candle_core::Error),
    #[error(transparent)]
    Attention(#[from] AttentionError),
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Json(#[from] serde_json::Error),
    #[error("failed to parse config: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("unsupported configuration extension '{0}'")]
    UnsupportedConfigFormat(String),
}

pub type Result<T> = std::result::Result<T, LamdaError>;
