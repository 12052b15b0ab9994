use gridmask_core::ModelError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SelectError {
    #[error("invalid_action_masking must be set to true in env_config to use masked action selection")]
    MaskingDisabled,
    #[error("batch mismatch: {what} has {found} entries, expected {expected}")]
    BatchMismatch {
        what: &'static str,
        expected: usize,
        found: usize,
    },
    #[error("score row {index} has width {found}, expected {expected}")]
    ScoreShape {
        index: usize,
        expected: usize,
        found: usize,
    },
    #[error("score row {index} has a non-finite value at position {position}")]
    NonFiniteScore { index: usize, position: usize },
    #[error("invalid legality for example {index}: {reason}")]
    InvalidLegality { index: usize, reason: String },
    #[error("invalid model capability: {0}")]
    InvalidCapability(String),
    #[error(transparent)]
    Inference(#[from] ModelError),
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
    #[error("Snapshot deserialization failed: {0}")]
    Snapshot(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, SelectError>;

pub(crate) fn invalid_legality(index: usize, reason: impl Into<String>) -> SelectError {
    SelectError::InvalidLegality {
        index,
        reason: reason.into(),
    }
}
