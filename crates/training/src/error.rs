use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, TrainingError>;

#[derive(Error, Debug)]
pub enum TrainingError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    ConfigFormat(String),

    #[error("invalid configuration: {}", .0.join("; "))]
    Validation(Vec<String>),

    #[error("trainer initialization failed: {0}")]
    Initialization(String),

    #[error("training failed: {0}")]
    Runtime(String),

    #[error("tensor error: {0}")]
    Candle(#[from] candle_core::Error),

    #[error("no checkpoint found at {}", .0.display())]
    CheckpointNotFound(PathBuf),

    #[error("{references} references but {hypotheses} hypotheses")]
    ArityMismatch {
        references: usize,
        hypotheses: usize,
    },

    #[error("process group error: {0}")]
    Distributed(String),
}

impl TrainingError {
    pub fn initialization(message: impl Into<String>) -> Self {
        Self::Initialization(message.into())
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self::Runtime(message.into())
    }

    pub fn validation(messages: Vec<String>) -> Self {
        Self::Validation(messages)
    }

    pub fn distributed(message: impl Into<String>) -> Self {
        Self::Distributed(message.into())
    }
}

impl From<toml::de::Error> for TrainingError {
    fn from(value: toml::de::Error) -> Self {
        TrainingError::ConfigFormat(value.to_string())
    }
}

impl From<serde_json::Error> for TrainingError {
    fn from(value: serde_json::Error) -> Self {
        TrainingError::ConfigFormat(value.to_string())
    }
}

impl From<safetensors::SafeTensorError> for TrainingError {
    fn from(value: safetensors::SafeTensorError) -> Self {
        TrainingError::runtime(format!("safetensors: {value}"))
    }
}
