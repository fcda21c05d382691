//! Error types for the training orchestrator.

use thiserror::Error;

/// Result type for training operations.
pub type TrainResult<T> = Result<T, TrainError>;

/// Errors that can occur while orchestrating a training run.
#[derive(Debug, Error)]
pub enum TrainError {
    /// Tensor operation failed
    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Communication-group setup or collective failure. Fatal: the caller
    /// must terminate the process, never retry.
    #[error("Distributed error: {0}")]
    Distributed(String),

    /// Data loading error
    #[error("Data error: {0}")]
    Data(String),

    /// Frame graph construction error
    #[error("Graph error: {0}")]
    Graph(String),

    /// Training loop error
    #[error("Training error: {0}")]
    Training(String),

    /// Checkpoint serialization / restore error
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl TrainError {
    /// Create an invalid config error
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }

    /// Create a distributed error
    pub fn distributed(msg: impl Into<String>) -> Self {
        Self::Distributed(msg.into())
    }

    /// Create a data loading error
    pub fn data(msg: impl Into<String>) -> Self {
        Self::Data(msg.into())
    }

    /// Create a graph construction error
    pub fn graph(msg: impl Into<String>) -> Self {
        Self::Graph(msg.into())
    }

    /// Create a training error
    pub fn training(msg: impl Into<String>) -> Self {
        Self::Training(msg.into())
    }

    /// Create a checkpoint error
    pub fn checkpoint(msg: impl Into<String>) -> Self {
        Self::Checkpoint(msg.into())
    }
}
