//! Trainer error type.

use mlx_rs::error::Exception;
use voxtrain_core::VoxError;

/// Errors raised by the experiment harness.
#[derive(Debug, thiserror::Error)]
pub enum TrainerError {
    /// Error from the shared core types.
    #[error(transparent)]
    Core(#[from] VoxError),
    /// MLX error.
    #[error("MLX error: {0}")]
    Mlx(#[from] Exception),
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// Checkpoint files are missing or inconsistent.
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),
    /// Collective communication failed.
    #[error("Distributed error: {0}")]
    Distributed(String),
    /// JSON (de)serialization failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for trainer operations.
pub type Result<T> = std::result::Result<T, TrainerError>;
