//! Error types for voxtrain.

use mlx_rs::error::Exception;
use thiserror::Error;

/// Result type alias for voxtrain operations.
pub type Result<T> = std::result::Result<T, VoxError>;

/// Main error type shared by the voxtrain crates.
#[derive(Error, Debug)]
pub enum VoxError {
    /// Configuration errors.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Tensor shape mismatch.
    #[error("Shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        /// Expected shape.
        expected: Vec<i32>,
        /// Actual shape.
        actual: Vec<i32>,
    },

    /// Dataset construction or loading errors.
    #[error("Data error: {0}")]
    Data(String),

    /// Checkpoint save/load errors.
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    /// Rank coordination errors.
    #[error("Distributed error: {0}")]
    Distributed(String),

    /// I/O errors.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// MLX backend errors.
    #[error("MLX error: {0}")]
    Mlx(#[from] Exception),

    /// Invalid argument.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Training was stopped by the user before completion.
    #[error("Interrupted at step {step}")]
    Interrupted {
        /// Iteration reached when the stop was observed.
        step: usize,
    },
}

impl From<serde_json::Error> for VoxError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl From<serde_yaml::Error> for VoxError {
    fn from(e: serde_yaml::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}
