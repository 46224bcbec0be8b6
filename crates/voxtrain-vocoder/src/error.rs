//! Error types for the vocoder crate.

use mlx_rs::error::Exception;
use thiserror::Error;
use voxtrain_core::VoxError;
use voxtrain_trainer::TrainerError;

/// Result type for vocoder operations.
pub type Result<T> = std::result::Result<T, VocoderError>;

/// Error type for vocoder operations.
#[derive(Error, Debug)]
pub enum VocoderError {
    /// MLX operation error.
    #[error("MLX error: {0}")]
    Mlx(#[from] Exception),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Shape mismatch error.
    #[error("Shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        /// Expected shape.
        expected: Vec<i32>,
        /// Actual shape.
        actual: Vec<i32>,
    },

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Error from the shared core types.
    #[error(transparent)]
    Core(#[from] VoxError),

    /// Error from the experiment harness.
    #[error(transparent)]
    Trainer(#[from] TrainerError),
}

impl From<VocoderError> for TrainerError {
    fn from(err: VocoderError) -> Self {
        match err {
            VocoderError::Trainer(e) => e,
            VocoderError::Core(e) => TrainerError::Core(e),
            VocoderError::Mlx(e) => TrainerError::Mlx(e),
            VocoderError::Io(e) => TrainerError::Io(e),
            VocoderError::Config(msg) => TrainerError::Core(VoxError::Config(msg)),
            VocoderError::ShapeMismatch { expected, actual } => {
                TrainerError::Core(VoxError::ShapeMismatch { expected, actual })
            }
        }
    }
}
