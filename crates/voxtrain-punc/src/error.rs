//! Error types for the punctuation crate.

use mlx_rs::error::Exception;
use thiserror::Error;
use voxtrain_core::VoxError;
use voxtrain_trainer::TrainerError;

/// Result type for punctuation operations.
pub type Result<T> = std::result::Result<T, PuncError>;

/// Error type for punctuation training and testing.
#[derive(Error, Debug)]
pub enum PuncError {
    /// MLX operation error.
    #[error("MLX error: {0}")]
    Mlx(#[from] Exception),

    /// Invalid model or training configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Labels and predictions disagree in length, or a class list is empty.
    #[error("Metric error: {0}")]
    Metric(String),

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

impl PuncError {
    /// Whether this error reports a user-requested stop.
    pub fn is_interrupted(&self) -> bool {
        matches!(
            self,
            PuncError::Core(VoxError::Interrupted { .. })
                | PuncError::Trainer(TrainerError::Core(VoxError::Interrupted { .. }))
        )
    }
}

pub(crate) fn into_exception(err: PuncError) -> Exception {
    match err {
        PuncError::Mlx(e) => e,
        other => Exception::custom(other.to_string()),
    }
}
