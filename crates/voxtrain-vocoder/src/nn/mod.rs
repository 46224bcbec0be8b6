//! Neural network layers for Parallel WaveGAN.
//!
//! - Weight-normalized 1D convolutions
//! - Framework dropout construction

mod conv;

pub use conv::{Conv1d, Conv1dConfig};

use crate::error::{Result, VocoderError};
use mlx_rs::nn;

/// `mlx_rs` dropout with drop probability `p`.
pub fn dropout(p: f32) -> Result<nn::Dropout> {
    nn::DropoutBuilder::new()
        .p(p)
        .build()
        .map_err(|e| VocoderError::Config(format!("dropout {}: {}", p, e)))
}
