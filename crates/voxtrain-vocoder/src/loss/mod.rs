//! Loss functions for Parallel WaveGAN training.
//!
//! - Multi-resolution STFT loss (spectral convergence + log magnitude)
//! - Least-squares adversarial losses

mod adversarial;
mod stft;

pub use adversarial::{adversarial_loss, discriminator_loss, mse_loss};
pub use stft::{MultiResolutionStftLoss, StftLoss};
