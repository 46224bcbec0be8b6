//! Parallel WaveGAN vocoder training on MLX.
//!
//! The generator turns Gaussian noise into a waveform, conditioned on an
//! upsampled mel spectrogram. It is first trained alone on a
//! multi-resolution STFT loss. After `discriminator_train_start_steps`
//! iterations a waveform discriminator joins and both networks are trained
//! adversarially with least-squares GAN losses.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use voxtrain_distributed::DistributedContext;
//! use voxtrain_vocoder::{train_pwg, PwgConfig, PwgPaths};
//!
//! let config: PwgConfig = voxtrain_core::load_yaml("conf/pwg.yaml")?;
//! let paths = PwgPaths {
//!     train_metadata: "dump/train/metadata.jsonl".into(),
//!     dev_metadata: "dump/dev/metadata.jsonl".into(),
//!     output: "exp/pwg".into(),
//! };
//! train_pwg(&config, &paths, Arc::new(DistributedContext::local()), None)?;
//! ```

#![warn(missing_docs)]
#![allow(clippy::too_many_arguments)]

pub mod audio;
pub mod config;
pub mod discriminator;
pub mod error;
pub mod evaluator;
pub mod experiment;
pub mod generator;
pub mod loss;
pub mod nn;
pub mod updater;

pub use config::*;
pub use discriminator::PwgDiscriminator;
pub use error::*;
pub use evaluator::PwgEvaluator;
pub use experiment::{load_generator, synthesize, train_pwg, PwgPaths, WaveMelLoader};
pub use generator::PwgGenerator;
pub use loss::{adversarial_loss, discriminator_loss, mse_loss, MultiResolutionStftLoss, StftLoss};
pub use updater::PwgUpdater;
