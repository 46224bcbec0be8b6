//! Audio processing utilities for the vocoder.
//!
//! MLX-native STFT used by the spectral losses.

mod stft;

pub use stft::*;
