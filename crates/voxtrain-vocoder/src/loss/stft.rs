//! Spectral reconstruction losses.

use crate::audio::{squeeze_channel, stft_magnitude};
use crate::config::StftLossParams;
use crate::error::{Result, VocoderError};
use mlx_rs::Array;

/// Spectral convergence and log STFT magnitude loss at one resolution.
#[derive(Debug, Clone, Copy)]
pub struct StftLoss {
    /// FFT size.
    pub fft_size: i32,
    /// Hop size.
    pub hop_size: i32,
    /// Window length.
    pub win_length: i32,
}

impl StftLoss {
    /// Create a single-resolution loss.
    pub fn new(fft_size: i32, hop_size: i32, win_length: i32) -> Self {
        Self {
            fft_size,
            hop_size,
            win_length,
        }
    }

    /// Returns `(spectral_convergence, log_stft_magnitude)` for predicted `x`
    /// and ground truth `y`, both `[batch, samples]`.
    ///
    /// - spectral convergence: `‖|Y| - |X|‖_F / ‖|Y|‖_F`
    /// - log magnitude: `mean(|log|Y| - log|X||)`
    pub fn forward(&self, x: &Array, y: &Array) -> Result<(Array, Array)> {
        let x_mag = stft_magnitude(x, self.fft_size, self.hop_size, self.win_length)?;
        let y_mag = stft_magnitude(y, self.fft_size, self.hop_size, self.win_length)?;

        let num = y_mag.subtract(&x_mag)?.square()?.sum(None)?.sqrt()?;
        let den = y_mag.square()?.sum(None)?.sqrt()?;
        let sc = num.divide(&den)?;

        let mag = y_mag.log()?.subtract(&x_mag.log()?)?.abs()?.mean(None)?;
        Ok((sc, mag))
    }
}

/// [`StftLoss`] averaged over several resolutions.
#[derive(Debug, Clone)]
pub struct MultiResolutionStftLoss {
    losses: Vec<StftLoss>,
}

impl MultiResolutionStftLoss {
    /// Build from the configured resolutions.
    pub fn new(params: &StftLossParams) -> Result<Self> {
        let n = params.fft_sizes.len();
        if n == 0 || params.hop_sizes.len() != n || params.win_lengths.len() != n {
            return Err(VocoderError::Config(
                "STFT loss needs equally long, non-empty resolution lists".into(),
            ));
        }
        let losses = (0..n)
            .map(|i| StftLoss::new(params.fft_sizes[i], params.hop_sizes[i], params.win_lengths[i]))
            .collect();
        Ok(Self { losses })
    }

    /// Resolutions in use.
    pub fn resolutions(&self) -> &[StftLoss] {
        &self.losses
    }

    /// Returns mean `(spectral_convergence, log_stft_magnitude)`.
    ///
    /// Inputs may be `[batch, 1, samples]` or `[batch, samples]`.
    pub fn forward(&self, x: &Array, y: &Array) -> Result<(Array, Array)> {
        let x = squeeze_channel(x)?;
        let y = squeeze_channel(y)?;

        let mut sc_total = Array::from_f32(0.0);
        let mut mag_total = Array::from_f32(0.0);
        for loss in &self.losses {
            let (sc, mag) = loss.forward(&x, &y)?;
            sc_total = sc_total.add(&sc)?;
            mag_total = mag_total.add(&mag)?;
        }
        let n = Array::from_f32(self.losses.len() as f32);
        Ok((sc_total.divide(&n)?, mag_total.divide(&n)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small() -> MultiResolutionStftLoss {
        MultiResolutionStftLoss::new(&StftLossParams {
            fft_sizes: vec![64, 128],
            hop_sizes: vec![16, 32],
            win_lengths: vec![40, 80],
        })
        .unwrap()
    }

    #[test]
    fn test_identical_signals_have_zero_loss() {
        let y = mlx_rs::random::normal::<f32>(&[2, 1, 512], None, None, None).unwrap();
        let (sc, mag) = small().forward(&y, &y).unwrap();
        assert!(sc.item::<f32>().abs() < 1e-6);
        assert!(mag.item::<f32>().abs() < 1e-6);
    }

    #[test]
    fn test_different_signals_have_positive_loss() {
        let x = mlx_rs::random::normal::<f32>(&[2, 512], None, None, None).unwrap();
        let y = mlx_rs::random::normal::<f32>(&[2, 512], None, None, None).unwrap();
        let (sc, mag) = small().forward(&x, &y).unwrap();
        assert!(sc.item::<f32>() > 0.1);
        assert!(mag.item::<f32>() > 0.1);
    }

    #[test]
    fn test_mismatched_lists_rejected() {
        let params = StftLossParams {
            fft_sizes: vec![64],
            hop_sizes: vec![16, 32],
            win_lengths: vec![40],
        };
        assert!(MultiResolutionStftLoss::new(&params).is_err());
    }
}
