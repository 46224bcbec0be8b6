//! Parallel WaveGAN discriminator.
//!
//! A stack of dilated 1D convolutions with LeakyReLU that scores every
//! waveform sample as real or generated.

use crate::config::DiscriminatorParams;
use crate::error::{Result, VocoderError};
use crate::nn::{Conv1d, Conv1dConfig};
use mlx_rs::{macros::ModuleParameters, nn, Array};

/// Fully convolutional waveform discriminator.
#[derive(Debug, ModuleParameters)]
pub struct PwgDiscriminator {
    /// `layers - 1` hidden convolutions followed by the output convolution.
    #[param]
    pub conv_layers: Vec<Conv1d>,
    /// LeakyReLU slope.
    pub negative_slope: f32,
}

impl PwgDiscriminator {
    /// Build a discriminator.
    pub fn new(params: &DiscriminatorParams) -> Result<Self> {
        if params.layers < 2 {
            return Err(VocoderError::Config(format!(
                "discriminator needs at least 2 layers, got {}",
                params.layers
            )));
        }
        if params.kernel_size % 2 == 0 {
            return Err(VocoderError::Config(format!(
                "kernel_size must be odd, got {}",
                params.kernel_size
            )));
        }

        let base = Conv1dConfig::default()
            .bias(params.bias)
            .weight_norm(params.use_weight_norm);
        let mut conv_layers = Vec::with_capacity(params.layers as usize);
        for i in 0..params.layers - 1 {
            let (in_channels, dilation) = if i == 0 {
                (params.in_channels, 1)
            } else if params.dilation_factor == 1 {
                (params.conv_channels, i)
            } else {
                (params.conv_channels, params.dilation_factor.pow(i as u32))
            };
            let padding = (params.kernel_size - 1) / 2 * dilation;
            conv_layers.push(Conv1d::new(
                in_channels,
                params.conv_channels,
                params.kernel_size,
                base.padding(padding).dilation(dilation),
            )?);
        }
        conv_layers.push(Conv1d::new(
            params.conv_channels,
            params.out_channels,
            params.kernel_size,
            base.padding((params.kernel_size - 1) / 2),
        )?);

        Ok(Self {
            conv_layers,
            negative_slope: params.negative_slope,
        })
    }

    /// Score a waveform `[batch, 1, samples]`; returns `[batch, 1, samples]`.
    pub fn forward(&self, x: &Array) -> Result<Array> {
        let last = self.conv_layers.len() - 1;
        let mut x = x.clone();
        for (i, conv) in self.conv_layers.iter().enumerate() {
            x = conv.forward(&x)?;
            if i < last {
                x = nn::leaky_relu(&x, self.negative_slope)?;
            }
        }
        Ok(x)
    }

    /// Fold weight normalization into every kernel.
    pub fn remove_weight_norm(&mut self) -> Result<()> {
        for conv in &mut self.conv_layers {
            conv.remove_weight_norm()?;
        }
        Ok(())
    }
}
