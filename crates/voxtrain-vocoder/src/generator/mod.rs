//! Parallel WaveGAN generator.
//!
//! A non-autoregressive WaveNet: Gaussian noise is transformed into a
//! waveform by a stack of dilated, gated residual blocks conditioned on
//! upsampled mel features.

use crate::config::GeneratorParams;
use crate::error::{Result, VocoderError};
use crate::nn::{dropout, Conv1d, Conv1dConfig};
use mlx_rs::module::Module;
use mlx_rs::ops::indexing::IndexOp;
use mlx_rs::{macros::ModuleParameters, nn, Array};

/// Mel upsampler: a context-removing convolution followed by nearest-neighbour
/// stretching and smoothing per scale.
#[derive(Debug, ModuleParameters)]
pub struct ConvInUpsampleNetwork {
    /// Valid convolution over `2 * aux_context_window + 1` frames.
    #[param]
    pub conv_in: Conv1d,
    /// One smoothing kernel per scale, shared across channels.
    #[param]
    pub up_layers: Vec<Conv1d>,
    /// Upsampling factors.
    pub scales: Vec<i32>,
}

impl ConvInUpsampleNetwork {
    /// Build from generator parameters.
    pub fn new(params: &GeneratorParams) -> Result<Self> {
        let conv_in = Conv1d::new(
            params.aux_channels,
            params.aux_channels,
            2 * params.aux_context_window + 1,
            Conv1dConfig::default()
                .bias(false)
                .weight_norm(params.use_weight_norm),
        )?;

        let mut up_layers = Vec::with_capacity(params.upsample_scales.len());
        for &scale in &params.upsample_scales {
            let kernel = 2 * scale + 1;
            let weight = mlx_rs::ops::ones::<f32>(&[1, 1, kernel])?
                .multiply(&Array::from_f32(1.0 / kernel as f32))?;
            up_layers.push(Conv1d::from_weight(
                weight,
                Conv1dConfig::default()
                    .padding(scale)
                    .bias(false)
                    .weight_norm(params.use_weight_norm),
            )?);
        }

        Ok(Self {
            conv_in,
            up_layers,
            scales: params.upsample_scales.clone(),
        })
    }

    /// `[batch, aux, frames + 2 * context]` → `[batch, aux, frames * hop]`.
    pub fn forward(&self, c: &Array) -> Result<Array> {
        let mut c = self.conv_in.forward(c)?;
        for (layer, &scale) in self.up_layers.iter().zip(&self.scales) {
            let (batch, channels, frames) = (c.dim(0), c.dim(1), c.dim(2));
            // Nearest-neighbour stretch along time.
            let stretched = c.reshape(&[batch, channels, frames, 1])?;
            let stretched = mlx_rs::ops::broadcast_to(&stretched, &[batch, channels, frames, scale])?
                .reshape(&[batch * channels, 1, frames * scale])?;
            c = layer
                .forward(&stretched)?
                .reshape(&[batch, channels, frames * scale])?;
        }
        Ok(c)
    }

    fn convs_mut(&mut self) -> impl Iterator<Item = &mut Conv1d> {
        std::iter::once(&mut self.conv_in).chain(self.up_layers.iter_mut())
    }
}

/// Dilated residual block with gated activation.
#[derive(Debug, ModuleParameters)]
pub struct ResidualBlock {
    /// Dilated convolution to the gate channels.
    #[param]
    pub conv: Conv1d,
    /// 1x1 projection of the local conditioning.
    #[param]
    pub conv1x1_aux: Conv1d,
    /// 1x1 projection back to the residual channels.
    #[param]
    pub conv1x1_out: Conv1d,
    /// 1x1 projection to the skip channels.
    #[param]
    pub conv1x1_skip: Conv1d,
    /// Dropout before the dilated convolution.
    pub dropout: nn::Dropout,
}

impl ResidualBlock {
    /// Build a block with the given dilation.
    pub fn new(params: &GeneratorParams, dilation: i32) -> Result<Self> {
        let wn = params.use_weight_norm;
        let padding = (params.kernel_size - 1) / 2 * dilation;
        let gate_out = params.gate_channels / 2;
        let base = Conv1dConfig::default().bias(params.bias).weight_norm(wn);

        Ok(Self {
            conv: Conv1d::new(
                params.residual_channels,
                params.gate_channels,
                params.kernel_size,
                base.padding(padding).dilation(dilation),
            )?,
            conv1x1_aux: Conv1d::new(
                params.aux_channels,
                params.gate_channels,
                1,
                Conv1dConfig::default().bias(false).weight_norm(wn),
            )?,
            conv1x1_out: Conv1d::new(gate_out, params.residual_channels, 1, base)?,
            conv1x1_skip: Conv1d::new(gate_out, params.skip_channels, 1, base)?,
            dropout: dropout(params.dropout)?,
        })
    }

    /// Returns `(residual_output, skip)`.
    pub fn forward(&mut self, x: &Array, c: &Array) -> Result<(Array, Array)> {
        let residual = x;
        let h = self.dropout.forward(x)?;
        let h = self.conv.forward(&h)?;
        let h = h.add(&self.conv1x1_aux.forward(c)?)?;

        let half = h.dim(1) / 2;
        let xa = h.index((.., ..half, ..));
        let xb = h.index((.., half.., ..));
        let gated = mlx_rs::ops::tanh(&xa)?.multiply(&mlx_rs::ops::sigmoid(&xb)?)?;

        let skip = self.conv1x1_skip.forward(&gated)?;
        let out = self
            .conv1x1_out
            .forward(&gated)?
            .add(residual)?
            .multiply(&Array::from_f32(0.5f32.sqrt()))?;
        Ok((out, skip))
    }

    fn convs_mut(&mut self) -> impl Iterator<Item = &mut Conv1d> {
        [
            &mut self.conv,
            &mut self.conv1x1_aux,
            &mut self.conv1x1_out,
            &mut self.conv1x1_skip,
        ]
        .into_iter()
    }
}

/// Parallel WaveGAN generator.
///
/// Converts noise `[batch, in_channels, samples]` and mel features
/// `[batch, aux_channels, frames + 2 * aux_context_window]` into a waveform
/// `[batch, out_channels, samples]` with `samples = frames * hop_size`.
#[derive(Debug, ModuleParameters)]
pub struct PwgGenerator {
    /// 1x1 input projection.
    #[param]
    pub first_conv: Conv1d,
    /// Mel upsampler.
    #[param]
    pub upsample_net: ConvInUpsampleNetwork,
    /// Residual blocks.
    #[param]
    pub conv_layers: Vec<ResidualBlock>,
    /// Output head convolutions (each preceded by ReLU).
    #[param]
    pub last_conv_layers: Vec<Conv1d>,
    /// Architecture.
    pub params: GeneratorParams,
}

impl PwgGenerator {
    /// Build a generator.
    pub fn new(params: GeneratorParams) -> Result<Self> {
        params.validate()?;
        let wn = params.use_weight_norm;
        let base = Conv1dConfig::default().bias(params.bias).weight_norm(wn);

        let first_conv = Conv1d::new(params.in_channels, params.residual_channels, 1, base)?;
        let upsample_net = ConvInUpsampleNetwork::new(&params)?;

        let layers_per_stack = params.layers / params.stacks;
        let conv_layers = (0..params.layers)
            .map(|layer| ResidualBlock::new(&params, 1 << (layer % layers_per_stack)))
            .collect::<Result<Vec<_>>>()?;

        let last_conv_layers = vec![
            Conv1d::new(params.skip_channels, params.skip_channels, 1, base)?,
            Conv1d::new(params.skip_channels, params.out_channels, 1, base)?,
        ];

        tracing::debug!(
            layers = params.layers,
            stacks = params.stacks,
            hop_size = params.hop_size(),
            "Built Parallel WaveGAN generator"
        );

        Ok(Self {
            first_conv,
            upsample_net,
            conv_layers,
            last_conv_layers,
            params,
        })
    }

    /// Total upsampling factor.
    pub fn hop_size(&self) -> i32 {
        self.params.hop_size()
    }

    /// Toggle dropout in every residual block.
    pub fn set_training(&mut self, training: bool) {
        for block in &mut self.conv_layers {
            block.dropout.training_mode(training);
        }
    }

    /// Forward pass.
    pub fn forward(&mut self, noise: &Array, mel: &Array) -> Result<Array> {
        let c = self.upsample_net.forward(mel)?;
        if c.dim(2) != noise.dim(2) {
            return Err(VocoderError::ShapeMismatch {
                expected: vec![noise.dim(0), self.params.aux_channels, noise.dim(2)],
                actual: c.shape().to_vec(),
            });
        }

        let mut x = self.first_conv.forward(noise)?;
        let mut skips: Option<Array> = None;
        let layers = self.conv_layers.len();
        for block in &mut self.conv_layers {
            let (out, skip) = block.forward(&x, &c)?;
            x = out;
            skips = Some(match skips {
                Some(acc) => acc.add(&skip)?,
                None => skip,
            });
        }
        let skips = skips.ok_or_else(|| VocoderError::Config("generator has no layers".into()))?;
        let mut x = skips.multiply(&Array::from_f32((1.0 / layers as f32).sqrt()))?;

        for conv in &self.last_conv_layers {
            x = conv.forward(&nn::relu(&x)?)?;
        }
        Ok(x)
    }

    /// Synthesize a waveform from mel features `[frames, aux_channels]`.
    ///
    /// The mel is edge-padded by `aux_context_window` frames on both sides.
    ///
    /// # Returns
    /// Waveform `[frames * hop_size]`
    pub fn inference(&mut self, mel: &Array) -> Result<Array> {
        if mel.ndim() != 2 || mel.dim(1) != self.params.aux_channels {
            return Err(VocoderError::ShapeMismatch {
                expected: vec![-1, self.params.aux_channels],
                actual: mel.shape().to_vec(),
            });
        }
        let frames = mel.dim(0);
        let aux = self.params.aux_channels;
        let ctx = self.params.aux_context_window;

        let c = mel.transpose_axes(&[1, 0])?.reshape(&[1, aux, frames])?;
        let c = if ctx > 0 {
            let left = mlx_rs::ops::broadcast_to(&c.index((.., .., ..1)), &[1, aux, ctx])?;
            let right = mlx_rs::ops::broadcast_to(&c.index((.., .., -1..)), &[1, aux, ctx])?;
            mlx_rs::ops::concatenate_axis(&[&left, &c, &right], 2)?
        } else {
            c
        };

        let noise = mlx_rs::random::normal::<f32>(
            &[1, self.params.in_channels, frames * self.hop_size()],
            None,
            None,
            None,
        )?;
        Ok(self.forward(&noise, &c)?.reshape(&[-1])?)
    }

    /// Fold weight normalization into every kernel.
    pub fn remove_weight_norm(&mut self) -> Result<()> {
        self.first_conv.remove_weight_norm()?;
        for conv in self.upsample_net.convs_mut() {
            conv.remove_weight_norm()?;
        }
        for block in &mut self.conv_layers {
            for conv in block.convs_mut() {
                conv.remove_weight_norm()?;
            }
        }
        for conv in &mut self.last_conv_layers {
            conv.remove_weight_norm()?;
        }
        tracing::debug!("Removed weight norm from generator");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mlx_rs::module::ModuleParameters;

    fn tiny_params() -> GeneratorParams {
        GeneratorParams {
            layers: 4,
            stacks: 2,
            residual_channels: 8,
            gate_channels: 16,
            skip_channels: 8,
            aux_channels: 6,
            aux_context_window: 2,
            upsample_scales: vec![2, 4],
            ..Default::default()
        }
    }

    #[test]
    fn test_forward_shape() {
        let mut gen = PwgGenerator::new(tiny_params()).unwrap();
        let frames = 5;
        let noise = mlx_rs::random::normal::<f32>(&[2, 1, frames * 8], None, None, None).unwrap();
        let mel = mlx_rs::random::normal::<f32>(&[2, 6, frames + 4], None, None, None).unwrap();
        let wav = gen.forward(&noise, &mel).unwrap();
        wav.eval().unwrap();
        assert_eq!(wav.shape(), &[2, 1, 40]);
    }

    #[test]
    fn test_mismatched_lengths_rejected() {
        let mut gen = PwgGenerator::new(tiny_params()).unwrap();
        let noise = mlx_rs::random::normal::<f32>(&[1, 1, 33], None, None, None).unwrap();
        let mel = mlx_rs::random::normal::<f32>(&[1, 6, 9], None, None, None).unwrap();
        assert!(matches!(
            gen.forward(&noise, &mel),
            Err(VocoderError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_inference_length() {
        let mut gen = PwgGenerator::new(tiny_params()).unwrap();
        gen.remove_weight_norm().unwrap();
        gen.set_training(false);
        let mel = mlx_rs::random::normal::<f32>(&[7, 6], None, None, None).unwrap();
        let wav = gen.inference(&mel).unwrap();
        wav.eval().unwrap();
        assert_eq!(wav.shape(), &[56]);
    }

    #[test]
    fn test_dilation_cycle_and_params() {
        let gen = PwgGenerator::new(tiny_params()).unwrap();
        let dilations: Vec<i32> = gen.conv_layers.iter().map(|b| b.conv.dilation).collect();
        assert_eq!(dilations, vec![1, 2, 1, 2]);

        let params = gen.parameters().flatten();
        assert!(params.contains_key("conv_layers.0.conv.weight_g"));
        assert!(params.contains_key("upsample_net.up_layers.1.weight"));
        assert!(!params.contains_key("conv_layers.0.conv1x1_aux.bias"));
    }

    #[test]
    fn test_eval_mode_is_deterministic() {
        let mut gen = PwgGenerator::new(GeneratorParams {
            dropout: 0.5,
            ..tiny_params()
        })
        .unwrap();
        let noise = mlx_rs::random::normal::<f32>(&[1, 1, 24], None, None, None).unwrap();
        let mel = mlx_rs::random::normal::<f32>(&[1, 6, 7], None, None, None).unwrap();

        gen.set_training(false);
        let a = gen.forward(&noise, &mel).unwrap();
        let b = gen.forward(&noise, &mel).unwrap();
        let diff = a.subtract(&b).unwrap().abs().unwrap().max(None).unwrap();
        assert_eq!(diff.item::<f32>(), 0.0);

        gen.set_training(true);
        assert!(gen.conv_layers.iter().all(|b| b.dropout.training));
    }
}
