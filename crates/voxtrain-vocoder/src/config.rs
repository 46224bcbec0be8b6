//! Parallel WaveGAN configuration.
//!
//! Every field has a serde default so a YAML file only needs to list what it
//! changes. The defaults reproduce the 24 kHz CSMSC recipe.

use serde::{Deserialize, Serialize};

use crate::error::{Result, VocoderError};

/// Generator hyper-parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneratorParams {
    /// Noise input channels.
    pub in_channels: i32,
    /// Waveform output channels.
    pub out_channels: i32,
    /// Kernel size of the dilated convolutions.
    pub kernel_size: i32,
    /// Number of residual blocks.
    pub layers: i32,
    /// Number of dilation cycles.
    pub stacks: i32,
    /// Residual channels.
    pub residual_channels: i32,
    /// Gate channels (split in half for tanh/sigmoid).
    pub gate_channels: i32,
    /// Skip channels.
    pub skip_channels: i32,
    /// Mel feature dimension.
    pub aux_channels: i32,
    /// Context frames on each side of the mel input.
    pub aux_context_window: i32,
    /// Dropout before every dilated convolution.
    pub dropout: f32,
    /// Whether convolutions carry a bias.
    pub bias: bool,
    /// Whether convolutions are weight normalised.
    pub use_weight_norm: bool,
    /// Upsampling factors; their product is the hop size.
    pub upsample_scales: Vec<i32>,
}

impl Default for GeneratorParams {
    fn default() -> Self {
        Self {
            in_channels: 1,
            out_channels: 1,
            kernel_size: 3,
            layers: 30,
            stacks: 3,
            residual_channels: 64,
            gate_channels: 128,
            skip_channels: 64,
            aux_channels: 80,
            aux_context_window: 2,
            dropout: 0.0,
            bias: true,
            use_weight_norm: true,
            upsample_scales: vec![4, 4, 4, 4],
        }
    }
}

impl GeneratorParams {
    /// Total upsampling factor.
    pub fn hop_size(&self) -> i32 {
        self.upsample_scales.iter().product()
    }

    /// Check structural constraints.
    pub fn validate(&self) -> Result<()> {
        if self.stacks <= 0 || self.layers % self.stacks != 0 {
            return Err(VocoderError::Config(format!(
                "layers ({}) must be a positive multiple of stacks ({})",
                self.layers, self.stacks
            )));
        }
        if self.gate_channels % 2 != 0 {
            return Err(VocoderError::Config(format!(
                "gate_channels must be even, got {}",
                self.gate_channels
            )));
        }
        if self.kernel_size % 2 == 0 {
            return Err(VocoderError::Config(format!(
                "kernel_size must be odd, got {}",
                self.kernel_size
            )));
        }
        if self.upsample_scales.is_empty() || self.upsample_scales.iter().any(|&s| s <= 0) {
            return Err(VocoderError::Config(format!(
                "invalid upsample_scales {:?}",
                self.upsample_scales
            )));
        }
        Ok(())
    }
}

/// Discriminator hyper-parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscriminatorParams {
    /// Waveform input channels.
    pub in_channels: i32,
    /// Output channels.
    pub out_channels: i32,
    /// Kernel size.
    pub kernel_size: i32,
    /// Number of convolutions.
    pub layers: i32,
    /// Hidden channels.
    pub conv_channels: i32,
    /// Dilation growth; 1 means linear growth.
    pub dilation_factor: i32,
    /// LeakyReLU negative slope.
    pub negative_slope: f32,
    /// Whether convolutions carry a bias.
    pub bias: bool,
    /// Whether convolutions are weight normalised.
    pub use_weight_norm: bool,
}

impl Default for DiscriminatorParams {
    fn default() -> Self {
        Self {
            in_channels: 1,
            out_channels: 1,
            kernel_size: 3,
            layers: 10,
            conv_channels: 64,
            dilation_factor: 1,
            negative_slope: 0.2,
            bias: true,
            use_weight_norm: true,
        }
    }
}

/// Multi-resolution STFT loss resolutions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StftLossParams {
    /// FFT sizes.
    pub fft_sizes: Vec<i32>,
    /// Hop sizes.
    pub hop_sizes: Vec<i32>,
    /// Window lengths.
    pub win_lengths: Vec<i32>,
}

impl Default for StftLossParams {
    fn default() -> Self {
        Self {
            fft_sizes: vec![1024, 2048, 512],
            hop_sizes: vec![120, 240, 50],
            win_lengths: vec![600, 1200, 240],
        }
    }
}

/// Adam settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerParams {
    /// Denominator epsilon.
    pub epsilon: f32,
    /// L2 weight decay.
    pub weight_decay: f32,
}

impl Default for OptimizerParams {
    fn default() -> Self {
        Self {
            epsilon: 1e-6,
            weight_decay: 0.0,
        }
    }
}

/// Step decay schedule settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerParams {
    /// Initial learning rate.
    pub learning_rate: f64,
    /// Iterations between decays.
    pub step_size: usize,
    /// Decay factor.
    pub gamma: f64,
}

impl Default for SchedulerParams {
    fn default() -> Self {
        Self {
            learning_rate: 1e-4,
            step_size: 200_000,
            gamma: 0.5,
        }
    }
}

/// Full Parallel WaveGAN recipe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PwgConfig {
    /// Sample rate.
    pub fs: u32,
    /// Hop size in samples; must equal the generator's upsampling factor.
    pub n_shift: usize,
    /// Generator architecture.
    pub generator_params: GeneratorParams,
    /// Discriminator architecture.
    pub discriminator_params: DiscriminatorParams,
    /// STFT loss resolutions.
    pub stft_loss_params: StftLossParams,
    /// Utterances per batch, per rank.
    pub batch_size: usize,
    /// Waveform samples per training clip.
    pub batch_max_steps: usize,
    /// Accepted for compatibility; loading is synchronous.
    pub num_workers: usize,
    /// Generator optimizer.
    pub generator_optimizer_params: OptimizerParams,
    /// Generator schedule.
    pub generator_scheduler_params: SchedulerParams,
    /// Generator gradient clip norm; non-positive disables clipping.
    pub generator_grad_norm: f32,
    /// Discriminator optimizer.
    pub discriminator_optimizer_params: OptimizerParams,
    /// Discriminator schedule.
    pub discriminator_scheduler_params: SchedulerParams,
    /// Discriminator gradient clip norm; non-positive disables clipping.
    pub discriminator_grad_norm: f32,
    /// Generator-only iterations before adversarial training starts.
    pub discriminator_train_start_steps: usize,
    /// Adversarial loss weight.
    pub lambda_adv: f32,
    /// Total iterations.
    pub train_max_steps: usize,
    /// Iterations between snapshots.
    pub save_interval_steps: usize,
    /// Iterations between dev-set evaluations.
    pub eval_interval_steps: usize,
    /// Iterations between log lines.
    pub log_interval_steps: usize,
    /// Snapshots kept on disk.
    pub num_snapshots: usize,
    /// Random seed.
    pub seed: u64,
}

impl Default for PwgConfig {
    fn default() -> Self {
        Self {
            fs: 24000,
            n_shift: 300,
            generator_params: GeneratorParams {
                upsample_scales: vec![4, 5, 3, 5],
                ..Default::default()
            },
            discriminator_params: DiscriminatorParams::default(),
            stft_loss_params: StftLossParams::default(),
            batch_size: 8,
            batch_max_steps: 25500,
            num_workers: 2,
            generator_optimizer_params: OptimizerParams::default(),
            generator_scheduler_params: SchedulerParams::default(),
            generator_grad_norm: 10.0,
            discriminator_optimizer_params: OptimizerParams::default(),
            discriminator_scheduler_params: SchedulerParams {
                learning_rate: 5e-5,
                ..Default::default()
            },
            discriminator_grad_norm: 1.0,
            discriminator_train_start_steps: 100_000,
            lambda_adv: 4.0,
            train_max_steps: 400_000,
            save_interval_steps: 5000,
            eval_interval_steps: 1000,
            log_interval_steps: 100,
            num_snapshots: 10,
            seed: 42,
        }
    }
}

impl PwgConfig {
    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        self.generator_params.validate()?;
        let hop = self.generator_params.hop_size() as usize;
        if hop != self.n_shift {
            return Err(VocoderError::Config(format!(
                "product of upsample_scales ({}) must equal n_shift ({})",
                hop, self.n_shift
            )));
        }
        if self.batch_max_steps == 0 || self.batch_max_steps % self.n_shift != 0 {
            return Err(VocoderError::Config(format!(
                "batch_max_steps ({}) must be a positive multiple of n_shift ({})",
                self.batch_max_steps, self.n_shift
            )));
        }
        let s = &self.stft_loss_params;
        if s.fft_sizes.len() != s.hop_sizes.len() || s.fft_sizes.len() != s.win_lengths.len() {
            return Err(VocoderError::Config(
                "stft_loss_params lists must have equal lengths".into(),
            ));
        }
        if self.batch_size == 0 {
            return Err(VocoderError::Config("batch_size must be positive".into()));
        }
        Ok(())
    }
}
