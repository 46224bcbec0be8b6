//! 1D convolution with optional weight normalization.
//!
//! Weight normalization reparametrises the kernel as `W = g * (v / ||v||)`
//! where `g` holds one magnitude per output channel. It is folded back into a
//! plain kernel with [`Conv1d::remove_weight_norm`] before inference.

use crate::error::Result;
use mlx_rs::{macros::ModuleParameters, module::Param, Array};

/// Convolution options.
#[derive(Debug, Clone, Copy)]
pub struct Conv1dConfig {
    /// Zero padding on both sides.
    pub padding: i32,
    /// Kernel dilation.
    pub dilation: i32,
    /// Whether to add a bias.
    pub bias: bool,
    /// Whether to weight normalise the kernel.
    pub weight_norm: bool,
}

impl Default for Conv1dConfig {
    fn default() -> Self {
        Self {
            padding: 0,
            dilation: 1,
            bias: true,
            weight_norm: false,
        }
    }
}

impl Conv1dConfig {
    /// Set padding.
    pub fn padding(mut self, padding: i32) -> Self {
        self.padding = padding;
        self
    }

    /// Set dilation.
    pub fn dilation(mut self, dilation: i32) -> Self {
        self.dilation = dilation;
        self
    }

    /// Enable or disable the bias.
    pub fn bias(mut self, bias: bool) -> Self {
        self.bias = bias;
        self
    }

    /// Enable or disable weight normalization.
    pub fn weight_norm(mut self, weight_norm: bool) -> Self {
        self.weight_norm = weight_norm;
        self
    }
}

/// 1D convolution over `[batch, channels, length]`.
#[derive(Debug, ModuleParameters)]
pub struct Conv1d {
    /// Kernel `[out, in, k]`; the direction `v` when weight normalised.
    #[param]
    pub weight: Param<Array>,
    /// Per-output-channel magnitude `[out, 1, 1]`.
    #[param]
    pub weight_g: Param<Option<Array>>,
    /// Bias `[out]`.
    #[param]
    pub bias: Param<Option<Array>>,
    /// Zero padding on both sides.
    pub padding: i32,
    /// Kernel dilation.
    pub dilation: i32,
}

impl Conv1d {
    /// Create a convolution with Kaiming-uniform initialization.
    pub fn new(
        in_channels: i32,
        out_channels: i32,
        kernel_size: i32,
        config: Conv1dConfig,
    ) -> Result<Self> {
        let fan_in = in_channels * kernel_size;
        let bound = (1.0 / fan_in as f32).sqrt();
        let weight = mlx_rs::random::uniform::<_, f32>(
            -bound,
            bound,
            &[out_channels, in_channels, kernel_size],
            None,
        )?;
        Self::from_weight(weight, config)
    }

    /// Create a convolution around an explicit initial kernel `[out, in, k]`.
    pub fn from_weight(weight: Array, config: Conv1dConfig) -> Result<Self> {
        let out_channels = weight.dim(0);
        let weight_g = if config.weight_norm {
            Some(weight_norm(&weight)?)
        } else {
            None
        };
        let bias = if config.bias {
            Some(mlx_rs::ops::zeros::<f32>(&[out_channels])?)
        } else {
            None
        };
        Ok(Self {
            weight: Param::new(weight),
            weight_g: Param::new(weight_g),
            bias: Param::new(bias),
            padding: config.padding,
            dilation: config.dilation,
        })
    }

    /// Whether the kernel is currently weight normalised.
    pub fn is_weight_normed(&self) -> bool {
        self.weight_g.value.is_some()
    }

    /// Effective kernel.
    pub fn kernel(&self) -> Result<Array> {
        let v = self.weight.as_ref();
        match self.weight_g.value.as_ref() {
            Some(g) => {
                let norm = weight_norm(v)?;
                Ok(v.divide(&norm)?.multiply(g)?)
            }
            None => Ok(v.clone()),
        }
    }

    /// Fold `g` into the kernel and drop the reparametrisation.
    pub fn remove_weight_norm(&mut self) -> Result<()> {
        if self.is_weight_normed() {
            let kernel = self.kernel()?;
            *self.weight = kernel;
            self.weight_g.value = None;
        }
        Ok(())
    }

    /// Forward pass.
    ///
    /// # Arguments
    /// * `x` - Input tensor [batch, in_channels, length] (NCL format)
    ///
    /// # Returns
    /// Output tensor [batch, out_channels, new_length] (NCL format)
    pub fn forward(&self, x: &Array) -> Result<Array> {
        let weight = self.kernel()?;

        // MLX conv1d works on NLC input and OKI weights.
        let x_nlc = x.transpose_axes(&[0, 2, 1])?;
        let weight_oki = weight.transpose_axes(&[0, 2, 1])?;
        let output = mlx_rs::ops::conv1d(&x_nlc, &weight_oki, 1, self.padding, self.dilation, 1)?;
        let output = output.transpose_axes(&[0, 2, 1])?;

        match self.bias.value.as_ref() {
            Some(bias) => {
                let bias = bias.reshape(&[1, -1, 1])?;
                Ok(output.add(&bias)?)
            }
            None => Ok(output),
        }
    }
}

/// L2 norm over every axis but the first, shaped `[out, 1, 1]`.
fn weight_norm(weight: &Array) -> Result<Array> {
    let sum_sq = weight.square()?.sum_axes(&[1, 2], Some(true))?;
    let eps = Array::from_f32(1e-12);
    Ok(sum_sq.sqrt()?.add(&eps)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use mlx_rs::module::ModuleParameters;

    #[test]
    fn test_conv1d_same_padding_shape() {
        let conv = Conv1d::new(4, 8, 3, Conv1dConfig::default().padding(1)).unwrap();
        let x = mlx_rs::random::normal::<f32>(&[2, 4, 16], None, None, None).unwrap();
        let y = conv.forward(&x).unwrap();
        y.eval().unwrap();
        assert_eq!(y.shape(), &[2, 8, 16]);
    }

    #[test]
    fn test_dilated_valid_shape() {
        let conv = Conv1d::new(2, 2, 3, Conv1dConfig::default().dilation(4).bias(false)).unwrap();
        let x = mlx_rs::random::normal::<f32>(&[1, 2, 20], None, None, None).unwrap();
        let y = conv.forward(&x).unwrap();
        // 20 - 4 * (3 - 1)
        assert_eq!(y.shape(), &[1, 2, 12]);
    }

    #[test]
    fn test_weight_norm_params_and_removal() {
        let mut conv = Conv1d::new(2, 4, 3, Conv1dConfig::default().weight_norm(true)).unwrap();
        let names: Vec<String> = conv
            .parameters()
            .flatten()
            .keys()
            .map(|k| k.to_string())
            .collect();
        assert!(names.contains(&"weight_g".to_string()));
        assert!(names.contains(&"bias".to_string()));

        let x = mlx_rs::random::normal::<f32>(&[1, 2, 8], None, None, None).unwrap();
        let before = conv.forward(&x).unwrap();
        conv.remove_weight_norm().unwrap();
        assert!(!conv.is_weight_normed());
        let after = conv.forward(&x).unwrap();

        let diff = before.subtract(&after).unwrap().abs().unwrap().max(None).unwrap();
        diff.eval().unwrap();
        assert!(diff.item::<f32>() < 1e-5);
    }

    #[test]
    fn test_from_weight_keeps_kernel() {
        let weight = Array::from_slice(&[1.0f32 / 3.0; 3], &[1, 1, 3]);
        let conv = Conv1d::from_weight(weight, Conv1dConfig::default().padding(1).bias(false)).unwrap();
        let x = Array::from_slice(&[3.0f32, 3.0, 3.0, 3.0], &[1, 1, 4]);
        let y = conv.forward(&x).unwrap();
        y.eval().unwrap();
        let values = y.as_slice::<f32>();
        assert!((values[1] - 3.0).abs() < 1e-5);
        assert!((values[0] - 2.0).abs() < 1e-5);
    }
}
