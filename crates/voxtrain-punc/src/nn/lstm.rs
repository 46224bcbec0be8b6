//! Stacked, optionally bidirectional LSTM over `[batch, time, features]`.
//!
//! Each layer is an `mlx_rs::nn::Lstm`. The backward direction runs a second
//! `Lstm` over the time-reversed input and flips its outputs back, so both
//! halves of a bidirectional output line up with the input positions.

use mlx_rs::{
    macros::ModuleParameters,
    module::Module,
    nn::{self, LstmInput},
    ops::concatenate_axis,
    Array,
};

use super::dropout;
use crate::error::Result;

fn reverse_time(x: &Array) -> Result<Array> {
    let time = x.dim(1);
    let order: Vec<i32> = (0..time).rev().collect();
    Ok(x.take_axis(&Array::from_slice(&order, &[time]), 1)?)
}

/// `num_layers` LSTM layers with dropout between them.
#[derive(Debug, ModuleParameters)]
pub struct StackedLstm {
    /// Left-to-right layers.
    #[param]
    pub forward_layers: Vec<nn::Lstm>,
    /// Right-to-left layers; empty when unidirectional.
    #[param]
    pub backward_layers: Vec<nn::Lstm>,
    dropout: nn::Dropout,
    hidden_size: i32,
}

impl StackedLstm {
    /// Create the stack. `dropout` is applied between layers while training.
    pub fn new(
        input_size: i32,
        hidden_size: i32,
        num_layers: i32,
        bidirectional: bool,
        dropout_p: f32,
    ) -> Result<Self> {
        let directions = if bidirectional { 2 } else { 1 };
        let mut forward_layers = Vec::with_capacity(num_layers as usize);
        let mut backward_layers = Vec::new();
        for layer in 0..num_layers {
            let layer_input = if layer == 0 {
                input_size
            } else {
                hidden_size * directions
            };
            forward_layers.push(nn::Lstm::new(layer_input, hidden_size)?);
            if bidirectional {
                backward_layers.push(nn::Lstm::new(layer_input, hidden_size)?);
            }
        }
        Ok(Self {
            forward_layers,
            backward_layers,
            dropout: dropout(dropout_p)?,
            hidden_size,
        })
    }

    /// Whether a backward direction is present.
    pub fn is_bidirectional(&self) -> bool {
        !self.backward_layers.is_empty()
    }

    /// Output feature size: `hidden` or `2 * hidden`.
    pub fn output_size(&self) -> i32 {
        if self.is_bidirectional() {
            2 * self.hidden_size
        } else {
            self.hidden_size
        }
    }

    /// Toggle inter-layer dropout.
    pub fn set_training(&mut self, training: bool) {
        self.dropout.training_mode(training);
    }

    /// Run all layers, returning `[batch, time, output_size]`.
    pub fn forward(&mut self, x: &Array) -> Result<Array> {
        let mut x = x.clone();
        for layer in 0..self.forward_layers.len() {
            if layer > 0 {
                x = self.dropout.forward(&x)?;
            }
            let (forward, _) = self.forward_layers[layer].forward(LstmInput::from(&x))?;
            x = match self.backward_layers.get_mut(layer) {
                Some(backward_layer) => {
                    let reversed = reverse_time(&x)?;
                    let (backward, _) = backward_layer.forward(LstmInput::from(&reversed))?;
                    concatenate_axis(&[&forward, &reverse_time(&backward)?], -1)?
                }
                None => forward,
            };
        }
        Ok(x)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mlx_rs::ops::indexing::IndexOp;

    #[test]
    fn test_output_shapes() {
        let x = mlx_rs::random::normal::<f32>(&[2, 5, 3], None, None, None).unwrap();

        let mut uni = StackedLstm::new(3, 4, 2, false, 0.0).unwrap();
        assert_eq!(uni.forward(&x).unwrap().shape(), &[2, 5, 4]);
        assert_eq!(uni.output_size(), 4);
        assert!(uni.backward_layers.is_empty());

        let mut bi = StackedLstm::new(3, 4, 2, true, 0.0).unwrap();
        assert_eq!(bi.forward(&x).unwrap().shape(), &[2, 5, 8]);
        assert_eq!(bi.forward_layers.len(), 2);
        assert_eq!(bi.backward_layers.len(), 2);
    }

    #[test]
    fn test_reverse_time() {
        let x = Array::from_slice(&[1.0f32, 2.0, 3.0], &[1, 3, 1]);
        let y = reverse_time(&x).unwrap();
        y.eval().unwrap();
        assert_eq!(y.as_slice::<f32>(), &[3.0, 2.0, 1.0]);
    }

    #[test]
    fn test_backward_half_sees_future_context() {
        let mut lstm = StackedLstm::new(1, 2, 1, true, 0.0).unwrap();
        let a = Array::from_slice(&[1.0f32, 0.0, 0.0], &[1, 3, 1]);
        let b = Array::from_slice(&[1.0f32, 0.0, 5.0], &[1, 3, 1]);
        let ya = lstm.forward(&a).unwrap();
        let yb = lstm.forward(&b).unwrap();

        // Forward half at t = 0 depends only on the first input.
        let diff = ya
            .index((.., 0, 0..2))
            .subtract(&yb.index((.., 0, 0..2)))
            .unwrap()
            .abs()
            .unwrap()
            .max(None)
            .unwrap();
        assert!(diff.item::<f32>() < 1e-6);

        // Backward half at t = 0 has read the whole sequence.
        let diff = ya
            .index((.., 0, 2..))
            .subtract(&yb.index((.., 0, 2..)))
            .unwrap()
            .abs()
            .unwrap()
            .max(None)
            .unwrap();
        assert!(diff.item::<f32>() > 1e-6);
    }
}
