//! Recurrent stack and initialization shared by the RNN taggers.

mod lstm;

pub use lstm::StackedLstm;

use mlx_rs::{module::ModuleParameters, nn};

use crate::error::{PuncError, Result};

/// Redraw every parameter of `module` from `U(-init_scale, init_scale)`.
pub fn init_uniform<M: ModuleParameters>(module: &mut M, init_scale: f32) -> Result<()> {
    for param in module.parameters_mut().flatten().into_values() {
        let shape = param.shape().to_vec();
        *param = mlx_rs::random::uniform::<_, f32>(-init_scale, init_scale, &shape[..], None)?;
    }
    Ok(())
}

/// Framework dropout with drop probability `p`.
pub fn dropout(p: f32) -> Result<nn::Dropout> {
    nn::DropoutBuilder::new()
        .p(p)
        .build()
        .map_err(|e| PuncError::Config(format!("dropout {}: {}", p, e)))
}
