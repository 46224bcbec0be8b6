//! Gradient clipping and cross-rank gradient averaging.

use std::future::Future;
use std::rc::Rc;
use std::sync::Arc;

use mlx_rs::module::FlattenedModuleParam;
use mlx_rs::{Array, Dtype};
use tokio::runtime::{Builder, Handle, Runtime, RuntimeFlavor};
use voxtrain_distributed::DistributedContext;

use crate::error::{Result, TrainerError};

/// Scale gradients so their global L2 norm is at most `max_norm`.
///
/// Returns the norm before clipping. `max_norm <= 0` disables clipping.
pub fn clip_grad_global_norm(grads: &mut FlattenedModuleParam, max_norm: f32) -> Result<f32> {
    let mut total_norm_sq = 0.0_f32;
    for grad in grads.values() {
        let norm_sq = grad.square()?.sum(None)?;
        norm_sq.eval()?;
        total_norm_sq += norm_sq.item::<f32>();
    }
    let total_norm = total_norm_sq.sqrt();

    if max_norm > 0.0 && total_norm > max_norm {
        let scale = Array::from_f32(max_norm / (total_norm + 1e-6));
        for grad in grads.values_mut() {
            *grad = grad.multiply(&scale)?;
        }
    }

    Ok(total_norm)
}

/// Averages gradients across ranks.
///
/// Collective calls are async; this type blocks on them so the synchronous
/// training loops can use it. Inside a multi-thread tokio runtime it blocks
/// in place on the ambient handle, outside any runtime on a private
/// current-thread one. A current-thread runtime cannot be blocked from
/// within, so syncing from one fails with [`TrainerError::Distributed`].
pub struct GradientSync {
    ctx: Arc<DistributedContext>,
    fallback: Option<Runtime>,
}

impl GradientSync {
    /// Create a synchronizer over `ctx`.
    pub fn new(ctx: Arc<DistributedContext>) -> Result<Self> {
        let fallback = if Handle::try_current().is_err() && ctx.is_parallel() {
            Some(Builder::new_current_thread().enable_all().build()?)
        } else {
            None
        };
        Ok(Self { ctx, fallback })
    }

    /// Distributed context this synchronizer reduces over.
    pub fn context(&self) -> &Arc<DistributedContext> {
        &self.ctx
    }

    fn block_on<F: Future>(&self, fut: F) -> Result<F::Output> {
        if let Ok(handle) = Handle::try_current() {
            if handle.runtime_flavor() != RuntimeFlavor::MultiThread {
                return Err(TrainerError::Distributed(
                    "gradient sync inside a tokio runtime needs the multi-thread flavor".into(),
                ));
            }
            return Ok(tokio::task::block_in_place(|| handle.block_on(fut)));
        }
        match &self.fallback {
            Some(rt) => Ok(rt.block_on(fut)),
            None => Builder::new_current_thread()
                .enable_all()
                .build()
                .map(|rt| rt.block_on(fut))
                .map_err(TrainerError::from),
        }
    }

    /// Average `values` element-wise across ranks.
    pub fn all_reduce_mean(&self, values: &mut [f32]) -> Result<()> {
        if !self.ctx.is_parallel() {
            return Ok(());
        }
        self.block_on(self.ctx.all_reduce_mean_f32(values))?
            .map_err(|e| TrainerError::Distributed(e.to_string()))
    }

    /// Replace every gradient with its mean across ranks.
    ///
    /// Gradients are flattened in sorted key order so all ranks agree on the
    /// layout. No-op in single-process runs.
    pub fn sync(&self, grads: &mut FlattenedModuleParam) -> Result<()> {
        if !self.ctx.is_parallel() {
            return Ok(());
        }

        let mut keys: Vec<Rc<str>> = grads.keys().cloned().collect();
        keys.sort();

        let mut flat: Vec<f32> = Vec::new();
        let mut layout: Vec<(Rc<str>, Vec<i32>, usize)> = Vec::with_capacity(keys.len());
        for key in keys {
            let grad = grads[&key].as_dtype(Dtype::Float32)?;
            grad.eval()?;
            let values = grad.as_slice::<f32>();
            layout.push((key, grad.shape().to_vec(), values.len()));
            flat.extend_from_slice(values);
        }

        self.all_reduce_mean(&mut flat)?;

        let mut offset = 0;
        for (key, shape, len) in layout {
            grads.insert(key, Array::from_slice(&flat[offset..offset + len], &shape));
            offset += len;
        }
        tracing::trace!(elements = offset, "Synchronized gradients");
        Ok(())
    }
}

impl std::fmt::Debug for GradientSync {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GradientSync").field("ctx", &self.ctx).finish()
    }
}
