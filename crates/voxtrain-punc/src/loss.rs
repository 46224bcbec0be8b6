//! Token classification losses.

use mlx_rs::{Array, Dtype};

use crate::error::{PuncError, Result};

fn log_softmax(x: &Array) -> Result<Array> {
    let max_x = x.max_axes(&[-1], Some(true))?;
    let shifted = x.subtract(&max_x)?;
    let log_sum_exp = shifted.exp()?.sum_axes(&[-1], Some(true))?.log()?;
    Ok(shifted.subtract(&log_sum_exp)?)
}

/// Negative log-likelihood of `labels` under `scores`, one value per row.
///
/// `scores` is `[N, C]`, `labels` is `[N]`.
fn token_nll(scores: &Array, labels: &Array) -> Result<Array> {
    if scores.ndim() != 2 {
        return Err(PuncError::Config(format!(
            "expected [N, C] scores, got {:?}",
            scores.shape()
        )));
    }
    let n = scores.dim(0);
    let c = scores.dim(1);
    let labels = labels.reshape(&[-1])?.as_dtype(Dtype::Int32)?;
    if labels.dim(0) != n {
        return Err(PuncError::Config(format!(
            "{} labels for {} score rows",
            labels.dim(0),
            n
        )));
    }

    let log_probs = log_softmax(scores)?.reshape(&[-1])?;
    let rows = mlx_rs::ops::arange::<_, i32>(0, n, None)?;
    let flat = rows.multiply(&Array::from_int(c))?.add(&labels)?;
    Ok(log_probs.take(&flat)?.negative()?)
}

/// Mean token cross-entropy of `[N, C]` scores against `[N]` labels.
pub fn cross_entropy(scores: &Array, labels: &Array) -> Result<Array> {
    Ok(token_nll(scores, labels)?.mean(None)?)
}

/// Cross-entropy of `[B, L, C]` scores against `[B, L]` labels, summed over
/// positions and averaged over the batch.
pub fn lm_cross_entropy(scores: &Array, labels: &Array) -> Result<Array> {
    if scores.ndim() != 3 {
        return Err(PuncError::Config(format!(
            "expected [B, L, C] scores, got {:?}",
            scores.shape()
        )));
    }
    let batch = scores.dim(0);
    let classes = scores.dim(2);
    let nll = token_nll(&scores.reshape(&[-1, classes])?, labels)?;
    Ok(nll
        .reshape(&[batch, -1])?
        .sum_axes(&[1], None)?
        .mean(None)?)
}
