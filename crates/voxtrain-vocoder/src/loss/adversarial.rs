//! Least-squares GAN losses.

use crate::error::Result;
use mlx_rs::Array;

/// `mean((x - target)²)` with a broadcast scalar target.
pub fn mse_loss(x: &Array, target: f32) -> Result<Array> {
    Ok(x.subtract(&Array::from_f32(target))?.square()?.mean(None)?)
}

/// Generator adversarial loss `mean((D(G(z)) - 1)²)`.
pub fn adversarial_loss(p_fake: &Array) -> Result<Array> {
    mse_loss(p_fake, 1.0)
}

/// Discriminator losses `(mean((D(x) - 1)²), mean(D(G(z))²))`.
pub fn discriminator_loss(p_real: &Array, p_fake: &Array) -> Result<(Array, Array)> {
    Ok((mse_loss(p_real, 1.0)?, mse_loss(p_fake, 0.0)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_perfect_discriminator_has_zero_loss() {
        let real = mlx_rs::ops::ones::<f32>(&[2, 1, 8]).unwrap();
        let fake = mlx_rs::ops::zeros::<f32>(&[2, 1, 8]).unwrap();
        let (r, f) = discriminator_loss(&real, &fake).unwrap();
        assert_eq!(r.item::<f32>(), 0.0);
        assert_eq!(f.item::<f32>(), 0.0);
        assert_eq!(adversarial_loss(&fake).unwrap().item::<f32>(), 1.0);
    }

    #[test]
    fn test_mse_value() {
        let x = Array::from_slice(&[0.0f32, 2.0], &[2]);
        assert!((mse_loss(&x, 1.0).unwrap().item::<f32>() - 1.0).abs() < 1e-6);
    }
}
