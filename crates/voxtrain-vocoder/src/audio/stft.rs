//! Short-Time Fourier Transform (STFT) implementation using MLX.
//!
//! Everything here is differentiable so it can sit inside a training loss.
//! The transform is a real matmul against cosine and sine bases, so the
//! magnitude is built from `re² + im²` and never differentiates through a
//! complex absolute value.

use crate::error::Result;
use mlx_rs::ops::indexing::IndexOp;
use mlx_rs::Array;
use voxtrain_core::VoxError;

/// Floor applied to the power spectrum before the square root.
pub const MAGNITUDE_FLOOR: f32 = 1e-7;

/// Periodic Hann window of `size` samples.
///
/// `hann[n] = 0.5 * (1 - cos(2πn / N))`
pub fn hann_window(size: i32) -> Result<Array> {
    let n = mlx_rs::ops::arange::<i32, f32>(0, size, None)?;
    let scale = Array::from_f32(2.0 * std::f32::consts::PI / size as f32);
    let cos_term = n.multiply(&scale)?.cos()?;
    let half = Array::from_f32(0.5);
    let one = Array::from_f32(1.0);
    Ok(half.multiply(&one.subtract(&cos_term)?)?)
}

/// Hann window of `win_length` zero-padded and centred to `n_fft`.
fn padded_window(n_fft: i32, win_length: i32) -> Result<Array> {
    let window = hann_window(win_length)?;
    if win_length >= n_fft {
        return Ok(window);
    }
    let pad_left = (n_fft - win_length) / 2;
    let pad_right = n_fft - win_length - pad_left;
    let zeros_left = mlx_rs::ops::zeros::<f32>(&[pad_left])?;
    let zeros_right = mlx_rs::ops::zeros::<f32>(&[pad_right])?;
    Ok(mlx_rs::ops::concatenate_axis(
        &[&zeros_left, &window, &zeros_right],
        0,
    )?)
}

/// Reflect-pad `[batch, samples]` by `pad` on both sides.
///
/// Reflection needs `pad < samples`; shorter signals are rejected.
pub fn reflect_pad(signal: &Array, pad: i32) -> Result<Array> {
    if pad == 0 {
        return Ok(signal.clone());
    }
    let length = signal.dim(1);
    if pad >= length {
        return Err(VoxError::Data(format!(
            "reflect padding of {} needs more than {} samples",
            pad, length
        ))
        .into());
    }
    // left: signal[pad..0 step -1], right: signal[-2..-pad-2 step -1]
    let left: Vec<i32> = (1..=pad).rev().collect();
    let right: Vec<i32> = ((length - pad - 1)..(length - 1)).rev().collect();
    let left = signal.take_axis(&Array::from_slice(&left, &[pad]), 1)?;
    let right = signal.take_axis(&Array::from_slice(&right, &[pad]), 1)?;
    Ok(mlx_rs::ops::concatenate_axis(&[&left, signal, &right], 1)?)
}

/// Cosine and sine DFT bases `[n_fft, n_fft / 2 + 1]`.
fn dft_bases(n_fft: i32) -> (Array, Array) {
    let bins = n_fft / 2 + 1;
    let step = 2.0 * std::f64::consts::PI / f64::from(n_fft);
    let mut cos = Vec::with_capacity((n_fft * bins) as usize);
    let mut sin = Vec::with_capacity((n_fft * bins) as usize);
    for k in 0..i64::from(n_fft) {
        for b in 0..i64::from(bins) {
            // Reduce the phase index first to keep the angle exact.
            let angle = ((k * b) % i64::from(n_fft)) as f64 * step;
            cos.push(angle.cos() as f32);
            sin.push(-angle.sin() as f32);
        }
    }
    (
        Array::from_slice(&cos, &[n_fft, bins]),
        Array::from_slice(&sin, &[n_fft, bins]),
    )
}

/// STFT of `[batch, samples]`.
///
/// The signal is reflect-padded by `n_fft / 2` on both sides, framed every
/// `hop` samples and windowed by a centred Hann window of `win_length`.
///
/// # Returns
/// Real and imaginary parts, each `[batch, frames, n_fft / 2 + 1]`
pub fn stft(signal: &Array, n_fft: i32, hop: i32, win_length: i32) -> Result<(Array, Array)> {
    let window = padded_window(n_fft, win_length)?;
    let signal = reflect_pad(signal, n_fft / 2)?;

    let padded_length = signal.dim(1);
    let num_frames = (padded_length - n_fft) / hop + 1;

    // Gather all frames at once: index[f, k] = f * hop + k
    let indices: Vec<i32> = (0..num_frames)
        .flat_map(|f| (0..n_fft).map(move |k| f * hop + k))
        .collect();
    let indices = Array::from_slice(&indices, &[num_frames, n_fft]);
    let framed = signal.take_axis(&indices, 1)?;

    let windowed = framed.multiply(&window)?;
    let (cos, sin) = dft_bases(n_fft);
    Ok((windowed.matmul(&cos)?, windowed.matmul(&sin)?))
}

/// Magnitude spectrogram `sqrt(max(re² + im², 1e-7))` of `[batch, samples]`.
pub fn stft_magnitude(signal: &Array, n_fft: i32, hop: i32, win_length: i32) -> Result<Array> {
    let (real, imag) = stft(signal, n_fft, hop, win_length)?;
    let power = real.square()?.add(&imag.square()?)?;
    let floor = Array::from_f32(MAGNITUDE_FLOOR);
    Ok(mlx_rs::ops::maximum(&power, &floor)?.sqrt()?)
}

/// Drop the channel axis of `[batch, 1, samples]`; pass `[batch, samples]`
/// through unchanged.
pub fn squeeze_channel(signal: &Array) -> Result<Array> {
    if signal.ndim() == 3 {
        Ok(signal.index((.., 0, ..)))
    } else {
        Ok(signal.clone())
    }
}
