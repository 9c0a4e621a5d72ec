// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! Inverse-frequency construction shared by every scaling variant.
//!
//! All math here runs on the host in `f64` and is narrowed to `f32` once,
//! so the tables uploaded to the device carry a single rounding step.
//!
//! ## Formulas
//!
//! ```text
//! inv_freq[i] = 1 / base^(2i / dim)                      i in [0, dim/2)
//! su[i]       = 1 / (factor[i] * base^(2i / dim))
//! ntk_base    = base * (s * seqlen / max - (s - 1))^(dim / (dim - 2))
//! mscale(s,m) = 0.1 * m * ln(s) + 1                      (1 when s <= 1)
//! ```

use std::f64::consts::PI;

use candle_core::{Device, Tensor};

use crate::error::{Result, RotaryError};

/// Check that a rotary dimension is positive and even.
///
/// # Errors
/// Returns `Configuration` otherwise.
pub fn validate_dim(dim: usize) -> Result<()> {
    if dim == 0 || dim % 2 != 0 {
        return Err(RotaryError::config(format!(
            "rotary dimension must be positive and even, got {dim}"
        )));
    }
    Ok(())
}

#[allow(clippy::cast_precision_loss)]
fn band_exponent(i: usize, dim: usize) -> f64 {
    (2 * i) as f64 / dim as f64
}

/// Compute `dim / 2` inverse frequencies `1 / base^(2i/dim)`.
///
/// # Errors
/// Returns `Configuration` if `dim` is zero or odd.
#[allow(clippy::cast_possible_truncation)]
pub fn inverse_frequencies(dim: usize, base: f64) -> Result<Vec<f32>> {
    validate_dim(dim)?;
    Ok((0..dim / 2)
        .map(|i| (1.0 / base.powf(band_exponent(i, dim))) as f32)
        .collect())
}

/// Inverse frequencies as a 1-D `f32` tensor on `device`.
///
/// # Errors
/// Returns `Configuration` for an invalid `dim`, or a candle error.
pub fn create_inv_freq(dim: usize, base: f64, device: &Device) -> Result<Tensor> {
    let inv_freq = inverse_frequencies(dim, base)?;
    let len = inv_freq.len();
    Ok(Tensor::from_vec(inv_freq, len, device)?)
}

/// Inverse frequencies with each band divided by its own factor.
///
/// # Errors
/// Returns `Configuration` if `dim` is invalid or `factors` does not hold
/// exactly `dim / 2` entries.
#[allow(clippy::cast_possible_truncation)]
pub fn scaled_inverse_frequencies(dim: usize, base: f64, factors: &[f64]) -> Result<Vec<f32>> {
    validate_dim(dim)?;
    if factors.len() != dim / 2 {
        return Err(RotaryError::config(format!(
            "expected {} per-band factors, got {}",
            dim / 2,
            factors.len()
        )));
    }
    Ok(factors
        .iter()
        .enumerate()
        .map(|(i, factor)| (1.0 / (factor * base.powf(band_exponent(i, dim)))) as f32)
        .collect())
}

/// Frequency base used by dynamic NTK scaling for a request of `seqlen`.
///
/// Below or at `max_position_embeddings` the base is returned unchanged.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn dynamic_ntk_base(
    base: f64,
    scaling_factor: f64,
    seqlen: usize,
    max_position_embeddings: usize,
    dim: usize,
) -> f64 {
    if seqlen <= max_position_embeddings {
        return base;
    }
    let ratio = scaling_factor * seqlen as f64 / max_position_embeddings as f64;
    let exponent = dim as f64 / (dim as f64 - 2.0);
    base * (ratio - (scaling_factor - 1.0)).powf(exponent)
}

/// Llama 3 wavelength-dependent smoothing of a frequency vector.
///
/// Bands with a wavelength below `original_max / high_freq_factor` pass
/// through, bands above `original_max / low_freq_factor` are divided by
/// `scaling_factor`, and the bands in between are interpolated.
///
/// # Errors
/// Returns `NumericPrecondition` if the two wavelength thresholds coincide.
#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
pub fn apply_llama3_scaling(
    freqs: &[f32],
    scaling_factor: f64,
    low_freq_factor: f64,
    high_freq_factor: f64,
    original_max_position_embeddings: usize,
) -> Result<Vec<f32>> {
    let original = original_max_position_embeddings as f64;
    let low_freq_wavelen = original / low_freq_factor;
    let high_freq_wavelen = original / high_freq_factor;
    if (low_freq_wavelen - high_freq_wavelen).abs() < f64::EPSILON {
        return Err(RotaryError::NumericPrecondition(format!(
            "llama3 low and high frequency wavelengths coincide ({low_freq_wavelen})"
        )));
    }

    Ok(freqs
        .iter()
        .map(|&freq| {
            let freq = f64::from(freq);
            let wavelen = 2.0 * PI / freq;
            let scaled = if wavelen < high_freq_wavelen {
                freq
            } else if wavelen > low_freq_wavelen {
                freq / scaling_factor
            } else {
                let smooth = (original / wavelen - low_freq_factor)
                    / (high_freq_factor - low_freq_factor);
                (1.0 - smooth) * freq / scaling_factor + smooth * freq
            };
            scaled as f32
        })
        .collect())
}

/// Band index at which a frequency completes `num_rotations` turns over
/// `max_position_embeddings` positions.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn find_correction_dim(
    num_rotations: f64,
    dim: usize,
    base: f64,
    max_position_embeddings: usize,
) -> f64 {
    (dim as f64 * (max_position_embeddings as f64 / (num_rotations * 2.0 * PI)).ln())
        / (2.0 * base.ln())
}

/// Band bounds for the YaRN ramp, floored/ceiled and clamped to `[0, dim - 1]`.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn find_correction_range(
    low_rot: f64,
    high_rot: f64,
    dim: usize,
    base: f64,
    max_position_embeddings: usize,
) -> (f64, f64) {
    let low = find_correction_dim(low_rot, dim, base, max_position_embeddings).floor();
    let high = find_correction_dim(high_rot, dim, base, max_position_embeddings).ceil();
    (low.max(0.0), high.min(dim as f64 - 1.0))
}

/// Linear ramp from 0 at `min` to 1 at `max`, clamped, over `len` bands.
#[must_use]
#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
pub fn linear_ramp_mask(min: f64, max: f64, len: usize) -> Vec<f32> {
    let max = if (max - min).abs() < f64::EPSILON { max + 0.001 } else { max };
    (0..len)
        .map(|i| ((i as f64 - min) / (max - min)).clamp(0.0, 1.0) as f32)
        .collect()
}

/// YaRN magnitude term.
#[must_use]
pub fn get_mscale(scale: f64, mscale: f64) -> f64 {
    if scale <= 1.0 {
        return 1.0;
    }
    0.1 * mscale * scale.ln() + 1.0
}

/// YaRN blend of extrapolated and interpolated frequencies.
///
/// # Errors
/// Returns `Configuration` for an invalid `dim`.
#[allow(clippy::cast_possible_truncation)]
pub fn yarn_inverse_frequencies(
    dim: usize,
    base: f64,
    scaling_factor: f64,
    original_max_position_embeddings: usize,
    beta_fast: f64,
    beta_slow: f64,
    extrapolation_factor: f64,
) -> Result<Vec<f32>> {
    let extrapolation = inverse_frequencies(dim, base)?;
    let (low, high) =
        find_correction_range(beta_fast, beta_slow, dim, base, original_max_position_embeddings);
    let ramp = linear_ramp_mask(low, high, dim / 2);

    Ok(extrapolation
        .iter()
        .zip(ramp)
        .map(|(&extra, ramp)| {
            let extra = f64::from(extra);
            let interp = extra / scaling_factor;
            let mask = (1.0 - f64::from(ramp)) * extrapolation_factor;
            (interp * (1.0 - mask) + extra * mask) as f32
        })
        .collect())
}
