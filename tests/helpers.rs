//! Reference computations and fixtures for rotary integration tests.
//!
//! Everything here is computed on the host with plain `f32`/`f64` math so
//! the candle-backed implementation can be checked against it.

#![allow(dead_code)]

use anyhow::Result;
use candle_core::{Device, Tensor};
use rotary_embed::config::RotaryConfig;
use rotary_embed::rotary::ResolveContext;

/// Tolerance for comparing trigonometric tables.
pub const TABLE_TOLERANCE: f32 = 1e-5;

/// Common configuration fixtures.
pub struct Fixtures;

impl Fixtures {
    /// CPU resolution context without overrides.
    pub fn cpu() -> ResolveContext {
        ResolveContext::new(&Device::Cpu)
    }

    /// Parse a config from JSON, panicking on malformed fixtures.
    pub fn config(json: &str) -> RotaryConfig {
        RotaryConfig::from_json_str(json).expect("fixture config must parse")
    }

    /// Plain config with the given maximum length.
    pub fn plain(max_position_embeddings: usize) -> RotaryConfig {
        RotaryConfig {
            max_position_embeddings: Some(max_position_embeddings),
            ..Default::default()
        }
    }

    /// Phi-3 style longrope config with two bands.
    pub fn longrope(short_mscale: Option<f64>, long_mscale: Option<f64>) -> RotaryConfig {
        let mscales = match (short_mscale, long_mscale) {
            (Some(s), Some(l)) => format!(r#", "short_mscale": {s}, "long_mscale": {l}"#),
            _ => String::new(),
        };
        Self::config(&format!(
            r#"{{"max_position_embeddings": 16, "original_max_position_embeddings": 8,
                "rope_scaling": {{"type": "longrope", "short_factor": [1.0, 2.0],
                                  "long_factor": [4.0, 8.0]{mscales}}}}}"#
        ))
    }
}

/// Host reference for plain tables: `cos/sin((pos / divisor) * inv_freq)`.
pub fn reference_tables(
    inv_freq: &[f32],
    seq_len: usize,
    divisor: Option<f32>,
) -> (Vec<Vec<f32>>, Vec<Vec<f32>>) {
    let mut cos = Vec::with_capacity(seq_len);
    let mut sin = Vec::with_capacity(seq_len);
    for pos in 0..seq_len {
        let t = divisor.map_or(pos as f32, |d| pos as f32 / d);
        cos.push(inv_freq.iter().map(|f| (t * f).cos()).collect());
        sin.push(inv_freq.iter().map(|f| (t * f).sin()).collect());
    }
    (cos, sin)
}

/// Largest absolute difference between two tables.
pub fn max_abs_diff(a: &[Vec<f32>], b: &[Vec<f32>]) -> f32 {
    assert_eq!(a.len(), b.len(), "row count differs");
    a.iter()
        .zip(b)
        .flat_map(|(ra, rb)| ra.iter().zip(rb).map(|(x, y)| (x - y).abs()))
        .fold(0.0, f32::max)
}

/// Rows of a `[rows, 1, bands]` or `[rows, bands]` tensor.
pub fn table_rows(t: &Tensor) -> Result<Vec<Vec<f32>>> {
    let rows = t.dim(0)?;
    let bands = t.elem_count() / rows.max(1);
    Ok(t.reshape((rows, bands))?.to_vec2::<f32>()?)
}

/// Host reference rotation of one head vector, blockwise pairing.
pub fn rotate_blockwise(x: &[f32], cos: &[f32], sin: &[f32]) -> Vec<f32> {
    let half = cos.len();
    let mut out = x.to_vec();
    for i in 0..half {
        out[i] = x[i] * cos[i] - x[i + half] * sin[i];
        out[i + half] = x[i + half] * cos[i] + x[i] * sin[i];
    }
    out
}

/// Host reference rotation of one head vector, pairwise pairing.
pub fn rotate_pairwise(x: &[f32], cos: &[f32], sin: &[f32]) -> Vec<f32> {
    let mut out = x.to_vec();
    for i in 0..cos.len() {
        out[2 * i] = x[2 * i] * cos[i] - x[2 * i + 1] * sin[i];
        out[2 * i + 1] = x[2 * i + 1] * cos[i] + x[2 * i] * sin[i];
    }
    out
}
