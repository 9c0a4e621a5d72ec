// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! Model configuration consumed by the rotary resolver.
//!
//! Only the keys that influence rotary embeddings are read from a
//! HuggingFace-style `config.json`; everything else is ignored.
//!
//! ## JSON Compatibility
//!
//! The scaling descriptor accepts both the legacy `"type"` key and the
//! modern `"rope_type"` key. When both are present `rope_type` wins.

use std::path::Path;

use serde::{Deserialize, Deserializer};

use crate::error::{Result, RotaryError};

/// Environment variable naming the scaling type override.
pub const ROPE_SCALING_ENV: &str = "ROPE_SCALING";
/// Environment variable carrying the scaling factor override.
pub const ROPE_FACTOR_ENV: &str = "ROPE_FACTOR";

const DEFAULT_ROPE_THETA: f64 = 10_000.0;

fn default_rope_theta() -> f64 {
    DEFAULT_ROPE_THETA
}

/// Rotary-relevant subset of a model configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RotaryConfig {
    /// Maximum number of positions the model serves.
    #[serde(default)]
    pub max_position_embeddings: Option<usize>,

    /// DBRX spells the maximum length `max_seq_len`.
    #[serde(default)]
    pub max_seq_len: Option<usize>,

    /// Training context length (Phi-3 keeps it at the top level).
    #[serde(default)]
    pub original_max_position_embeddings: Option<usize>,

    /// Frequency base.
    #[serde(default = "default_rope_theta")]
    pub rope_theta: f64,

    /// Explicit number of rotated dimensions per head (GPT-J).
    #[serde(default)]
    pub rotary_dim: Option<usize>,

    /// Fraction of the head dimension that is rotated (GPT-NeoX, Phi).
    #[serde(default)]
    pub partial_rotary_factor: Option<f64>,

    /// Scaling descriptor, if any.
    #[serde(default)]
    pub rope_scaling: Option<RopeScaling>,
}

impl Default for RotaryConfig {
    fn default() -> Self {
        Self {
            max_position_embeddings: None,
            max_seq_len: None,
            original_max_position_embeddings: None,
            rope_theta: DEFAULT_ROPE_THETA,
            rotary_dim: None,
            partial_rotary_factor: None,
            rope_scaling: None,
        }
    }
}

impl RotaryConfig {
    /// Parse from a JSON string.
    ///
    /// # Errors
    /// Returns `Json` if the document is not a valid config.
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Read and parse a `config.json` file.
    ///
    /// # Errors
    /// Returns `Io` or `Json` if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    /// Maximum number of positions, falling back to `max_seq_len`.
    ///
    /// # Errors
    /// Returns `Configuration` when neither key is present.
    pub fn max_positions(&self) -> Result<usize> {
        self.max_position_embeddings
            .or(self.max_seq_len)
            .ok_or_else(|| RotaryError::config("max_position_embeddings is missing"))
    }

    /// Number of rotated dimensions for a head of `head_size`.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
    pub fn rotary_dim(&self, head_size: usize) -> usize {
        if let Some(dim) = self.rotary_dim {
            return dim;
        }
        match self.partial_rotary_factor {
            Some(factor) => (head_size as f64 * factor) as usize,
            None => head_size,
        }
    }
}

/// Scaling descriptor (`rope_scaling` in `config.json`).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RopeScaling {
    /// Scaling type, from `rope_type` or the legacy `type` key.
    pub rope_type: Option<String>,
    /// Scaling factor.
    pub factor: Option<f64>,
    /// YaRN magnitude numerator.
    pub mscale: Option<f64>,
    /// YaRN magnitude denominator.
    pub mscale_all_dim: Option<f64>,
    /// Per-band divisors for short contexts (su/longrope).
    pub short_factor: Option<Vec<f64>>,
    /// Per-band divisors for long contexts (su/longrope).
    pub long_factor: Option<Vec<f64>>,
    /// Angle multiplier for the short segment (Phi-3 longrope).
    pub short_mscale: Option<f64>,
    /// Angle multiplier for the long segment (Phi-3 longrope).
    pub long_mscale: Option<f64>,
    /// Training context length.
    pub original_max_position_embeddings: Option<usize>,
    /// Llama 3 low frequency factor.
    pub low_freq_factor: Option<f64>,
    /// Llama 3 high frequency factor.
    pub high_freq_factor: Option<f64>,
    /// YaRN fast rotation bound.
    pub beta_fast: Option<f64>,
    /// YaRN slow rotation bound.
    pub beta_slow: Option<f64>,
    /// YaRN attention factor.
    pub attention_factor: Option<f64>,
    /// Multimodal section sizes, in frequency bands.
    pub mrope_section: Option<Vec<usize>>,
}

#[derive(Deserialize)]
struct RopeScalingHelper {
    #[serde(rename = "type")]
    type_field: Option<String>,
    rope_type: Option<String>,
    factor: Option<f64>,
    mscale: Option<f64>,
    mscale_all_dim: Option<f64>,
    short_factor: Option<Vec<f64>>,
    long_factor: Option<Vec<f64>>,
    short_mscale: Option<f64>,
    long_mscale: Option<f64>,
    original_max_position_embeddings: Option<usize>,
    low_freq_factor: Option<f64>,
    high_freq_factor: Option<f64>,
    beta_fast: Option<f64>,
    beta_slow: Option<f64>,
    attention_factor: Option<f64>,
    mrope_section: Option<Vec<usize>>,
}

impl<'de> Deserialize<'de> for RopeScaling {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let helper = RopeScalingHelper::deserialize(deserializer)?;

        Ok(RopeScaling {
            rope_type: helper.rope_type.or(helper.type_field),
            factor: helper.factor,
            mscale: helper.mscale,
            mscale_all_dim: helper.mscale_all_dim,
            short_factor: helper.short_factor,
            long_factor: helper.long_factor,
            short_mscale: helper.short_mscale,
            long_mscale: helper.long_mscale,
            original_max_position_embeddings: helper.original_max_position_embeddings,
            low_freq_factor: helper.low_freq_factor,
            high_freq_factor: helper.high_freq_factor,
            beta_fast: helper.beta_fast,
            beta_slow: helper.beta_slow,
            attention_factor: helper.attention_factor,
            mrope_section: helper.mrope_section,
        })
    }
}

/// Process-level overrides of the scaling descriptor.
///
/// Read once at model construction and passed to the resolver explicitly.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RopeOverrides {
    /// Scaling type (`ROPE_SCALING`).
    pub scaling: Option<String>,
    /// Raw scaling factor (`ROPE_FACTOR`).
    pub factor: Option<String>,
}

impl RopeOverrides {
    /// Capture `ROPE_SCALING` and `ROPE_FACTOR` from the environment.
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            scaling: std::env::var(ROPE_SCALING_ENV).ok(),
            factor: std::env::var(ROPE_FACTOR_ENV).ok(),
        }
    }

    /// Descriptor implied by the overrides, if a scaling type is set.
    ///
    /// # Errors
    /// Returns `Configuration` when the type is set but the factor is
    /// missing or not a number.
    pub fn descriptor(&self) -> Result<Option<RopeScaling>> {
        let Some(rope_type) = &self.scaling else {
            return Ok(None);
        };
        let raw = self.factor.as_deref().ok_or_else(|| {
            RotaryError::config(format!("{ROPE_SCALING_ENV} is set but {ROPE_FACTOR_ENV} is not"))
        })?;
        let factor = raw.trim().parse::<f64>().map_err(|_| {
            RotaryError::config(format!("{ROPE_FACTOR_ENV}={raw} is not a number"))
        })?;
        Ok(Some(RopeScaling {
            rope_type: Some(rope_type.clone()),
            factor: Some(factor),
            ..Default::default()
        }))
    }
}
