// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! Resolution of the scaling strategy from model configuration.
//!
//! The resolver runs once per model load. Environment overrides win over
//! the `rope_scaling` descriptor embedded in `config.json`; an absent
//! descriptor selects plain RoPE. Every failure here is fatal for the load.

use crate::config::{RopeOverrides, RopeScaling, RotaryConfig};
use crate::error::{Result, RotaryError};
use crate::rotary::frequency::{get_mscale, validate_dim};

/// YaRN parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct YarnParams {
    /// Context extension factor.
    pub factor: f64,
    /// Training context length used for the correction range.
    pub original_max_position_embeddings: usize,
    /// Weight of the extrapolated frequencies.
    pub extrapolation_factor: f64,
    /// Attention magnitude factor.
    pub attn_factor: f64,
    /// Rotation count bounding the extrapolated bands.
    pub beta_fast: f64,
    /// Rotation count bounding the interpolated bands.
    pub beta_slow: f64,
    /// Magnitude numerator coefficient.
    pub mscale: f64,
    /// Magnitude denominator coefficient.
    pub mscale_all_dim: f64,
}

impl YarnParams {
    /// Scalar applied to the cos/sin tables.
    #[must_use]
    pub fn magnitude(&self) -> f64 {
        get_mscale(self.factor, self.mscale) / get_mscale(self.factor, self.mscale_all_dim)
            * self.attn_factor
    }
}

/// Su / LongRoPE parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct LongRopeParams {
    /// Per-band divisors below the original context length.
    pub short_factor: Vec<f64>,
    /// Per-band divisors at and beyond the original context length.
    pub long_factor: Vec<f64>,
    /// Position at which the long table takes over.
    pub original_max_position_embeddings: usize,
    /// Extended context length.
    pub max_position_embeddings: usize,
}

impl LongRopeParams {
    /// Scalar applied to the cos/sin tables.
    ///
    /// `sqrt(1 + ln(scale) / ln(original))` when the context is extended,
    /// 1 otherwise.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn scaling_factor(&self) -> f64 {
        if self.max_position_embeddings <= self.original_max_position_embeddings {
            return 1.0;
        }
        let original = self.original_max_position_embeddings as f64;
        let scale = self.max_position_embeddings as f64 / original;
        (1.0 + scale.ln() / original.ln()).sqrt()
    }
}

/// Llama 3 smoothing parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Llama3Params {
    /// Divisor for low frequency bands.
    pub factor: f64,
    /// Low frequency factor.
    pub low_freq_factor: f64,
    /// High frequency factor.
    pub high_freq_factor: f64,
    /// Training context length.
    pub original_max_position_embeddings: usize,
}

/// Resolved scaling strategy. Read-only after model load.
#[derive(Debug, Clone, PartialEq)]
pub enum ScalingConfig {
    /// Plain RoPE.
    None,
    /// Position indices divided by `factor`.
    Linear {
        /// Position divisor.
        factor: f64,
    },
    /// Dynamic NTK base rescaling.
    Dynamic {
        /// NTK scaling factor.
        factor: f64,
    },
    /// YaRN ramp blend.
    Yarn(YarnParams),
    /// Short/long tables with a shared magnitude scalar.
    Su(LongRopeParams),
    /// Short/long tables with per-segment angle multipliers.
    Phi3LongRope {
        /// Table parameters.
        params: LongRopeParams,
        /// Angle multiplier for positions below the original length.
        short_mscale: f64,
        /// Angle multiplier for positions at and beyond it.
        long_mscale: f64,
    },
    /// Wavelength-smoothed frequencies.
    Llama3(Llama3Params),
    /// Multimodal sectioned RoPE.
    Mrope {
        /// Section sizes in frequency bands.
        sections: Vec<usize>,
    },
}

fn required<T>(value: Option<T>, key: &str, rope_type: &str) -> Result<T> {
    value.ok_or_else(|| {
        RotaryError::config(format!("rope scaling type {rope_type} requires `{key}`"))
    })
}

impl ScalingConfig {
    /// Short name for logging.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::None => "default",
            Self::Linear { .. } => "linear",
            Self::Dynamic { .. } => "dynamic",
            Self::Yarn(_) => "yarn",
            Self::Su(_) => "su",
            Self::Phi3LongRope { .. } => "phi3-longrope",
            Self::Llama3(_) => "llama3",
            Self::Mrope { .. } => "mrope",
        }
    }

    /// Resolve the strategy for a rotary dimension of `dim`.
    ///
    /// # Errors
    /// - `Configuration` for a bad `dim`, bad overrides or missing parameters
    /// - `UnsupportedConfiguration` for an unknown scaling type
    pub fn resolve(config: &RotaryConfig, dim: usize, overrides: &RopeOverrides) -> Result<Self> {
        validate_dim(dim)?;

        let scaling = match overrides.descriptor()? {
            Some(scaling) => {
                tracing::info!(
                    "rope scaling overridden from environment: {:?} x{:?}",
                    scaling.rope_type,
                    scaling.factor
                );
                scaling
            }
            None => match &config.rope_scaling {
                Some(scaling) => scaling.clone(),
                None => return Ok(Self::None),
            },
        };

        let resolved = Self::from_descriptor(config, dim, &scaling)?;
        tracing::debug!("resolved rope scaling {} for dim {dim}", resolved.name());
        Ok(resolved)
    }

    fn from_descriptor(config: &RotaryConfig, dim: usize, scaling: &RopeScaling) -> Result<Self> {
        let rope_type = scaling
            .rope_type
            .as_deref()
            .ok_or_else(|| RotaryError::config("rope_scaling has neither `rope_type` nor `type`"))?;

        match rope_type {
            "default" => Ok(Self::None),
            "linear" => Ok(Self::Linear {
                factor: required(scaling.factor, "factor", rope_type)?,
            }),
            "dynamic" => Ok(Self::Dynamic {
                factor: required(scaling.factor, "factor", rope_type)?,
            }),
            "yarn" => Ok(Self::Yarn(YarnParams {
                factor: required(scaling.factor, "factor", rope_type)?,
                original_max_position_embeddings: required(
                    scaling
                        .original_max_position_embeddings
                        .or(config.original_max_position_embeddings),
                    "original_max_position_embeddings",
                    rope_type,
                )?,
                extrapolation_factor: 1.0,
                attn_factor: scaling.attention_factor.unwrap_or(1.0),
                beta_fast: scaling.beta_fast.unwrap_or(32.0),
                beta_slow: scaling.beta_slow.unwrap_or(1.0),
                mscale: scaling.mscale.unwrap_or(1.0),
                mscale_all_dim: scaling.mscale_all_dim.unwrap_or(0.0),
            })),
            "su" | "longrope" => Self::long_rope(config, dim, scaling, rope_type),
            "llama3" => Ok(Self::Llama3(Llama3Params {
                factor: required(scaling.factor, "factor", rope_type)?,
                low_freq_factor: required(scaling.low_freq_factor, "low_freq_factor", rope_type)?,
                high_freq_factor: required(
                    scaling.high_freq_factor,
                    "high_freq_factor",
                    rope_type,
                )?,
                original_max_position_embeddings: required(
                    scaling
                        .original_max_position_embeddings
                        .or(config.original_max_position_embeddings),
                    "original_max_position_embeddings",
                    rope_type,
                )?,
            })),
            "mrope" => match &scaling.mrope_section {
                Some(sections) => {
                    let bands: usize = sections.iter().sum();
                    if bands != dim / 2 {
                        return Err(RotaryError::config(format!(
                            "mrope_section {sections:?} covers {bands} bands, expected {}",
                            dim / 2
                        )));
                    }
                    Ok(Self::Mrope {
                        sections: sections.clone(),
                    })
                }
                None => Ok(Self::None),
            },
            other => Err(RotaryError::UnsupportedConfiguration(other.to_string())),
        }
    }

    fn long_rope(
        config: &RotaryConfig,
        dim: usize,
        scaling: &RopeScaling,
        rope_type: &str,
    ) -> Result<Self> {
        let short_factor = required(scaling.short_factor.clone(), "short_factor", rope_type)?;
        let long_factor = required(scaling.long_factor.clone(), "long_factor", rope_type)?;
        for (key, factors) in [("short_factor", &short_factor), ("long_factor", &long_factor)] {
            if factors.len() != dim / 2 {
                return Err(RotaryError::config(format!(
                    "{key} has {} entries, expected {}",
                    factors.len(),
                    dim / 2
                )));
            }
        }

        let params = LongRopeParams {
            short_factor,
            long_factor,
            original_max_position_embeddings: required(
                config
                    .original_max_position_embeddings
                    .or(scaling.original_max_position_embeddings),
                "original_max_position_embeddings",
                rope_type,
            )?,
            max_position_embeddings: config.max_positions()?,
        };

        match (scaling.short_mscale, scaling.long_mscale) {
            (Some(short_mscale), Some(long_mscale)) => Ok(Self::Phi3LongRope {
                params,
                short_mscale,
                long_mscale,
            }),
            _ => Ok(Self::Su(params)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with(scaling: &str) -> RotaryConfig {
        let json = format!(r#"{{"max_position_embeddings": 8192, "rope_scaling": {scaling}}}"#);
        RotaryConfig::from_json_str(&json).unwrap()
    }

    #[test]
    fn test_no_scaling_is_plain() {
        let config = RotaryConfig::from_json_str(r#"{"max_position_embeddings": 2048}"#).unwrap();
        let resolved = ScalingConfig::resolve(&config, 64, &RopeOverrides::default()).unwrap();
        assert_eq!(resolved, ScalingConfig::None);
    }

    #[test]
    fn test_default_type_is_plain() {
        let config = config_with(r#"{"rope_type": "default"}"#);
        let resolved = ScalingConfig::resolve(&config, 64, &RopeOverrides::default()).unwrap();
        assert_eq!(resolved, ScalingConfig::None);
    }

    #[test]
    fn test_legacy_type_key() {
        let config = config_with(r#"{"type": "linear", "factor": 4.0}"#);
        let resolved = ScalingConfig::resolve(&config, 64, &RopeOverrides::default()).unwrap();
        assert_eq!(resolved, ScalingConfig::Linear { factor: 4.0 });
    }

    #[test]
    fn test_environment_override_wins() {
        let config = config_with(r#"{"type": "linear", "factor": 4.0}"#);
        let overrides = RopeOverrides {
            scaling: Some("dynamic".to_string()),
            factor: Some("2".to_string()),
        };
        let resolved = ScalingConfig::resolve(&config, 64, &overrides).unwrap();
        assert_eq!(resolved, ScalingConfig::Dynamic { factor: 2.0 });
    }

    #[test]
    fn test_unknown_type_names_offender() {
        let config = config_with(r#"{"type": "wobble", "factor": 2.0}"#);
        let err = ScalingConfig::resolve(&config, 64, &RopeOverrides::default()).unwrap_err();
        match err {
            RotaryError::UnsupportedConfiguration(name) => assert_eq!(name, "wobble"),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_missing_factor_is_configuration_error() {
        let config = config_with(r#"{"type": "dynamic"}"#);
        let err = ScalingConfig::resolve(&config, 64, &RopeOverrides::default()).unwrap_err();
        assert!(matches!(err, RotaryError::Configuration(_)));
    }

    #[test]
    fn test_missing_type_is_configuration_error() {
        let config = config_with(r#"{"factor": 2.0}"#);
        let err = ScalingConfig::resolve(&config, 64, &RopeOverrides::default()).unwrap_err();
        assert!(matches!(err, RotaryError::Configuration(_)));
    }

    #[test]
    fn test_yarn_defaults() {
        let config = config_with(
            r#"{"type": "yarn", "factor": 4.0, "original_max_position_embeddings": 2048}"#,
        );
        let ScalingConfig::Yarn(params) =
            ScalingConfig::resolve(&config, 64, &RopeOverrides::default()).unwrap()
        else {
            panic!("expected yarn");
        };
        assert_eq!(params.beta_fast, 32.0);
        assert_eq!(params.beta_slow, 1.0);
        assert_eq!(params.mscale, 1.0);
        assert_eq!(params.mscale_all_dim, 0.0);
        // mscale_all_dim = 0 keeps the denominator at 1.
        assert!((params.magnitude() - (0.1 * 4f64.ln() + 1.0)).abs() < 1e-12);
    }

    #[test]
    fn test_yarn_magnitude_collapses_without_extension() {
        let params = YarnParams {
            factor: 1.0,
            original_max_position_embeddings: 2048,
            extrapolation_factor: 1.0,
            attn_factor: 0.75,
            beta_fast: 32.0,
            beta_slow: 1.0,
            mscale: 0.707,
            mscale_all_dim: 0.707,
        };
        assert_eq!(params.magnitude(), 0.75);
    }

    #[test]
    fn test_longrope_variants() {
        let plain = config_with(
            r#"{"type": "longrope", "short_factor": [1, 1], "long_factor": [2, 2],
                "original_max_position_embeddings": 4096}"#,
        );
        let resolved = ScalingConfig::resolve(&plain, 4, &RopeOverrides::default()).unwrap();
        assert!(matches!(resolved, ScalingConfig::Su(_)));

        let phi3 = config_with(
            r#"{"type": "su", "short_factor": [1, 1], "long_factor": [2, 2],
                "short_mscale": 1.1, "long_mscale": 1.2,
                "original_max_position_embeddings": 4096}"#,
        );
        let resolved = ScalingConfig::resolve(&phi3, 4, &RopeOverrides::default()).unwrap();
        assert!(matches!(
            resolved,
            ScalingConfig::Phi3LongRope { short_mscale, long_mscale, .. }
                if short_mscale == 1.1 && long_mscale == 1.2
        ));
    }

    #[test]
    fn test_longrope_factor_length_checked() {
        let config = config_with(
            r#"{"type": "longrope", "short_factor": [1], "long_factor": [2, 2],
                "original_max_position_embeddings": 4096}"#,
        );
        let err = ScalingConfig::resolve(&config, 4, &RopeOverrides::default()).unwrap_err();
        assert!(matches!(err, RotaryError::Configuration(_)));
    }

    #[test]
    fn test_longrope_scaling_factor() {
        let params = LongRopeParams {
            short_factor: vec![],
            long_factor: vec![],
            original_max_position_embeddings: 4096,
            max_position_embeddings: 131_072,
        };
        let expected = (1.0 + 32f64.ln() / 4096f64.ln()).sqrt();
        assert!((params.scaling_factor() - expected).abs() < 1e-12);

        let unextended = LongRopeParams { max_position_embeddings: 4096, ..params };
        assert_eq!(unextended.scaling_factor(), 1.0);
    }

    #[test]
    fn test_mrope_sections() {
        let config = config_with(r#"{"type": "mrope", "mrope_section": [2, 3, 3]}"#);
        let resolved = ScalingConfig::resolve(&config, 16, &RopeOverrides::default()).unwrap();
        assert_eq!(resolved, ScalingConfig::Mrope { sections: vec![2, 3, 3] });

        let err = ScalingConfig::resolve(&config, 32, &RopeOverrides::default()).unwrap_err();
        assert!(matches!(err, RotaryError::Configuration(_)));
    }

    #[test]
    fn test_llama3_requires_parameters() {
        let config = config_with(r#"{"rope_type": "llama3", "factor": 8.0}"#);
        let err = ScalingConfig::resolve(&config, 64, &RopeOverrides::default()).unwrap_err();
        assert!(matches!(err, RotaryError::Configuration(_)));
    }
}
