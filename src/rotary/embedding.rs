// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! Position rotary embedding with lazily built cos/sin tables.
//!
//! One [`PositionRotaryEmbedding`] serves one model instance. The strategy
//! is fixed at load time; the cos/sin cache grows on demand and is rebuilt
//! from position 0 whenever the requested length exceeds it or the device
//! or precision changes.
//!
//! ## Implementation Notes
//!
//! - Angles are computed in `f32` and cast to the requested dtype last
//! - `get_cos_sin` always covers `max_position_embeddings` rows
//! - Dynamic NTK derives its base from the requested length on every rebuild

use candle_core::{DType, Device, Tensor};

use crate::config::{RopeOverrides, RotaryConfig};
use crate::error::{Result, RotaryError};
use crate::memory::{cos_sin_cache_bytes, format_bytes};
use crate::rotary::apply::{apply_rotary_in_place, RotaryLayout};
use crate::rotary::frequency::{
    apply_llama3_scaling, create_inv_freq, dynamic_ntk_base, inverse_frequencies,
    scaled_inverse_frequencies, yarn_inverse_frequencies,
};
use crate::rotary::scaling::{LongRopeParams, ScalingConfig};
use crate::weights::WeightSource;

/// Inputs to resolution that do not come from `config.json`.
#[derive(Debug, Clone)]
pub struct ResolveContext {
    /// Environment overrides captured at model construction.
    pub overrides: RopeOverrides,
    /// Device holding the frequency vectors.
    pub device: Device,
}

impl ResolveContext {
    /// Context without overrides.
    #[must_use]
    pub fn new(device: &Device) -> Self {
        Self {
            overrides: RopeOverrides::default(),
            device: device.clone(),
        }
    }

    /// Context with overrides read from `ROPE_SCALING` / `ROPE_FACTOR`.
    #[must_use]
    pub fn from_env(device: &Device) -> Self {
        Self {
            overrides: RopeOverrides::from_env(),
            device: device.clone(),
        }
    }
}

/// Cached cosine and sine tables `[seq_len, bands]`.
#[derive(Debug, Clone)]
struct CosSinCache {
    cos: Tensor,
    sin: Tensor,
    /// Multimodal only: band-to-section index expanded to `[seq_len, 1, bands]`.
    sections: Option<Tensor>,
    seq_len: usize,
    dtype: DType,
    device: Device,
}

impl CosSinCache {
    fn covers(&self, dtype: DType, device: &Device, seq_len: usize) -> bool {
        seq_len <= self.seq_len && self.dtype == dtype && self.device.same_device(device)
    }
}

#[derive(Debug, Clone)]
enum RotaryStrategy {
    /// Plain, linear and Llama 3 (frequencies already smoothed).
    Static {
        inv_freq: Tensor,
        position_divisor: Option<f64>,
    },
    Dynamic {
        inv_freq: Tensor,
        dim: usize,
        base: f64,
        factor: f64,
    },
    Yarn {
        inv_freq: Tensor,
        mscale: f64,
    },
    LongRope {
        short_inv_freq: Tensor,
        long_inv_freq: Tensor,
        original_max_position_embeddings: usize,
        /// Multipliers for short and long angles (Phi-3), or `None`.
        segment_mscale: Option<(f64, f64)>,
        /// Scalar applied to cos/sin.
        magnitude: f64,
    },
    Multimodal {
        inv_freq: Tensor,
        /// `[1, 1, bands]` section id per band.
        section_indices: Tensor,
    },
}

/// Rotary position embedding for one model.
#[derive(Debug, Clone)]
pub struct PositionRotaryEmbedding {
    scaling: ScalingConfig,
    strategy: RotaryStrategy,
    max_position_embeddings: usize,
    layout: RotaryLayout,
    cache: Option<CosSinCache>,
}

impl PositionRotaryEmbedding {
    /// Build from model configuration for fresh weights.
    ///
    /// # Arguments
    /// * `config` - Model configuration
    /// * `dim` - Rotary dimension (even)
    /// * `base` - Frequency base (`rope_theta`)
    /// * `ctx` - Overrides and target device
    ///
    /// # Errors
    /// Returns any resolution error; see [`ScalingConfig::resolve`].
    pub fn from_config(
        config: &RotaryConfig,
        dim: usize,
        base: f64,
        ctx: &ResolveContext,
    ) -> Result<Self> {
        let scaling = ScalingConfig::resolve(config, dim, &ctx.overrides)?;
        Self::build(scaling, config.max_positions()?, dim, base, None, &ctx.device)
    }

    /// Restore from a persisted `{prefix}.inv_freq` tensor.
    ///
    /// The stored vector is read as `f32`. Variants driven by a single
    /// frequency vector reuse it; variants that rebuild frequencies derive
    /// them from `config.rope_theta` and the stored length.
    ///
    /// # Errors
    /// Returns `MissingWeight` if the tensor is absent, or any resolution error.
    pub fn load<W: WeightSource + ?Sized>(
        config: &RotaryConfig,
        prefix: &str,
        weights: &W,
        ctx: &ResolveContext,
    ) -> Result<Self> {
        let inv_freq = weights.get_tensor_f32(&format!("{prefix}.inv_freq"), &ctx.device)?;
        let inv_freq = inv_freq.flatten_all()?;
        let dim = 2 * inv_freq.dim(0)?;
        let scaling = ScalingConfig::resolve(config, dim, &ctx.overrides)?;
        Self::build(
            scaling,
            config.max_positions()?,
            dim,
            config.rope_theta,
            Some(inv_freq),
            &ctx.device,
        )
    }

    #[allow(clippy::cast_possible_truncation)]
    fn build(
        scaling: ScalingConfig,
        max_position_embeddings: usize,
        dim: usize,
        base: f64,
        stored: Option<Tensor>,
        device: &Device,
    ) -> Result<Self> {
        let plain = |stored: Option<Tensor>| -> Result<Tensor> {
            match stored {
                Some(inv_freq) => Ok(inv_freq),
                None => create_inv_freq(dim, base, device),
            }
        };

        let strategy = match &scaling {
            ScalingConfig::None => RotaryStrategy::Static {
                inv_freq: plain(stored)?,
                position_divisor: None,
            },
            ScalingConfig::Linear { factor } => RotaryStrategy::Static {
                inv_freq: plain(stored)?,
                position_divisor: Some(*factor),
            },
            ScalingConfig::Llama3(params) => {
                let freqs = match stored {
                    Some(inv_freq) => inv_freq.to_vec1::<f32>()?,
                    None => inverse_frequencies(dim, base)?,
                };
                let smoothed = apply_llama3_scaling(
                    &freqs,
                    params.factor,
                    params.low_freq_factor,
                    params.high_freq_factor,
                    params.original_max_position_embeddings,
                )?;
                let len = smoothed.len();
                RotaryStrategy::Static {
                    inv_freq: Tensor::from_vec(smoothed, len, device)?,
                    position_divisor: None,
                }
            }
            ScalingConfig::Dynamic { factor } => RotaryStrategy::Dynamic {
                inv_freq: create_inv_freq(dim, base, device)?,
                dim,
                base,
                factor: *factor,
            },
            ScalingConfig::Yarn(params) => {
                let inv_freq = yarn_inverse_frequencies(
                    dim,
                    base,
                    params.factor,
                    params.original_max_position_embeddings,
                    params.beta_fast,
                    params.beta_slow,
                    params.extrapolation_factor,
                )?;
                let len = inv_freq.len();
                RotaryStrategy::Yarn {
                    inv_freq: Tensor::from_vec(inv_freq, len, device)?,
                    mscale: params.magnitude(),
                }
            }
            ScalingConfig::Su(params) => {
                Self::long_rope(params, dim, base, None, params.scaling_factor(), device)?
            }
            ScalingConfig::Phi3LongRope {
                params,
                short_mscale,
                long_mscale,
            } => Self::long_rope(
                params,
                dim,
                base,
                Some((*short_mscale, *long_mscale)),
                1.0,
                device,
            )?,
            ScalingConfig::Mrope { sections } => {
                let ids: Vec<u32> = sections
                    .iter()
                    .enumerate()
                    .flat_map(|(id, &size)| std::iter::repeat(id as u32).take(size))
                    .collect();
                let bands = ids.len();
                RotaryStrategy::Multimodal {
                    inv_freq: plain(stored)?,
                    section_indices: Tensor::from_vec(ids, (1, 1, bands), device)?,
                }
            }
        };

        Ok(Self {
            scaling,
            strategy,
            max_position_embeddings,
            layout: RotaryLayout::default(),
            cache: None,
        })
    }

    fn long_rope(
        params: &LongRopeParams,
        dim: usize,
        base: f64,
        segment_mscale: Option<(f64, f64)>,
        magnitude: f64,
        device: &Device,
    ) -> Result<RotaryStrategy> {
        let short = scaled_inverse_frequencies(dim, base, &params.short_factor)?;
        let long = scaled_inverse_frequencies(dim, base, &params.long_factor)?;
        let bands = short.len();
        Ok(RotaryStrategy::LongRope {
            short_inv_freq: Tensor::from_vec(short, bands, device)?,
            long_inv_freq: Tensor::from_vec(long, bands, device)?,
            original_max_position_embeddings: params.original_max_position_embeddings,
            segment_mscale,
            magnitude,
        })
    }

    /// Use a different feature pairing when rotating.
    #[must_use]
    pub fn with_layout(mut self, layout: RotaryLayout) -> Self {
        self.layout = layout;
        self
    }

    /// Feature pairing used by [`Self::forward`].
    #[must_use]
    pub fn layout(&self) -> RotaryLayout {
        self.layout
    }

    /// Resolved scaling strategy.
    #[must_use]
    pub fn scaling(&self) -> &ScalingConfig {
        &self.scaling
    }

    /// Number of rows `get_cos_sin` keeps cached.
    #[must_use]
    pub fn max_position_embeddings(&self) -> usize {
        self.max_position_embeddings
    }

    /// Length of the current cache, 0 before first use.
    #[must_use]
    pub fn cached_len(&self) -> usize {
        self.cache.as_ref().map_or(0, |cache| cache.seq_len)
    }

    /// Current cos/sin tables, if built.
    #[must_use]
    pub fn cos_sin_tables(&self) -> Option<(&Tensor, &Tensor)> {
        self.cache.as_ref().map(|cache| (&cache.cos, &cache.sin))
    }

    /// Current inverse frequencies for single-vector strategies.
    ///
    /// For dynamic NTK this reflects the last rebuild.
    #[must_use]
    pub fn inv_freq(&self) -> Option<&Tensor> {
        match &self.strategy {
            RotaryStrategy::Static { inv_freq, .. }
            | RotaryStrategy::Dynamic { inv_freq, .. }
            | RotaryStrategy::Yarn { inv_freq, .. }
            | RotaryStrategy::Multimodal { inv_freq, .. } => Some(inv_freq),
            RotaryStrategy::LongRope { .. } => None,
        }
    }

    /// Make sure the cache covers `seq_len` positions at `dtype` on `device`.
    ///
    /// A no-op when it already does; otherwise the tables are rebuilt for
    /// positions `[0, seq_len)`.
    ///
    /// # Errors
    /// Returns a candle error if table construction fails.
    pub fn ensure_cache(&mut self, dtype: DType, device: &Device, seq_len: usize) -> Result<()> {
        self.cache_for(dtype, device, seq_len).map(|_| ())
    }

    fn cache_for(&mut self, dtype: DType, device: &Device, seq_len: usize) -> Result<&CosSinCache> {
        let cache = match self.cache.take() {
            Some(cache) if cache.covers(dtype, device, seq_len) => cache,
            _ => self.build_cache(dtype, device, seq_len)?,
        };
        Ok(self.cache.insert(cache))
    }

    fn build_cache(&mut self, dtype: DType, device: &Device, seq_len: usize) -> Result<CosSinCache> {
        let (freqs, magnitude) = self.angles(device, seq_len)?;
        let (mut cos, mut sin) = (freqs.cos()?, freqs.sin()?);
        if let Some(magnitude) = magnitude {
            cos = (cos * magnitude)?;
            sin = (sin * magnitude)?;
        }
        let cos = cos.to_dtype(dtype)?;
        let sin = sin.to_dtype(dtype)?;

        let sections = match &self.strategy {
            RotaryStrategy::Multimodal {
                section_indices, ..
            } => {
                let bands = section_indices.dim(2)?;
                Some(
                    section_indices
                        .to_device(device)?
                        .expand((seq_len, 1, bands))?
                        .contiguous()?,
                )
            }
            _ => None,
        };

        let bands = cos.dim(1)?;
        tracing::debug!(
            "rebuilt {} rope cache: seq_len={seq_len} bands={bands} dtype={dtype:?} device={device:?} ({})",
            self.scaling.name(),
            format_bytes(cos_sin_cache_bytes(seq_len, bands, dtype))
        );

        Ok(CosSinCache {
            cos,
            sin,
            sections,
            seq_len,
            dtype,
            device: device.clone(),
        })
    }

    /// `f32` angle table `[seq_len, bands]` and the optional cos/sin magnitude.
    fn angles(&mut self, device: &Device, seq_len: usize) -> Result<(Tensor, Option<f64>)> {
        let max_position_embeddings = self.max_position_embeddings;
        match &mut self.strategy {
            RotaryStrategy::Static {
                inv_freq,
                position_divisor,
            } => {
                let mut t = positions(0, seq_len, device)?;
                if let Some(divisor) = position_divisor {
                    t = (t / *divisor)?;
                }
                Ok((outer(&t, inv_freq, device)?, None))
            }
            RotaryStrategy::Dynamic {
                inv_freq,
                dim,
                base,
                factor,
            } => {
                let new_base = dynamic_ntk_base(*base, *factor, seq_len, max_position_embeddings, *dim);
                if seq_len > max_position_embeddings {
                    tracing::debug!("dynamic ntk base {base} -> {new_base} for seq_len={seq_len}");
                }
                *inv_freq = create_inv_freq(*dim, new_base, device)?;
                let t = positions(0, seq_len, device)?;
                Ok((outer(&t, inv_freq, device)?, None))
            }
            RotaryStrategy::Yarn { inv_freq, mscale } => {
                let t = positions(0, seq_len, device)?;
                Ok((outer(&t, inv_freq, device)?, Some(*mscale)))
            }
            RotaryStrategy::LongRope {
                short_inv_freq,
                long_inv_freq,
                original_max_position_embeddings,
                segment_mscale,
                magnitude,
            } => {
                let split = seq_len.min(*original_max_position_embeddings);
                let mut short = outer(&positions(0, split, device)?, short_inv_freq, device)?;
                let mut segments = Vec::with_capacity(2);
                if let Some((short_mscale, _)) = segment_mscale {
                    short = (short * *short_mscale)?;
                }
                segments.push(short);
                if seq_len > split {
                    let mut long =
                        outer(&positions(split, seq_len, device)?, long_inv_freq, device)?;
                    if let Some((_, long_mscale)) = segment_mscale {
                        long = (long * *long_mscale)?;
                    }
                    segments.push(long);
                }
                let freqs = Tensor::cat(&segments, 0)?;
                let magnitude = (segment_mscale.is_none()).then_some(*magnitude);
                Ok((freqs, magnitude))
            }
            RotaryStrategy::Multimodal { inv_freq, .. } => {
                let t = positions(0, seq_len, device)?;
                Ok((outer(&t, inv_freq, device)?, None))
            }
        }
    }

    /// Rows of the cos/sin tables for `position_ids`.
    ///
    /// Builds the `f32` cache for `max_position_embeddings` rows on the
    /// device of `position_ids` first.
    ///
    /// # Arguments
    /// * `position_ids` - `[tokens]` absolute positions; the multimodal
    ///   variant also accepts `[tokens, sections]`, one stream per section
    ///
    /// # Returns
    /// `(cos, sin)`, each `[tokens, 1, rotary_dim/2]`
    ///
    /// # Errors
    /// Returns `ShapeMismatch` for badly shaped ids, or a candle error for
    /// out-of-range positions.
    pub fn get_cos_sin(&mut self, position_ids: &Tensor) -> Result<(Tensor, Tensor)> {
        let streams_needed = match &self.scaling {
            ScalingConfig::Mrope { sections } => sections.len(),
            _ => 0,
        };
        let device = position_ids.device().clone();
        let cache = self.cache_for(DType::F32, &device, self.max_position_embeddings)?;
        tracing::trace!("gathering rope rows for ids {:?}", position_ids.shape());

        match (position_ids.rank(), &cache.sections) {
            (1, _) => {
                let cos = cache.cos.index_select(position_ids, 0)?;
                let sin = cache.sin.index_select(position_ids, 0)?;
                Ok((cos.unsqueeze(1)?, sin.unsqueeze(1)?))
            }
            (2, Some(sections)) => {
                let (tokens, streams) = position_ids.dims2()?;
                if streams < streams_needed {
                    return Err(RotaryError::ShapeMismatch {
                        expected: vec![tokens, streams_needed],
                        actual: vec![tokens, streams],
                    });
                }
                let bands = cache.cos.dim(1)?;
                let flat = position_ids.flatten_all()?;
                let index = sections.narrow(0, 0, tokens)?;
                let cos = cache
                    .cos
                    .index_select(&flat, 0)?
                    .reshape((tokens, streams, bands))?
                    .gather(&index, 1)?;
                let sin = cache
                    .sin
                    .index_select(&flat, 0)?
                    .reshape((tokens, streams, bands))?
                    .gather(&index, 1)?;
                Ok((cos, sin))
            }
            _ => Err(RotaryError::ShapeMismatch {
                expected: vec![position_ids.dim(0)?],
                actual: position_ids.dims().to_vec(),
            }),
        }
    }

    /// Rotate `query` and `key` in place with gathered `cos` / `sin`.
    ///
    /// # Arguments
    /// * `query` - `[tokens, heads, head_size]` (or `[tokens, head_size]`), contiguous
    /// * `key` - `[tokens, kv_heads, head_size]`, contiguous
    /// * `cos`, `sin` - Output of [`Self::get_cos_sin`]
    ///
    /// # Errors
    /// See [`apply_rotary_in_place`].
    pub fn forward(&self, query: &Tensor, key: &Tensor, cos: &Tensor, sin: &Tensor) -> Result<()> {
        if query.device().is_cuda() {
            tracing::debug!("Using CUDA RoPE path for Q shape {:?}", query.shape());
        }
        apply_rotary_in_place(query, cos, sin, self.layout)?;
        apply_rotary_in_place(key, cos, sin, self.layout)
    }
}

#[allow(clippy::cast_possible_truncation)]
fn positions(start: usize, end: usize, device: &Device) -> Result<Tensor> {
    Ok(Tensor::arange(start as u32, end as u32, device)?.to_dtype(DType::F32)?)
}

/// Elementwise outer product `t ⊗ inv_freq` in `f32`.
fn outer(t: &Tensor, inv_freq: &Tensor, device: &Device) -> Result<Tensor> {
    let inv_freq = inv_freq.to_device(device)?.to_dtype(DType::F32)?;
    let len = t.dim(0)?;
    let bands = inv_freq.dim(0)?;
    Ok(t.reshape((len, 1))?
        .broadcast_mul(&inv_freq.reshape((1, bands))?)?)
}
