//! # rotary-embed
//!
//! Rotary position embeddings (`RoPE`) for LLM inference, built on
//! [Candle](https://github.com/huggingface/candle).
//!
//! Supported scaling strategies, selected from a model's `config.json`:
//!
//! - Plain and linear `RoPE`
//! - Dynamic NTK base rescaling
//! - `YaRN` ramp blending with magnitude correction
//! - Su / `LongRoPE` short and long tables, including the Phi-3 variant
//! - Llama 3 wavelength smoothing
//! - Multimodal sectioned `RoPE` (temporal / height / width streams)
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use rotary_embed::config::RotaryConfig;
//! use rotary_embed::rotary::{PositionRotaryEmbedding, ResolveContext};
//! use candle_core::{Device, Tensor};
//!
//! let device = Device::Cpu;
//! let config = RotaryConfig::from_file("config.json")?;
//! let mut rope = PositionRotaryEmbedding::from_config(
//!     &config,
//!     config.rotary_dim(128),
//!     config.rope_theta,
//!     &ResolveContext::from_env(&device),
//! )?;
//!
//! let (cos, sin) = rope.get_cos_sin(&position_ids)?;
//! rope.forward(&query, &key, &cos, &sin)?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::pedantic)]

pub mod config;
pub mod error;
pub mod memory;
pub mod rotary;
pub mod weights;

pub use error::{Result, RotaryError};
