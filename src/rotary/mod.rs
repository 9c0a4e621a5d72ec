// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! Rotary position embeddings.
//!
//! - [`frequency`] - inverse-frequency math shared by all variants
//! - [`scaling`] - selection of the scaling strategy from configuration
//! - [`embedding`] - cos/sin cache engine and position gather
//! - [`apply`] - in-place rotation of query/key tensors

pub mod apply;
pub mod embedding;
pub mod frequency;
pub mod scaling;

pub use apply::{apply_rotary_in_place, RotaryLayout};
pub use embedding::{PositionRotaryEmbedding, ResolveContext};
pub use scaling::{Llama3Params, LongRopeParams, ScalingConfig, YarnParams};
