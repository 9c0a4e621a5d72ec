// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! In-place rotation of query/key tensors.
//!
//! Only the leading `rotary_dim = 2 * cos.dim(-1)` features of every head
//! are rotated; the remaining pass-through features are written back
//! unchanged. The result lands in the caller's storage through
//! [`Tensor::slice_set`], so the destination must be contiguous.
//!
//! ## Layouts
//!
//! ```text
//! Blockwise (GPT-NeoX): cos_full = [c0..c(h-1), c0..c(h-1)]
//!     x'_i     = x_i * c_i - x_{i+h} * s_i
//!     x'_{i+h} = x_{i+h} * c_i + x_i * s_i
//! Pairwise (GPT-J):     cos_full = [c0, c0, c1, c1, ...]
//!     x'_{2i}   = x_{2i} * c_i - x_{2i+1} * s_i
//!     x'_{2i+1} = x_{2i+1} * c_i + x_{2i} * s_i
//! ```

use candle_core::{Tensor, D};
use candle_nn::rotary_emb::{rope, rope_i};

use crate::error::{Result, RotaryError};

/// How the half-width cos/sin table is spread over the rotary features.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RotaryLayout {
    /// Halves rotated against each other (concatenated duplication).
    #[default]
    Blockwise,
    /// Adjacent pairs rotated together (interleaved duplication).
    Pairwise,
}

/// Rotate `x` in place.
///
/// # Arguments
/// * `x` - Query or key tensor `[tokens, ..., head_size]`, contiguous
/// * `cos` - Cosine rows `[tokens, 1, rotary_dim/2]` or `[tokens, rotary_dim/2]`
/// * `sin` - Sine rows, same shape as `cos`
/// * `layout` - Feature pairing
///
/// # Errors
/// - `NonContiguous` if `x` cannot be written in place
/// - `ShapeMismatch` if the tables do not match `x`
pub fn apply_rotary_in_place(
    x: &Tensor,
    cos: &Tensor,
    sin: &Tensor,
    layout: RotaryLayout,
) -> Result<()> {
    if !x.is_contiguous() {
        return Err(RotaryError::NonContiguous("rotary destination"));
    }

    let dims = x.dims().to_vec();
    let tokens = x.dim(0)?;
    let head_size = x.dim(D::Minus1)?;
    let half = cos.dim(D::Minus1)?;
    let rotary_dim = 2 * half;

    if cos.dims() != sin.dims() {
        return Err(RotaryError::ShapeMismatch {
            expected: cos.dims().to_vec(),
            actual: sin.dims().to_vec(),
        });
    }
    if rotary_dim > head_size || cos.elem_count() != tokens * half {
        return Err(RotaryError::ShapeMismatch {
            expected: vec![tokens, 1, head_size / 2],
            actual: cos.dims().to_vec(),
        });
    }
    if half == 0 || tokens == 0 {
        return Ok(());
    }

    let heads = x.elem_count() / (tokens * head_size);
    let view = x.reshape((tokens, heads, head_size))?;

    // The rope kernels expect [batch, heads, seq, dim] with [seq, dim/2] tables.
    let rot = view
        .narrow(2, 0, rotary_dim)?
        .transpose(0, 1)?
        .unsqueeze(0)?
        .contiguous()?;
    let cos = cos.reshape((tokens, half))?.to_dtype(x.dtype())?.contiguous()?;
    let sin = sin.reshape((tokens, half))?.to_dtype(x.dtype())?.contiguous()?;

    let rotated = match layout {
        RotaryLayout::Blockwise => rope(&rot, &cos, &sin)?,
        RotaryLayout::Pairwise => rope_i(&rot, &cos, &sin)?,
    };
    let rotated = rotated.squeeze(0)?.transpose(0, 1)?;

    let merged = if rotary_dim < head_size {
        let pass = view.narrow(2, rotary_dim, head_size - rotary_dim)?;
        Tensor::cat(&[&rotated, &pass], 2)?
    } else {
        rotated
    };
    let merged = merged.contiguous()?.reshape(dims)?;

    x.slice_set(&merged, 0, 0)?;
    Ok(())
}
