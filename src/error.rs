// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! Error types for rotary-embed.

use thiserror::Error;

/// Result type alias for rotary-embed operations.
pub type Result<T> = std::result::Result<T, RotaryError>;

/// Errors that can occur while resolving, building or applying rotary embeddings.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum RotaryError {
    /// Malformed or missing scaling parameters.
    #[error("invalid rotary configuration: {0}")]
    Configuration(String),

    /// Unrecognized scaling type.
    #[error("rope scaling type {0} is not implemented or invalid")]
    UnsupportedConfiguration(String),

    /// Numeric precondition violated while deriving frequencies.
    #[error("numeric precondition violated: {0}")]
    NumericPrecondition(String),

    /// Shape mismatch.
    #[error("shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        /// Expected shape
        expected: Vec<usize>,
        /// Actual shape
        actual: Vec<usize>,
    },

    /// Weight source has no tensor with this name.
    #[error("missing weight: {0}")]
    MissingWeight(String),

    /// In-place destination is not contiguous.
    #[error("{0} must be contiguous for in-place rotation")]
    NonContiguous(&'static str),

    /// Config file could not be read.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Config file could not be parsed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Candle error.
    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),
}

impl RotaryError {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }
}
