//! Error types for the RT-DETR training core.
//!
//! All fallible library APIs return [`Result<T>`], which wraps [`DetrError`].
//! Candle, YAML, JSON and I/O errors convert automatically with `?`.

use thiserror::Error;

/// Errors raised while configuring or running the matching, loss and
/// decoding components.
#[derive(Debug, Error)]
pub enum DetrError {
    /// Configuration value out of range or inconsistent with another value.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A tensor or collaborator does not have the shape the configuration
    /// promises (e.g. logits last dim != `num_classes`).
    #[error("shape mismatch: {0}")]
    Shape(String),

    /// The assignment solver was handed a NaN or infinite cost.
    #[error("cost matrix has a non-finite entry at row {row}, column {col}")]
    NonFiniteCost { row: usize, col: usize },

    #[error(transparent)]
    Candle(#[from] candle_core::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, DetrError>;

impl DetrError {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        DetrError::Config(msg.into())
    }

    pub(crate) fn shape(msg: impl Into<String>) -> Self {
        DetrError::Shape(msg.into())
    }
}
