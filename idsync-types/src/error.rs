//! Error types for the asset model.

use thiserror::Error;

/// Errors raised while interpreting asset data.
#[derive(Debug, Error)]
pub enum IdError {
    /// Unrecognised asset kind name
    #[error("unknown asset kind: {0}")]
    UnknownKind(String),

    /// Event field path was empty or addressed through a non-object value
    #[error("invalid field path: {0}")]
    InvalidFieldPath(String),
}
