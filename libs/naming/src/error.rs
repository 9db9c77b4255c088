//! Error types for codec construction.

use thiserror::Error;

/// Errors raised while building a codec or its parts.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NameError {
    /// The version tag is empty or contains non-digit characters.
    #[error("invalid version tag {0:?}: expected ASCII digits")]
    InvalidVersion(String),

    /// The name prefix is unusable.
    #[error("invalid name prefix {prefix:?}: {reason}")]
    InvalidPrefix { prefix: String, reason: &'static str },
}
