//! Errors produced when parsing entity ids.

use thiserror::Error;

/// Errors that can occur when parsing a typed id from a string.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    /// The input string is empty.
    #[error("id cannot be empty")]
    Empty,

    /// The input has no `_` between prefix and ULID.
    #[error("id missing underscore separator")]
    MissingSeparator,

    /// The prefix names a different entity type.
    #[error("invalid id prefix: expected '{expected}', got '{actual}'")]
    InvalidPrefix {
        expected: &'static str,
        actual: String,
    },

    /// The ULID portion is not a valid ULID.
    #[error("invalid ULID: {0}")]
    InvalidUlid(String),
}

impl IdError {
    /// Returns true if this error indicates a prefix mismatch.
    pub fn is_prefix_error(&self) -> bool {
        matches!(self, IdError::InvalidPrefix { .. })
    }
}
