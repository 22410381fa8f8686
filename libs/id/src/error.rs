//! Identifier parsing errors.

use thiserror::Error;

/// Errors returned when a string is not a valid typed identifier.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    #[error("identifier is empty")]
    Empty,

    /// The string has no `_` between prefix and ULID.
    #[error("identifier has no '_' separator")]
    MissingSeparator,

    #[error("wrong identifier kind: expected '{expected}_', got '{actual}_'")]
    InvalidPrefix {
        expected: &'static str,
        actual: String,
    },

    #[error("invalid ULID: {0}")]
    InvalidUlid(String),
}

impl IdError {
    /// Returns true when the identifier belongs to another kind.
    pub fn is_prefix_error(&self) -> bool {
        matches!(self, IdError::InvalidPrefix { .. })
    }
}
