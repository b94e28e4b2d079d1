//! Error types for name parsing and validation.

use thiserror::Error;

/// Errors that can occur when parsing or validating names.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NameError {
    /// The name string is empty.
    #[error("name cannot be empty")]
    Empty,

    /// The name exceeds the maximum length.
    #[error("name too long: {len} characters (max {max})")]
    TooLong { len: usize, max: usize },

    /// The name does not start with an alphanumeric character.
    #[error("name must start with an alphanumeric character, got '{0}'")]
    InvalidStart(char),

    /// The name contains a character outside `[A-Za-z0-9._-]`.
    #[error("invalid character '{0}' in name")]
    InvalidChar(char),
}

impl NameError {
    /// Returns true if this error indicates the input was empty.
    pub fn is_empty(&self) -> bool {
        matches!(self, NameError::Empty)
    }
}
