//! Error types for ID parsing and validation.

use thiserror::Error;

/// Errors that can occur when parsing or validating IDs.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    /// The ID string is empty.
    #[error("{kind} cannot be empty")]
    Empty { kind: &'static str },

    /// The ID contains a character that is not allowed in a path segment.
    #[error("invalid character {ch:?} in {kind} '{value}'")]
    InvalidCharacter {
        kind: &'static str,
        ch: char,
        value: String,
    },
}

impl IdError {
    /// Returns true if this error indicates the input was empty.
    pub fn is_empty(&self) -> bool {
        matches!(self, IdError::Empty { .. })
    }
}

/// Validate that `value` is usable as a single URL path segment.
pub(crate) fn validate_segment(kind: &'static str, value: &str) -> Result<(), IdError> {
    if value.is_empty() {
        return Err(IdError::Empty { kind });
    }

    if let Some(ch) = value
        .chars()
        .find(|c| matches!(c, '/' | '?' | '#' | '%') || c.is_whitespace() || c.is_control())
    {
        return Err(IdError::InvalidCharacter {
            kind,
            ch,
            value: value.to_string(),
        });
    }

    Ok(())
}
