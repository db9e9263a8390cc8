//! Core error model.

use thiserror::Error;

/// Result type used by the core primitives.
pub type CoreResult<T> = Result<T, CoreError>;

/// Core-level error.
///
/// Kept to the failures the primitives themselves can produce. Engine errors
/// live in `flowforge-work`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A duration could not be represented on the clock's timeline.
    #[error("duration out of range: {0}")]
    DurationOutOfRange(String),
}

impl CoreError {
    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn duration_out_of_range(msg: impl Into<String>) -> Self {
        Self::DurationOutOfRange(msg.into())
    }
}
