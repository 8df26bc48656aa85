//! Errors raised by pure domain code: command handlers, id parsing and the
//! aggregate fold.

use thiserror::Error;

pub type DomainResult<T> = Result<T, DomainError>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// The command or value is malformed, or not allowed in the current state.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The stream is not where the caller expected it to be.
    #[error("version conflict: {0}")]
    Conflict(String),

    /// The aggregate does not exist (empty stream or deleted).
    #[error("aggregate not found")]
    NotFound,

    /// Malformed aggregate, event or sortable id.
    #[error("invalid id: {0}")]
    InvalidIdFormat(String),

    /// Stored events contradict each other (version gap, foreign stream).
    #[error("invariant violated: {0}")]
    InvariantViolation(String),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn not_found() -> Self {
        Self::NotFound
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidIdFormat(msg.into())
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::InvariantViolation(msg.into())
    }
}
