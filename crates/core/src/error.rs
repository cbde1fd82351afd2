//! Errors raised by aggregates and value types before anything is stored.

use thiserror::Error;

pub type DomainResult<T> = Result<T, DomainError>;

/// Why an aggregate refused a change.
///
/// These are decided from the aggregate's own state and the command input.
/// The pipeline maps them onto command outcomes: `Conflict` becomes a
/// retryable concurrency failure, every other variant is final.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// Command input the aggregate cannot accept (blank title, oversized field).
    #[error("invalid input: {0}")]
    Validation(String),

    /// The change is well-formed but not allowed in the aggregate's current
    /// state, such as editing a deleted book.
    #[error("rejected by aggregate: {0}")]
    InvariantViolation(String),

    /// A textual id did not parse as the expected id type.
    #[error("malformed id: {0}")]
    InvalidId(String),

    /// The aggregate does not exist, or no longer does.
    #[error("aggregate not found")]
    NotFound,

    /// The caller's version stamp is stale: someone else wrote the aggregate
    /// after it was loaded. Reloading and re-running the command may succeed.
    #[error("stale version stamp: {0}")]
    Conflict(String),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::InvariantViolation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn not_found() -> Self {
        Self::NotFound
    }

    /// Only a stale version stamp is worth retrying against fresh state.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}
