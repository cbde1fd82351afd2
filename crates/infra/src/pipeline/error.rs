use thiserror::Error;

use folio_core::DomainError;
use folio_events::ValidationErrors;

use crate::outbox::OutboxError;
use crate::storage::StorageError;

/// Everything a command execution can fail with.
#[derive(Debug, Error)]
pub enum CommandError {
    /// Rejected before any side effect.
    #[error("validation failed: {0}")]
    Validation(ValidationErrors),

    #[error("not found")]
    NotFound,

    /// A domain invariant rejected the change.
    #[error("domain rule violated: {0}")]
    Domain(String),

    /// Optimistic concurrency conflict on a single attempt. Retryable.
    #[error("concurrency conflict: {0}")]
    Concurrency(String),

    /// Conflicts persisted through every allowed retry.
    #[error("concurrency conflict persisted after {attempts} attempts: {message}")]
    ConflictExhausted { attempts: u32, message: String },

    #[error("cancelled")]
    Cancelled,

    #[error("outbox error: {0}")]
    Outbox(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl CommandError {
    pub fn is_concurrency(&self) -> bool {
        matches!(self, CommandError::Concurrency(_))
    }

    /// Short outcome label for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            CommandError::Validation(_) => "validation",
            CommandError::NotFound => "not_found",
            CommandError::Domain(_) => "domain",
            CommandError::Concurrency(_) => "concurrency",
            CommandError::ConflictExhausted { .. } => "conflict_exhausted",
            CommandError::Cancelled => "cancelled",
            CommandError::Outbox(_) => "outbox",
            CommandError::Serialization(_) => "serialization",
            CommandError::Storage(_) => "storage",
        }
    }
}

impl From<ValidationErrors> for CommandError {
    fn from(errors: ValidationErrors) -> Self {
        CommandError::Validation(errors)
    }
}

impl From<DomainError> for CommandError {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::Validation(msg) | DomainError::InvalidId(msg) => {
                CommandError::Validation(ValidationErrors::single("command", msg))
            }
            DomainError::NotFound => CommandError::NotFound,
            DomainError::Conflict(msg) => CommandError::Concurrency(msg),
            DomainError::InvariantViolation(msg) => CommandError::Domain(msg),
        }
    }
}

impl From<OutboxError> for CommandError {
    fn from(err: OutboxError) -> Self {
        match err {
            OutboxError::Serialization { .. } => CommandError::Serialization(err.to_string()),
            other => CommandError::Outbox(other.to_string()),
        }
    }
}

impl From<StorageError> for CommandError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Concurrency { .. } => CommandError::Concurrency(err.to_string()),
            StorageError::Serialization(msg) => CommandError::Serialization(msg),
            StorageError::Outbox(inner) => inner.into(),
            StorageError::Poisoned => CommandError::Storage(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use folio_core::{AggregateId, ExpectedVersion};

    #[test]
    fn storage_conflicts_become_retryable_concurrency_errors() {
        let err: CommandError = StorageError::Concurrency {
            kind: "catalog.book".into(),
            id: AggregateId::new(),
            expected: ExpectedVersion::Exact(1),
            actual: Some(2),
        }
        .into();
        assert!(err.is_concurrency());
    }

    #[test]
    fn domain_errors_map_by_kind() {
        assert!(matches!(CommandError::from(DomainError::not_found()), CommandError::NotFound));
        assert!(matches!(
            CommandError::from(DomainError::validation("title must not be empty")),
            CommandError::Validation(_)
        ));
        assert_eq!(CommandError::from(DomainError::invariant("deleted")).kind(), "domain");
    }

    #[test]
    fn unregistered_events_are_outbox_errors() {
        let err: CommandError = StorageError::Outbox(OutboxError::Unregistered("x".into())).into();
        assert_eq!(err.kind(), "outbox");
    }
}
