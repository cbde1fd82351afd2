use thiserror::Error;

use folio_core::{AggregateId, ExpectedVersion};

use crate::outbox::OutboxError;

#[derive(Debug, Error)]
pub enum StorageError {
    /// The stored version stamp did not match the expectation.
    #[error("concurrency conflict on {kind} {id}: expected {expected:?}, found {actual:?}")]
    Concurrency {
        kind: String,
        id: AggregateId,
        expected: ExpectedVersion,
        actual: Option<u64>,
    },

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error(transparent)]
    Outbox(#[from] OutboxError),

    #[error("storage lock poisoned")]
    Poisoned,
}

impl StorageError {
    pub fn is_concurrency(&self) -> bool {
        matches!(self, StorageError::Concurrency { .. })
    }
}
