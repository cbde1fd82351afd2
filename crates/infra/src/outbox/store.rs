use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use folio_events::EventError;

use super::message::{OutboxMessage, OutboxStatus};

#[derive(Debug, Error)]
pub enum OutboxError {
    #[error("event type not registered: {0}")]
    Unregistered(String),

    #[error("failed to serialize {event_type}: {message}")]
    Serialization { event_type: String, message: String },

    #[error("outbox message not found: {0}")]
    NotFound(Uuid),

    #[error("outbox message {id} is {status}, cannot {operation}")]
    InvalidTransition {
        id: Uuid,
        status: OutboxStatus,
        operation: &'static str,
    },

    #[error("outbox storage error: {0}")]
    Storage(String),
}

impl From<EventError> for OutboxError {
    fn from(err: EventError) -> Self {
        match err {
            EventError::Unregistered(event_type) => OutboxError::Unregistered(event_type),
            other => OutboxError::Storage(other.to_string()),
        }
    }
}

/// Row counts per status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OutboxStats {
    pub pending: usize,
    pub published: usize,
    pub failed: usize,
    pub archived: usize,
}

/// Relay-facing and operator-facing access to the outbox table.
///
/// Appending happens inside a write transaction (see `append_events`); this
/// trait covers everything after commit.
pub trait OutboxStore: Send + Sync {
    /// Lease up to `limit` pending rows in `(created_at, sequence)` order.
    ///
    /// A row is skipped when an earlier pending row of the same aggregate is
    /// leased or backing off, so one aggregate's events are never published
    /// out of order. Claimed rows stay pending until they are marked.
    fn claim_batch(&self, limit: usize, lease: chrono::Duration) -> Result<Vec<OutboxMessage>, OutboxError>;

    /// Drop the lease on a claimed row without counting an attempt.
    fn release(&self, id: Uuid) -> Result<(), OutboxError>;

    /// The broker acknowledged the row.
    fn mark_published(&self, id: Uuid) -> Result<(), OutboxError>;

    /// Count a failed publish. `retry_after = None` parks the row as failed.
    fn record_failure(
        &self,
        id: Uuid,
        error: &str,
        retry_after: Option<chrono::Duration>,
    ) -> Result<OutboxStatus, OutboxError>;

    fn get(&self, id: Uuid) -> Result<Option<OutboxMessage>, OutboxError>;

    /// Rows in relay order, optionally filtered by status.
    fn list(&self, status: Option<OutboxStatus>, limit: usize) -> Result<Vec<OutboxMessage>, OutboxError>;

    /// Put a parked row back in the queue with a fresh attempt budget.
    fn requeue(&self, id: Uuid) -> Result<(), OutboxError>;

    /// Move rows published before `before` out of the live table.
    fn archive_published(&self, before: DateTime<Utc>) -> Result<usize, OutboxError>;

    fn stats(&self) -> Result<OutboxStats, OutboxError>;
}

impl<S> OutboxStore for Arc<S>
where
    S: OutboxStore + ?Sized,
{
    fn claim_batch(&self, limit: usize, lease: chrono::Duration) -> Result<Vec<OutboxMessage>, OutboxError> {
        (**self).claim_batch(limit, lease)
    }

    fn release(&self, id: Uuid) -> Result<(), OutboxError> {
        (**self).release(id)
    }

    fn mark_published(&self, id: Uuid) -> Result<(), OutboxError> {
        (**self).mark_published(id)
    }

    fn record_failure(
        &self,
        id: Uuid,
        error: &str,
        retry_after: Option<chrono::Duration>,
    ) -> Result<OutboxStatus, OutboxError> {
        (**self).record_failure(id, error, retry_after)
    }

    fn get(&self, id: Uuid) -> Result<Option<OutboxMessage>, OutboxError> {
        (**self).get(id)
    }

    fn list(&self, status: Option<OutboxStatus>, limit: usize) -> Result<Vec<OutboxMessage>, OutboxError> {
        (**self).list(status, limit)
    }

    fn requeue(&self, id: Uuid) -> Result<(), OutboxError> {
        (**self).requeue(id)
    }

    fn archive_published(&self, before: DateTime<Utc>) -> Result<usize, OutboxError> {
        (**self).archive_published(before)
    }

    fn stats(&self) -> Result<OutboxStats, OutboxError> {
        (**self).stats()
    }
}
