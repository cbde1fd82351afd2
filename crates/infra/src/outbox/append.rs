use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

use folio_events::{DomainEvent, Event, EventRegistry};

use super::message::{OutboxMessage, OutboxStatus};
use super::store::OutboxError;

/// A write transaction that can carry outbox rows to its commit.
pub trait OutboxTransaction {
    /// Stage a row. It becomes visible to the relay only if the transaction commits.
    fn stage_outbox(&mut self, message: OutboxMessage);
}

/// Append the relayed subset of `events` to `txn`'s outbox.
///
/// Every event type must be registered. Types whose descriptor is local-only
/// are skipped. Returns the number of rows staged.
pub fn append_events<E, T>(
    txn: &mut T,
    registry: &EventRegistry,
    events: &[DomainEvent<E>],
    staged_at: DateTime<Utc>,
) -> Result<usize, OutboxError>
where
    E: Event + Serialize,
    T: OutboxTransaction + ?Sized,
{
    let messages = to_outbox_messages(registry, events, staged_at)?;
    let count = messages.len();
    for message in messages {
        txn.stage_outbox(message);
    }
    Ok(count)
}

/// Serialize `events` into outbox rows without staging them.
///
/// Fails as a whole: one unregistered or unserializable event rejects the batch.
pub fn to_outbox_messages<E>(
    registry: &EventRegistry,
    events: &[DomainEvent<E>],
    staged_at: DateTime<Utc>,
) -> Result<Vec<OutboxMessage>, OutboxError>
where
    E: Event + Serialize,
{
    let mut messages = Vec::with_capacity(events.len());

    for event in events {
        let descriptor = registry.require(event.event_type())?;
        if !descriptor.relay {
            debug!(event_type = descriptor.event_type, "event is local-only, not relayed");
            continue;
        }

        let payload = serde_json::to_value(event.payload()).map_err(|e| OutboxError::Serialization {
            event_type: descriptor.event_type.to_string(),
            message: e.to_string(),
        })?;

        messages.push(OutboxMessage {
            id: *event.event_id().as_uuid(),
            event_type: descriptor.event_type.to_string(),
            aggregate_type: descriptor.aggregate_type.to_string(),
            aggregate_id: event.aggregate_id(),
            payload,
            occurred_at: event.occurred_at(),
            created_at: staged_at,
            sequence: 0,
            status: OutboxStatus::Pending,
            attempts: 0,
            last_error: None,
            claimed_until: None,
            next_attempt_at: None,
            published_at: None,
        });
    }

    Ok(messages)
}
