//! Recorded domain events and the per-aggregate pending list.

use chrono::{DateTime, Duration, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

use folio_core::{AggregateId, EventId};

use crate::error::EventError;
use crate::event::{Event, EventDescriptor};

/// A recorded domain event: the payload plus the identity and time it was
/// recorded with.
///
/// Fields are private; a `DomainEvent` never changes after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainEvent<E> {
    event_id: EventId,
    aggregate_id: AggregateId,
    occurred_at: DateTime<Utc>,
    payload: E,
}

impl<E: Event> DomainEvent<E> {
    /// Wrap a payload, assigning a fresh (time-ordered) event id.
    pub fn new(payload: E) -> Self {
        Self::with_id(EventId::new(), payload)
    }

    pub fn with_id(event_id: EventId, payload: E) -> Self {
        Self {
            event_id,
            aggregate_id: payload.aggregate_id(),
            occurred_at: payload.occurred_at(),
            payload,
        }
    }

    pub fn descriptor(&self) -> &'static EventDescriptor {
        self.payload.descriptor()
    }

    pub fn event_type(&self) -> &'static str {
        self.payload.event_type()
    }
}

impl<E> DomainEvent<E> {
    pub fn event_id(&self) -> EventId {
        self.event_id
    }

    pub fn aggregate_id(&self) -> AggregateId {
        self.aggregate_id
    }

    pub fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }

    pub fn payload(&self) -> &E {
        &self.payload
    }

    pub fn into_payload(self) -> E {
        self.payload
    }
}

/// Events raised by an aggregate that have not been handed to storage yet.
///
/// Purely in-memory. Storage drains the list into outbox rows inside the same
/// unit of work that persists the aggregate, so nothing recorded here is
/// visible outside until that unit of work commits.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingEvents<E> {
    events: Vec<DomainEvent<E>>,
}

impl<E> Default for PendingEvents<E> {
    fn default() -> Self {
        Self { events: Vec::new() }
    }
}

impl<E: Event> PendingEvents<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an event raised by the aggregate identified by `owner`.
    pub fn record(&mut self, owner: AggregateId, payload: E) -> Result<&DomainEvent<E>, EventError> {
        let found = payload.aggregate_id();
        if found != owner {
            return Err(EventError::AggregateMismatch { owner, found });
        }

        self.events.push(DomainEvent::new(payload));
        let last = self.events.len() - 1;
        Ok(&self.events[last])
    }

    /// Take every pending event, leaving the list empty.
    pub fn drain(&mut self) -> Vec<DomainEvent<E>> {
        std::mem::take(&mut self.events)
    }

    pub fn iter(&self) -> impl Iterator<Item = &DomainEvent<E>> {
        self.events.iter()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// Occurrence time for the next event of an aggregate whose previous event
/// was stamped `last`.
///
/// Stamps are truncated to microseconds (what Postgres `TIMESTAMPTZ` keeps)
/// and strictly increase per aggregate, so two events of the same type on one
/// aggregate never share a [`DedupKey`](crate::DedupKey) even when the clock
/// returns the same instant twice or steps backwards.
pub fn next_occurred_at(last: Option<DateTime<Utc>>, now: DateTime<Utc>) -> DateTime<Utc> {
    let now = now.trunc_subsecs(6);
    match last {
        Some(last) if now <= last => last + Duration::microseconds(1),
        _ => now,
    }
}

/// Aggregates that accumulate events for the outbox.
pub trait RecordsEvents {
    type Event: Event;

    fn aggregate_id(&self) -> AggregateId;

    fn pending_events(&self) -> &PendingEvents<Self::Event>;

    fn pending_events_mut(&mut self) -> &mut PendingEvents<Self::Event>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{NoteEvent, note_created};
    use chrono::TimeZone;

    #[test]
    fn new_event_copies_identity_from_payload() {
        let id = AggregateId::new();
        let payload = note_created(id, "hello");
        let event = DomainEvent::new(payload.clone());

        assert_eq!(event.aggregate_id(), id);
        assert_eq!(event.occurred_at(), payload.occurred_at());
        assert_eq!(event.event_type(), "notes.note.created");
        assert_ne!(event.event_id(), EventId::nil());
    }

    #[test]
    fn record_rejects_event_for_another_aggregate() {
        let owner = AggregateId::new();
        let other = AggregateId::new();
        let mut pending = PendingEvents::<NoteEvent>::new();

        let err = pending.record(owner, note_created(other, "x")).unwrap_err();
        assert_eq!(err, EventError::AggregateMismatch { owner, found: other });
        assert!(pending.is_empty());
    }

    #[test]
    fn next_occurred_at_is_strictly_increasing() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap() + Duration::nanoseconds(1_500);

        let first = next_occurred_at(None, now);
        assert_eq!(first.timestamp_subsec_nanos(), 1_000);

        let second = next_occurred_at(Some(first), now);
        assert_eq!(second - first, Duration::microseconds(1));

        let behind = next_occurred_at(Some(second), now - Duration::seconds(5));
        assert_eq!(behind - second, Duration::microseconds(1));

        let later = now + Duration::seconds(1);
        assert_eq!(next_occurred_at(Some(behind), later), later.trunc_subsecs(6));
    }

    #[test]
    fn drain_empties_the_list_in_recording_order() {
        let owner = AggregateId::new();
        let mut pending = PendingEvents::<NoteEvent>::new();
        pending.record(owner, note_created(owner, "first")).unwrap();
        pending.record(owner, note_created(owner, "second")).unwrap();
        assert_eq!(pending.len(), 2);

        let drained = pending.drain();
        assert!(pending.is_empty());

        let texts: Vec<_> = drained
            .iter()
            .map(|e| match e.payload() {
                NoteEvent::Created { text, .. } => text.clone(),
                NoteEvent::Touched { .. } => String::new(),
            })
            .collect();
        assert_eq!(texts, vec!["first".to_string(), "second".to_string()]);
    }
}
