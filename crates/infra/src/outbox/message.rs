use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use folio_core::{AggregateId, EventId};
use folio_events::{BrokerMessage, DedupKey};

/// Delivery state of an outbox row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxStatus {
    /// Not yet acknowledged by the broker (possibly leased or backing off).
    Pending,
    /// Acknowledged by the broker. Terminal until archived.
    Published,
    /// Parked after exhausting the retry ceiling. Needs an operator requeue.
    Failed,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "pending",
            OutboxStatus::Published => "published",
            OutboxStatus::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(OutboxStatus::Pending),
            "published" => Some(OutboxStatus::Published),
            "failed" => Some(OutboxStatus::Failed),
            _ => None,
        }
    }
}

impl core::fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A serialized domain event waiting in the outbox table.
///
/// Rows are written in the same transaction as the entity change that raised
/// the event, then picked up by the relay. `id` is the event id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxMessage {
    pub id: Uuid,
    pub event_type: String,
    pub aggregate_type: String,
    pub aggregate_id: AggregateId,
    pub payload: JsonValue,
    pub occurred_at: DateTime<Utc>,
    /// Commit time. Together with `sequence` this defines relay order.
    pub created_at: DateTime<Utc>,
    /// Insertion sequence, assigned by the store on commit.
    pub sequence: u64,
    pub status: OutboxStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
    /// Relay lease; the row is invisible to other claims until this passes.
    pub claimed_until: Option<DateTime<Utc>>,
    /// Backoff; the row is not retried before this instant.
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub published_at: Option<DateTime<Utc>>,
}

impl OutboxMessage {
    pub fn event_id(&self) -> EventId {
        EventId::from_uuid(self.id)
    }

    pub fn dedup_key(&self) -> DedupKey {
        DedupKey::derive(self.aggregate_id, self.occurred_at, &self.event_type)
    }

    /// Whether a relay may claim this row at `now` (ignoring per-aggregate ordering).
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        self.status == OutboxStatus::Pending
            && self.claimed_until.is_none_or(|until| until <= now)
            && self.next_attempt_at.is_none_or(|at| at <= now)
    }

    /// Build the broker message for one publish attempt.
    ///
    /// Each call gets a fresh transport id; the dedup key stays the same.
    pub fn to_broker_message(&self) -> BrokerMessage {
        BrokerMessage {
            message_id: Uuid::new_v4(),
            event_id: self.event_id(),
            event_type: self.event_type.clone(),
            aggregate_type: self.aggregate_type.clone(),
            aggregate_id: self.aggregate_id,
            occurred_at: self.occurred_at,
            payload: self.payload.clone(),
            dedup_key: self.dedup_key(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(now: DateTime<Utc>) -> OutboxMessage {
        OutboxMessage {
            id: Uuid::now_v7(),
            event_type: "catalog.book.created".into(),
            aggregate_type: "catalog.book".into(),
            aggregate_id: AggregateId::new(),
            payload: serde_json::json!({"title": "Dune"}),
            occurred_at: now,
            created_at: now,
            sequence: 1,
            status: OutboxStatus::Pending,
            attempts: 0,
            last_error: None,
            claimed_until: None,
            next_attempt_at: None,
            published_at: None,
        }
    }

    #[test]
    fn leased_or_backing_off_rows_are_not_claimable() {
        let now = Utc::now();
        let mut row = message(now);
        assert!(row.is_claimable(now));

        row.claimed_until = Some(now + chrono::Duration::seconds(30));
        assert!(!row.is_claimable(now));
        assert!(row.is_claimable(now + chrono::Duration::seconds(30)));

        row.claimed_until = None;
        row.next_attempt_at = Some(now + chrono::Duration::seconds(5));
        assert!(!row.is_claimable(now));

        row.next_attempt_at = None;
        row.status = OutboxStatus::Failed;
        assert!(!row.is_claimable(now));
    }

    #[test]
    fn broker_messages_share_dedup_key_across_publishes() {
        let row = message(Utc::now());
        let first = row.to_broker_message();
        let second = row.to_broker_message();

        assert_ne!(first.message_id, second.message_id);
        assert_eq!(first.dedup_key, second.dedup_key);
        assert_eq!(first.dedup_key, first.content_key());
        assert_eq!(first.event_id.as_uuid(), &row.id);
    }

    #[test]
    fn status_round_trips_through_str() {
        for status in [OutboxStatus::Pending, OutboxStatus::Published, OutboxStatus::Failed] {
            assert_eq!(OutboxStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(OutboxStatus::parse("archived"), None);
    }
}
