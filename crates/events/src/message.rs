use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use folio_core::{AggregateId, EventId};

use crate::dedup::DedupKey;

/// One relayed event as it travels over the message broker.
///
/// `message_id` is a transport id and changes on every publish; consumers
/// must deduplicate on [`content_key`](Self::content_key) instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerMessage {
    pub message_id: Uuid,
    pub event_id: EventId,
    pub event_type: String,
    pub aggregate_type: String,
    pub aggregate_id: AggregateId,
    pub occurred_at: DateTime<Utc>,
    pub payload: JsonValue,
    /// Key computed by the publisher. Informational; see `content_key`.
    pub dedup_key: DedupKey,
}

impl BrokerMessage {
    /// Recompute the dedup key from the message content.
    pub fn content_key(&self) -> DedupKey {
        DedupKey::derive(self.aggregate_id, self.occurred_at, &self.event_type)
    }
}
