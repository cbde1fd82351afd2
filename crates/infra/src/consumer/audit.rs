//! Audit trail consumer handler.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use folio_core::{AggregateId, EventId};
use folio_events::{BrokerMessage, EventRegistry};

use super::error::ApplyError;
use super::idempotent::EventHandler;
use super::store::ConsumerTxn;

pub const AUDIT_ENTRIES_TABLE: &str = "audit_entries";
/// Number of audited events per aggregate.
pub const AUDIT_COUNTS_TABLE: &str = "audit_counts";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub event_id: EventId,
    pub event_type: String,
    pub aggregate_type: String,
    pub aggregate_id: AggregateId,
    pub occurred_at: DateTime<Utc>,
    pub payload: JsonValue,
}

impl From<&BrokerMessage> for AuditEntry {
    fn from(message: &BrokerMessage) -> Self {
        Self {
            event_id: message.event_id,
            event_type: message.event_type.clone(),
            aggregate_type: message.aggregate_type.clone(),
            aggregate_id: message.aggregate_id,
            occurred_at: message.occurred_at,
            payload: message.payload.clone(),
        }
    }
}

/// Records every relayed event it is subscribed to.
#[derive(Debug, Clone)]
pub struct AuditTrailHandler {
    event_types: Vec<&'static str>,
}

impl AuditTrailHandler {
    pub fn new(event_types: Vec<&'static str>) -> Self {
        Self { event_types }
    }

    /// Subscribe to every relayed type in `registry`.
    pub fn for_registry(registry: &EventRegistry) -> Self {
        let mut event_types: Vec<&'static str> = registry
            .event_types()
            .filter(|t| registry.describe(t).is_some_and(|d| d.relay))
            .collect();
        event_types.sort_unstable();
        Self { event_types }
    }
}

impl EventHandler for AuditTrailHandler {
    fn event_types(&self) -> &[&'static str] {
        &self.event_types
    }

    fn apply(&self, message: &BrokerMessage, txn: &mut ConsumerTxn<'_>) -> Result<(), ApplyError> {
        let entry = serde_json::to_value(AuditEntry::from(message))
            .map_err(|e| ApplyError::permanent(e.to_string()))?;
        txn.put(AUDIT_ENTRIES_TABLE, message.event_id.to_string(), entry);

        let aggregate_key = message.aggregate_id.to_string();
        let seen = txn
            .get(AUDIT_COUNTS_TABLE, &aggregate_key)
            .map_err(|e| ApplyError::transient(e.to_string()))?
            .and_then(|v| v.as_u64())
            .unwrap_or(0);
        txn.put(AUDIT_COUNTS_TABLE, aggregate_key, serde_json::json!(seen + 1));
        Ok(())
    }
}
