use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, warn};

use folio_core::Clock;
use folio_events::BrokerMessage;

use super::error::{ApplyError, ConsumerError};
use super::store::{CommitOutcome, ConsumerStore, ConsumerTxn, DedupRecord};

/// Applies one kind of relayed event to a read model or side effect.
///
/// Handlers only stage writes on the transaction; the consumer commits them
/// together with the dedup record.
pub trait EventHandler: Send + Sync {
    /// Event types this handler reacts to.
    fn event_types(&self) -> &[&'static str];

    fn apply(&self, message: &BrokerMessage, txn: &mut ConsumerTxn<'_>) -> Result<(), ApplyError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumeOutcome {
    /// Handlers ran and their writes committed with the dedup record.
    Applied,
    /// The event had already been applied by this consumer.
    Duplicate,
    /// No handler is interested in this event type.
    Ignored,
}

/// Exactly-once application on top of at-least-once delivery.
///
/// For every message the consumer derives the content dedup key, skips it if
/// already recorded, otherwise runs the interested handlers and commits their
/// writes and the dedup record in one transaction.
pub struct IdempotentConsumer<S> {
    name: String,
    store: S,
    handlers: Vec<Arc<dyn EventHandler>>,
    routes: HashMap<String, Vec<usize>>,
    clock: Arc<dyn Clock>,
}

impl<S: ConsumerStore> IdempotentConsumer<S> {
    pub fn new(name: impl Into<String>, store: S, clock: Arc<dyn Clock>) -> Self {
        Self {
            name: name.into(),
            store,
            handlers: Vec::new(),
            routes: HashMap::new(),
            clock,
        }
    }

    pub fn with_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        let index = self.handlers.len();
        for event_type in handler.event_types() {
            self.routes.entry(event_type.to_string()).or_default().push(index);
        }
        self.handlers.push(handler);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    pub fn consume(&self, message: &BrokerMessage) -> Result<ConsumeOutcome, ConsumerError> {
        let handlers = match self.routes.get(&message.event_type) {
            Some(handlers) if !handlers.is_empty() => handlers,
            _ => {
                debug!(consumer = %self.name, event_type = %message.event_type, "no handler, ignoring");
                return Ok(ConsumeOutcome::Ignored);
            }
        };

        let key = message.content_key();
        if message.dedup_key != key {
            warn!(
                consumer = %self.name,
                event_id = %message.event_id,
                "broker dedup key disagrees with message content, using content key"
            );
        }
        if self.store.is_applied(&self.name, &key)? {
            debug!(
                consumer = %self.name,
                event_id = %message.event_id,
                dedup_key = %key,
                "duplicate delivery skipped"
            );
            return Ok(ConsumeOutcome::Duplicate);
        }

        let mut txn = ConsumerTxn::new(&self.store);
        for index in handlers {
            self.handlers[*index]
                .apply(message, &mut txn)
                .map_err(|source| ConsumerError::Apply {
                    event_type: message.event_type.clone(),
                    source,
                })?;
        }

        let record = DedupRecord {
            consumer: self.name.clone(),
            key,
            event_type: message.event_type.clone(),
            aggregate_id: message.aggregate_id,
            applied_at: self.clock.now(),
        };

        match self.store.commit(record, txn.into_writes())? {
            CommitOutcome::Committed => {
                debug!(consumer = %self.name, event_id = %message.event_id, "event applied");
                Ok(ConsumeOutcome::Applied)
            }
            CommitOutcome::AlreadyApplied => {
                debug!(
                    consumer = %self.name,
                    event_id = %message.event_id,
                    "concurrent duplicate lost the dedup race"
                );
                Ok(ConsumeOutcome::Duplicate)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use chrono::Utc;
    use uuid::Uuid;

    use folio_core::{AggregateId, EventId, ManualClock};
    use folio_events::DedupKey;

    use crate::consumer::InMemoryConsumerStore;

    const COUNTERS: &str = "counters";

    /// Increments a per-aggregate counter, so double application is visible.
    struct Counter;

    impl EventHandler for Counter {
        fn event_types(&self) -> &[&'static str] {
            &["test.counted"]
        }

        fn apply(&self, message: &BrokerMessage, txn: &mut ConsumerTxn<'_>) -> Result<(), ApplyError> {
            let key = message.aggregate_id.to_string();
            let current = txn
                .get(COUNTERS, &key)
                .map_err(|e| ApplyError::transient(e.to_string()))?
                .and_then(|v| v.as_i64())
                .unwrap_or(0);
            txn.put(COUNTERS, key, serde_json::json!(current + 1));
            Ok(())
        }
    }

    struct Rejecting;

    impl EventHandler for Rejecting {
        fn event_types(&self) -> &[&'static str] {
            &["test.counted"]
        }

        fn apply(&self, _: &BrokerMessage, _: &mut ConsumerTxn<'_>) -> Result<(), ApplyError> {
            Err(ApplyError::permanent("malformed payload"))
        }
    }

    fn message(aggregate_id: AggregateId, event_type: &str, offset_ns: i64) -> BrokerMessage {
        let occurred_at = Utc::now() + chrono::Duration::nanoseconds(offset_ns);
        BrokerMessage {
            message_id: Uuid::new_v4(),
            event_id: EventId::new(),
            event_type: event_type.to_string(),
            aggregate_type: "test".into(),
            aggregate_id,
            occurred_at,
            payload: serde_json::json!({}),
            dedup_key: DedupKey::derive(aggregate_id, occurred_at, event_type),
        }
    }

    fn consumer() -> IdempotentConsumer<Arc<InMemoryConsumerStore>> {
        IdempotentConsumer::new(
            "counter",
            Arc::new(InMemoryConsumerStore::new()),
            Arc::new(ManualClock::default()),
        )
        .with_handler(Arc::new(Counter))
    }

    fn count(consumer: &IdempotentConsumer<Arc<InMemoryConsumerStore>>, id: AggregateId) -> Option<i64> {
        consumer
            .store()
            .row(COUNTERS, &id.to_string())
            .unwrap()
            .and_then(|v| v.as_i64())
    }

    #[test]
    fn redelivery_with_new_message_id_is_a_duplicate() {
        let consumer = consumer();
        let id = AggregateId::new();
        let first = message(id, "test.counted", 0);
        let mut redelivered = first.clone();
        redelivered.message_id = Uuid::new_v4();

        assert_eq!(consumer.consume(&first).unwrap(), ConsumeOutcome::Applied);
        assert_eq!(consumer.consume(&redelivered).unwrap(), ConsumeOutcome::Duplicate);
        assert_eq!(count(&consumer, id), Some(1));
        assert_eq!(consumer.store().dedup_records("counter").len(), 1);
    }

    #[test]
    fn distinct_events_of_one_aggregate_all_apply() {
        let consumer = consumer();
        let id = AggregateId::new();

        for offset in 0..3 {
            assert_eq!(
                consumer.consume(&message(id, "test.counted", offset)).unwrap(),
                ConsumeOutcome::Applied
            );
        }
        assert_eq!(count(&consumer, id), Some(3));
    }

    #[test]
    fn unhandled_types_are_ignored_without_a_dedup_record() {
        let consumer = consumer();
        let outcome = consumer.consume(&message(AggregateId::new(), "test.other", 0)).unwrap();

        assert_eq!(outcome, ConsumeOutcome::Ignored);
        assert!(consumer.store().dedup_records("counter").is_empty());
    }

    #[test]
    fn handler_failure_commits_nothing() {
        let consumer = consumer().with_handler(Arc::new(Rejecting));
        let id = AggregateId::new();
        let msg = message(id, "test.counted", 0);

        let err = consumer.consume(&msg).unwrap_err();

        assert!(!err.is_transient());
        assert_eq!(count(&consumer, id), None);
        assert!(!consumer.store().is_applied("counter", &msg.content_key()).unwrap());
    }
}
