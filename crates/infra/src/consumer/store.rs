use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use folio_core::AggregateId;
use folio_events::DedupKey;

use super::error::ConsumerError;

/// Proof that a consumer applied an event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DedupRecord {
    pub consumer: String,
    pub key: DedupKey,
    pub event_type: String,
    pub aggregate_id: AggregateId,
    pub applied_at: DateTime<Utc>,
}

/// A staged read-model change.
#[derive(Debug, Clone, PartialEq)]
pub enum RowWrite {
    Put { table: String, key: String, value: JsonValue },
    Delete { table: String, key: String },
}

impl RowWrite {
    fn target(&self) -> (&str, &str) {
        match self {
            RowWrite::Put { table, key, .. } | RowWrite::Delete { table, key } => (table.as_str(), key.as_str()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed,
    /// The dedup record already existed; nothing was written.
    AlreadyApplied,
}

/// Storage behind an idempotent consumer: its read-model tables plus the
/// dedup table, committed together.
pub trait ConsumerStore: Send + Sync {
    fn is_applied(&self, consumer: &str, key: &DedupKey) -> Result<bool, ConsumerError>;

    /// Committed value of one read-model row.
    fn row(&self, table: &str, key: &str) -> Result<Option<JsonValue>, ConsumerError>;

    /// Insert `record` and apply `writes` atomically.
    ///
    /// The dedup insert is checked inside the commit, so two racing deliveries
    /// of the same event cannot both write.
    fn commit(&self, record: DedupRecord, writes: Vec<RowWrite>) -> Result<CommitOutcome, ConsumerError>;
}

impl<S> ConsumerStore for Arc<S>
where
    S: ConsumerStore + ?Sized,
{
    fn is_applied(&self, consumer: &str, key: &DedupKey) -> Result<bool, ConsumerError> {
        (**self).is_applied(consumer, key)
    }

    fn row(&self, table: &str, key: &str) -> Result<Option<JsonValue>, ConsumerError> {
        (**self).row(table, key)
    }

    fn commit(&self, record: DedupRecord, writes: Vec<RowWrite>) -> Result<CommitOutcome, ConsumerError> {
        (**self).commit(record, writes)
    }
}

/// Writes a handler makes while applying one event.
///
/// Reads see this transaction's own staged writes first, then committed state.
pub struct ConsumerTxn<'a> {
    store: &'a dyn ConsumerStore,
    writes: Vec<RowWrite>,
}

impl<'a> ConsumerTxn<'a> {
    pub fn new(store: &'a dyn ConsumerStore) -> Self {
        Self {
            store,
            writes: Vec::new(),
        }
    }

    pub fn get(&self, table: &str, key: &str) -> Result<Option<JsonValue>, ConsumerError> {
        let staged = self.writes.iter().rev().find(|w| w.target() == (table, key));
        match staged {
            Some(RowWrite::Put { value, .. }) => Ok(Some(value.clone())),
            Some(RowWrite::Delete { .. }) => Ok(None),
            None => self.store.row(table, key),
        }
    }

    pub fn put(&mut self, table: &str, key: impl Into<String>, value: JsonValue) {
        self.writes.push(RowWrite::Put {
            table: table.to_string(),
            key: key.into(),
            value,
        });
    }

    pub fn delete(&mut self, table: &str, key: impl Into<String>) {
        self.writes.push(RowWrite::Delete {
            table: table.to_string(),
            key: key.into(),
        });
    }

    pub fn into_writes(self) -> Vec<RowWrite> {
        self.writes
    }
}

#[derive(Debug, Default)]
struct ConsumerTables {
    rows: HashMap<String, BTreeMap<String, JsonValue>>,
    dedup: HashMap<(String, DedupKey), DedupRecord>,
}

/// In-memory consumer storage for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryConsumerStore {
    inner: RwLock<ConsumerTables>,
}

impl InMemoryConsumerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// All rows of `table`, in key order.
    pub fn rows(&self, table: &str) -> Vec<(String, JsonValue)> {
        let Ok(tables) = self.inner.read() else {
            return Vec::new();
        };
        tables
            .rows
            .get(table)
            .map(|rows| rows.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default()
    }

    pub fn dedup_records(&self, consumer: &str) -> Vec<DedupRecord> {
        let Ok(tables) = self.inner.read() else {
            return Vec::new();
        };
        let mut records: Vec<DedupRecord> = tables
            .dedup
            .values()
            .filter(|r| r.consumer == consumer)
            .cloned()
            .collect();
        records.sort_by_key(|r| r.applied_at);
        records
    }
}

impl ConsumerStore for InMemoryConsumerStore {
    fn is_applied(&self, consumer: &str, key: &DedupKey) -> Result<bool, ConsumerError> {
        let tables = self.inner.read().map_err(|_| poisoned())?;
        Ok(tables.dedup.contains_key(&(consumer.to_string(), key.clone())))
    }

    fn row(&self, table: &str, key: &str) -> Result<Option<JsonValue>, ConsumerError> {
        let tables = self.inner.read().map_err(|_| poisoned())?;
        Ok(tables.rows.get(table).and_then(|rows| rows.get(key)).cloned())
    }

    fn commit(&self, record: DedupRecord, writes: Vec<RowWrite>) -> Result<CommitOutcome, ConsumerError> {
        let mut tables = self.inner.write().map_err(|_| poisoned())?;
        let dedup_key = (record.consumer.clone(), record.key.clone());
        if tables.dedup.contains_key(&dedup_key) {
            return Ok(CommitOutcome::AlreadyApplied);
        }

        for write in writes {
            match write {
                RowWrite::Put { table, key, value } => {
                    tables.rows.entry(table).or_default().insert(key, value);
                }
                RowWrite::Delete { table, key } => {
                    if let Some(rows) = tables.rows.get_mut(&table) {
                        rows.remove(&key);
                    }
                }
            }
        }
        tables.dedup.insert(dedup_key, record);
        Ok(CommitOutcome::Committed)
    }
}

fn poisoned() -> ConsumerError {
    ConsumerError::Storage("consumer store lock poisoned".to_string())
}
