use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use tracing::debug;
use uuid::Uuid;

use folio_core::{AggregateId, Clock, ExpectedVersion};
use folio_events::{EventRegistry, RecordsEvents};

use super::error::StorageError;
use crate::outbox::{OutboxMessage, OutboxTransaction, to_outbox_messages};

/// One stored entity row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntityRecord {
    pub kind: String,
    pub id: AggregateId,
    /// Incremented on every committed write; starts at 1.
    pub version: u64,
    pub state: JsonValue,
    pub updated_at: DateTime<Utc>,
}

impl EntityRecord {
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, StorageError> {
        serde_json::from_value(self.state.clone()).map_err(|e| StorageError::Serialization(e.to_string()))
    }
}

#[derive(Debug, Default)]
pub(crate) struct Tables {
    pub(crate) entities: HashMap<(String, AggregateId), EntityRecord>,
    /// Live outbox rows keyed by insertion sequence.
    pub(crate) outbox: BTreeMap<u64, OutboxMessage>,
    pub(crate) outbox_index: HashMap<Uuid, u64>,
    pub(crate) outbox_archive: Vec<OutboxMessage>,
    pub(crate) next_sequence: u64,
}

/// In-process relational store: entity rows plus the outbox table.
///
/// A [`UnitOfWork`] stages writes and outbox rows and applies them together
/// under one write lock, so either the entity changes and their events are
/// both visible or neither is.
pub struct InMemoryDatabase {
    tables: RwLock<Tables>,
    registry: Arc<EventRegistry>,
    clock: Arc<dyn Clock>,
}

impl core::fmt::Debug for InMemoryDatabase {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("InMemoryDatabase")
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

impl InMemoryDatabase {
    pub fn new(registry: Arc<EventRegistry>, clock: Arc<dyn Clock>) -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            registry,
            clock,
        }
    }

    pub fn begin(&self) -> UnitOfWork<'_> {
        UnitOfWork {
            db: self,
            writes: Vec::new(),
            outbox: Vec::new(),
        }
    }

    pub fn registry(&self) -> &EventRegistry {
        &self.registry
    }

    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    pub fn entity(&self, kind: &str, id: AggregateId) -> Result<Option<EntityRecord>, StorageError> {
        let tables = self.read()?;
        Ok(tables.entities.get(&(kind.to_string(), id)).cloned())
    }

    /// All rows of one kind, in id order.
    pub fn entities(&self, kind: &str) -> Result<Vec<EntityRecord>, StorageError> {
        let tables = self.read()?;
        let mut rows: Vec<EntityRecord> = tables
            .entities
            .values()
            .filter(|record| record.kind == kind)
            .cloned()
            .collect();
        rows.sort_by_key(|record| record.id);
        Ok(rows)
    }

    pub(crate) fn read(&self) -> Result<RwLockReadGuard<'_, Tables>, StorageError> {
        self.tables.read().map_err(|_| StorageError::Poisoned)
    }

    pub(crate) fn write(&self) -> Result<RwLockWriteGuard<'_, Tables>, StorageError> {
        self.tables.write().map_err(|_| StorageError::Poisoned)
    }

    pub(crate) fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }
}

#[derive(Debug, Clone)]
enum WriteOp {
    Put(JsonValue),
    Delete,
}

#[derive(Debug, Clone)]
struct StagedWrite {
    kind: String,
    id: AggregateId,
    expected: ExpectedVersion,
    op: WriteOp,
}

/// What a successful commit changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitReceipt {
    /// New version per written row; `None` for deleted rows.
    pub versions: Vec<(String, AggregateId, Option<u64>)>,
    pub outbox_ids: Vec<Uuid>,
}

impl CommitReceipt {
    pub fn version_of(&self, kind: &str, id: AggregateId) -> Option<u64> {
        self.versions
            .iter()
            .rev()
            .find(|(k, i, _)| k == kind && *i == id)
            .and_then(|(_, _, version)| *version)
    }
}

/// A write transaction against [`InMemoryDatabase`].
///
/// Reads see committed state. Nothing is applied until [`commit`](Self::commit);
/// dropping the unit of work rolls it back.
#[derive(Debug)]
pub struct UnitOfWork<'a> {
    db: &'a InMemoryDatabase,
    writes: Vec<StagedWrite>,
    outbox: Vec<OutboxMessage>,
}

impl<'a> UnitOfWork<'a> {
    pub fn load(&self, kind: &str, id: AggregateId) -> Result<Option<EntityRecord>, StorageError> {
        self.db.entity(kind, id)
    }

    /// Load and decode a row, returning the state with its version stamp.
    pub fn load_as<T: DeserializeOwned>(&self, kind: &str, id: AggregateId) -> Result<Option<(T, u64)>, StorageError> {
        match self.load(kind, id)? {
            Some(record) => Ok(Some((record.decode()?, record.version))),
            None => Ok(None),
        }
    }

    pub fn put<T: Serialize>(
        &mut self,
        kind: &str,
        id: AggregateId,
        expected: ExpectedVersion,
        state: &T,
    ) -> Result<(), StorageError> {
        let state = serde_json::to_value(state).map_err(|e| StorageError::Serialization(e.to_string()))?;
        self.writes.push(StagedWrite {
            kind: kind.to_string(),
            id,
            expected,
            op: WriteOp::Put(state),
        });
        Ok(())
    }

    pub fn delete(&mut self, kind: &str, id: AggregateId, expected: ExpectedVersion) {
        self.writes.push(StagedWrite {
            kind: kind.to_string(),
            id,
            expected,
            op: WriteOp::Delete,
        });
    }

    /// Stage the aggregate's state and move its pending events into the outbox.
    ///
    /// Events are serialized before anything is staged: if one of them cannot
    /// be encoded, neither the state nor any row is added to this unit of
    /// work. The pending list is drained here; if the commit later fails the
    /// caller reloads the aggregate rather than reusing this instance.
    pub fn save_aggregate<A>(&mut self, kind: &str, aggregate: &mut A, expected: ExpectedVersion) -> Result<usize, StorageError>
    where
        A: RecordsEvents + Serialize,
        A::Event: Serialize,
    {
        let events = aggregate.pending_events_mut().drain();
        let messages = to_outbox_messages(&self.db.registry, &events, self.db.now())?;
        self.put(kind, aggregate.aggregate_id(), expected, &*aggregate)?;

        let count = messages.len();
        for message in messages {
            self.stage_outbox(message);
        }
        Ok(count)
    }

    pub fn staged_outbox(&self) -> &[OutboxMessage] {
        &self.outbox
    }

    /// Apply every staged write and outbox row, or none of them.
    pub fn commit(self) -> Result<CommitReceipt, StorageError> {
        let db = self.db;
        let now = db.now();
        let mut tables = db.write()?;

        // Validate all expectations first, tracking versions produced by
        // earlier writes in this same unit of work.
        let mut overlay: HashMap<(String, AggregateId), Option<u64>> = HashMap::new();
        for write in &self.writes {
            let key = (write.kind.clone(), write.id);
            let current = match overlay.get(&key) {
                Some(version) => *version,
                None => tables.entities.get(&key).map(|record| record.version),
            };
            if !write.expected.matches(current) {
                return Err(StorageError::Concurrency {
                    kind: write.kind.clone(),
                    id: write.id,
                    expected: write.expected,
                    actual: current,
                });
            }
            let next = match write.op {
                WriteOp::Put(_) => Some(current.unwrap_or(0) + 1),
                WriteOp::Delete => None,
            };
            overlay.insert(key, next);
        }

        let mut receipt = CommitReceipt::default();
        for write in self.writes {
            let key = (write.kind.clone(), write.id);
            match write.op {
                WriteOp::Put(state) => {
                    let version = tables.entities.get(&key).map_or(0, |record| record.version) + 1;
                    tables.entities.insert(
                        key,
                        EntityRecord {
                            kind: write.kind.clone(),
                            id: write.id,
                            version,
                            state,
                            updated_at: now,
                        },
                    );
                    receipt.versions.push((write.kind, write.id, Some(version)));
                }
                WriteOp::Delete => {
                    tables.entities.remove(&key);
                    receipt.versions.push((write.kind, write.id, None));
                }
            }
        }

        for mut message in self.outbox {
            tables.next_sequence += 1;
            let sequence = tables.next_sequence;
            message.sequence = sequence;
            message.created_at = now;
            receipt.outbox_ids.push(message.id);
            tables.outbox_index.insert(message.id, sequence);
            tables.outbox.insert(sequence, message);
        }

        debug!(
            writes = receipt.versions.len(),
            outbox_rows = receipt.outbox_ids.len(),
            "unit of work committed"
        );
        Ok(receipt)
    }
}

impl OutboxTransaction for UnitOfWork<'_> {
    fn stage_outbox(&mut self, message: OutboxMessage) {
        self.outbox.push(message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use folio_catalog::{BOOK_AGGREGATE_TYPE, Book, BookEvent, BookId};
    use folio_core::ManualClock;
    use folio_events::{Event, EventDescriptor, PendingEvents};

    use crate::outbox::{OutboxStats, OutboxStore};
    use crate::pipeline::CommandError;

    const LEDGER_POSTED: EventDescriptor = EventDescriptor::relayed("test.ledger.posted", "test.ledger");

    /// Event whose payload can never be encoded.
    #[derive(Debug, Clone)]
    struct Posted {
        ledger_id: AggregateId,
        occurred_at: DateTime<Utc>,
    }

    impl Serialize for Posted {
        fn serialize<S: serde::Serializer>(&self, _serializer: S) -> Result<S::Ok, S::Error> {
            Err(serde::ser::Error::custom("amount is not representable"))
        }
    }

    impl Event for Posted {
        fn descriptors() -> &'static [EventDescriptor] {
            &[LEDGER_POSTED]
        }

        fn descriptor(&self) -> &'static EventDescriptor {
            &LEDGER_POSTED
        }

        fn aggregate_id(&self) -> AggregateId {
            self.ledger_id
        }

        fn occurred_at(&self) -> DateTime<Utc> {
            self.occurred_at
        }
    }

    #[derive(Serialize)]
    struct Ledger {
        id: AggregateId,
        #[serde(skip)]
        pending: PendingEvents<Posted>,
    }

    impl RecordsEvents for Ledger {
        type Event = Posted;

        fn aggregate_id(&self) -> AggregateId {
            self.id
        }

        fn pending_events(&self) -> &PendingEvents<Posted> {
            &self.pending
        }

        fn pending_events_mut(&mut self) -> &mut PendingEvents<Posted> {
            &mut self.pending
        }
    }

    fn database() -> InMemoryDatabase {
        let registry = EventRegistry::new().with::<BookEvent>().unwrap();
        InMemoryDatabase::new(Arc::new(registry), Arc::new(ManualClock::default()))
    }

    fn dune() -> Book {
        Book::create(BookId::generate(), "Dune", Some("Frank Herbert".into()), Utc::now()).unwrap()
    }

    #[test]
    fn commit_writes_row_and_outbox_together() {
        let db = database();
        let mut book = dune();

        let mut uow = db.begin();
        let staged = uow.save_aggregate(BOOK_AGGREGATE_TYPE, &mut book, ExpectedVersion::Absent).unwrap();
        assert_eq!(staged, 1);
        assert!(book.pending_events().is_empty());

        let receipt = uow.commit().unwrap();
        assert_eq!(receipt.version_of(BOOK_AGGREGATE_TYPE, book.aggregate_id()), Some(1));
        assert_eq!(receipt.outbox_ids.len(), 1);
        assert_eq!(db.stats().unwrap().pending, 1);
    }

    #[test]
    fn dropped_unit_of_work_leaves_nothing_behind() {
        let db = database();
        let mut book = dune();

        {
            let mut uow = db.begin();
            uow.save_aggregate(BOOK_AGGREGATE_TYPE, &mut book, ExpectedVersion::Absent).unwrap();
        }

        assert!(db.entity(BOOK_AGGREGATE_TYPE, book.aggregate_id()).unwrap().is_none());
        assert_eq!(db.stats().unwrap().pending, 0);
    }

    #[test]
    fn unserializable_event_stages_and_persists_nothing() {
        let registry = EventRegistry::new().with::<BookEvent>().unwrap().with::<Posted>().unwrap();
        let db = InMemoryDatabase::new(Arc::new(registry), Arc::new(ManualClock::default()));
        let id = AggregateId::new();
        let mut ledger = Ledger {
            id,
            pending: PendingEvents::new(),
        };
        ledger
            .pending
            .record(id, Posted { ledger_id: id, occurred_at: Utc::now() })
            .unwrap();

        let mut uow = db.begin();
        let err = uow.save_aggregate("test.ledger", &mut ledger, ExpectedVersion::Absent).unwrap_err();
        assert!(uow.staged_outbox().is_empty());

        let err = CommandError::from(err);
        assert!(matches!(&err, CommandError::Serialization(msg) if msg.contains("test.ledger.posted")), "{err:?}");
        assert!(!err.is_concurrency());

        // Even a caller that commits anyway writes nothing.
        let receipt = uow.commit().unwrap();
        assert!(receipt.outbox_ids.is_empty());
        assert_eq!(receipt.version_of("test.ledger", id), None);
        assert_eq!(db.stats().unwrap(), OutboxStats::default());
        assert!(db.entities("test.ledger").unwrap().is_empty());
    }

    #[test]
    fn version_conflict_rejects_the_whole_commit() {
        let db = database();
        let mut book = dune();
        let id = book.aggregate_id();

        let mut uow = db.begin();
        uow.save_aggregate(BOOK_AGGREGATE_TYPE, &mut book, ExpectedVersion::Absent).unwrap();
        uow.commit().unwrap();

        let (loaded, version) = db.begin().load_as::<Book>(BOOK_AGGREGATE_TYPE, id).unwrap().unwrap();
        let mut first = loaded.clone().with_version(version);
        let mut second = loaded.with_version(version);
        first.update("Dune (1965)", None, Utc::now()).unwrap();
        second.update("Dune: Deluxe", None, Utc::now()).unwrap();

        let mut uow = db.begin();
        uow.save_aggregate(BOOK_AGGREGATE_TYPE, &mut first, ExpectedVersion::Exact(version)).unwrap();
        uow.commit().unwrap();

        let mut uow = db.begin();
        uow.save_aggregate(BOOK_AGGREGATE_TYPE, &mut second, ExpectedVersion::Exact(version)).unwrap();
        let err = uow.commit().unwrap_err();

        assert!(err.is_concurrency());
        let stored: Book = db.entity(BOOK_AGGREGATE_TYPE, id).unwrap().unwrap().decode().unwrap();
        assert_eq!(stored.title(), "Dune (1965)");
        // created + first update only
        assert_eq!(db.stats().unwrap().pending, 2);
    }

    #[test]
    fn writes_in_one_unit_of_work_chain_versions() {
        let db = database();
        let id = AggregateId::new();

        let mut uow = db.begin();
        uow.put("note", id, ExpectedVersion::Absent, &serde_json::json!({"n": 1})).unwrap();
        uow.put("note", id, ExpectedVersion::Exact(1), &serde_json::json!({"n": 2})).unwrap();
        let receipt = uow.commit().unwrap();

        assert_eq!(receipt.version_of("note", id), Some(2));
        assert_eq!(db.entity("note", id).unwrap().unwrap().state["n"], 2);

        let mut uow = db.begin();
        uow.delete("note", id, ExpectedVersion::Exact(2));
        uow.commit().unwrap();
        assert!(db.entity("note", id).unwrap().is_none());
    }

    #[test]
    fn list_filters_by_kind() {
        let db = database();
        let mut uow = db.begin();
        uow.put("a", AggregateId::new(), ExpectedVersion::Absent, &1).unwrap();
        uow.put("a", AggregateId::new(), ExpectedVersion::Absent, &2).unwrap();
        uow.put("b", AggregateId::new(), ExpectedVersion::Absent, &3).unwrap();
        uow.commit().unwrap();

        assert_eq!(db.entities("a").unwrap().len(), 2);
        assert_eq!(db.entities("b").unwrap().len(), 1);
    }
}
