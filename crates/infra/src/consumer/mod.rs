//! Idempotent event consumption.

mod audit;
mod error;
mod idempotent;
pub mod postgres;
mod store;
mod worker;

pub use audit::{AUDIT_COUNTS_TABLE, AUDIT_ENTRIES_TABLE, AuditEntry, AuditTrailHandler};
pub use error::{ApplyError, ConsumerError};
pub use idempotent::{ConsumeOutcome, EventHandler, IdempotentConsumer};
pub use postgres::PostgresConsumerStore;
pub use store::{CommitOutcome, ConsumerStore, ConsumerTxn, DedupRecord, InMemoryConsumerStore, RowWrite};
pub use worker::{ConsumerStats, ConsumerWorker, ConsumerWorkerHandle, DeadLetter, DeadLetters, Delivery, deliver};
