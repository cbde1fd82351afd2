//! Transactional entity storage shared with the outbox table.

mod database;
mod error;

pub use database::{CommitReceipt, EntityRecord, InMemoryDatabase, UnitOfWork};
pub use error::StorageError;
