//! Transactional outbox and its relay.
//!
//! ```text
//! UnitOfWork ──commit──▶ outbox table ──claim/publish/mark──▶ EventBus
//! ```

mod append;
mod in_memory;
mod message;
pub mod postgres;
mod relay;
mod store;

pub use append::{OutboxTransaction, append_events, to_outbox_messages};
pub use message::{OutboxMessage, OutboxStatus};
pub use postgres::{PgOutboxBatch, PostgresOutboxStore, append_outbox};
pub use relay::{OutboxRelay, RelayConfig, RelayHandle, RelayReport, RelayStats};
pub use store::{OutboxError, OutboxStats, OutboxStore};
