//! Outbox relay daemon: drains the Postgres outbox onto an in-process bus
//! with the audit consumer attached. The consumer's dedup records and audit
//! rows live in the same database, so a restart never re-applies an event.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;

use folio_catalog::BookEvent;
use folio_core::SystemClock;
use folio_events::{BrokerMessage, EventRegistry, InMemoryEventBus};
use folio_infra::config::FolioConfig;
use folio_infra::consumer::{AuditTrailHandler, ConsumerWorker, IdempotentConsumer, PostgresConsumerStore};
use folio_infra::db;
use folio_infra::outbox::{OutboxRelay, PostgresOutboxStore};

fn main() -> anyhow::Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("FOLIO_CONFIG").ok())
        .map(PathBuf::from);
    let config = FolioConfig::load(config_path.as_deref()).context("failed to load configuration")?;
    folio_observability::init_with(&config.logging.level, config.logging.json);

    let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
    let runtime = tokio::runtime::Runtime::new().context("failed to start tokio runtime")?;
    let pool = runtime
        .block_on(db::connect(&database_url, 4))
        .context("failed to connect to Postgres")?;
    runtime
        .block_on(db::run_migrations(&pool))
        .context("failed to apply migrations")?;

    let registry = EventRegistry::new().with::<BookEvent>()?;
    let bus = Arc::new(InMemoryEventBus::<BrokerMessage>::new());

    let consumer_store = PostgresConsumerStore::new(pool.clone(), runtime.handle().clone());
    let consumer = IdempotentConsumer::new("audit", consumer_store, Arc::new(SystemClock))
        .with_handler(Arc::new(AuditTrailHandler::for_registry(&registry)));
    let worker = ConsumerWorker::spawn(consumer, &bus, config.consumer.retry_policy())?;

    let store = PostgresOutboxStore::new(pool, runtime.handle().clone());
    let relay = OutboxRelay::new(store, bus, config.relay.to_relay_config("folio-relayd")).spawn()?;

    tracing::info!(batch_size = config.relay.batch_size, "folio-relayd running");
    runtime
        .block_on(tokio::signal::ctrl_c())
        .context("failed to listen for shutdown signal")?;

    tracing::info!("shutting down");
    relay.shutdown();
    let stats = worker.stats();
    worker.shutdown();
    tracing::info!(applied = stats.applied, duplicates = stats.duplicates, "consumer stopped");
    Ok(())
}
