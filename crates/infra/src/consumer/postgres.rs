//! Postgres storage for idempotent consumers.
//!
//! [`PostgresConsumerStore`] commits a consumer's read-model rows and its
//! dedup record in one transaction. The dedup insert goes first: a second
//! delivery of the same event blocks on the primary key until the first
//! commits, then finds the record and rolls back without writing.
//!
//! Schema: `migrations/0002_consumer_dedup.sql`, `migrations/0003_consumer_rows.sql`.

use std::sync::Arc;

use serde_json::Value as JsonValue;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{debug, instrument};

use folio_events::DedupKey;

use super::error::ConsumerError;
use super::store::{CommitOutcome, ConsumerStore, DedupRecord, RowWrite};

/// Insert the dedup record inside `tx`.
///
/// Returns `false` when the record already exists; the caller must then roll
/// back instead of committing its read-model writes.
pub async fn record_dedup(tx: &mut Transaction<'_, Postgres>, record: &DedupRecord) -> Result<bool, ConsumerError> {
    let result = sqlx::query(
        r#"
        INSERT INTO consumer_dedup (consumer, dedup_key, event_type, aggregate_id, applied_at)
        VALUES ($1, $2, $3, $4, $5)
        ON CONFLICT (consumer, dedup_key) DO NOTHING
        "#,
    )
    .bind(&record.consumer)
    .bind(record.key.as_str())
    .bind(&record.event_type)
    .bind(record.aggregate_id.as_uuid())
    .bind(record.applied_at)
    .execute(&mut **tx)
    .await
    .map_err(|e| storage_error("record_dedup", e))?;

    Ok(result.rows_affected() == 1)
}

/// Cheap pre-check before opening a transaction.
pub async fn is_applied(pool: &PgPool, consumer: &str, key: &DedupKey) -> Result<bool, ConsumerError> {
    let row = sqlx::query(
        "SELECT EXISTS (SELECT 1 FROM consumer_dedup WHERE consumer = $1 AND dedup_key = $2) AS applied",
    )
    .bind(consumer)
    .bind(key.as_str())
    .fetch_one(pool)
    .await
    .map_err(|e| storage_error("is_applied", e))?;

    row.try_get("applied").map_err(|e| storage_error("is_applied", e))
}

async fn apply_write(tx: &mut Transaction<'_, Postgres>, write: &RowWrite) -> Result<(), ConsumerError> {
    let result = match write {
        RowWrite::Put { table, key, value } => {
            sqlx::query(
                r#"
                INSERT INTO consumer_rows (table_name, row_key, value)
                VALUES ($1, $2, $3)
                ON CONFLICT (table_name, row_key)
                DO UPDATE SET value = EXCLUDED.value, updated_at = now()
                "#,
            )
            .bind(table)
            .bind(key)
            .bind(value)
            .execute(&mut **tx)
            .await
        }
        RowWrite::Delete { table, key } => {
            sqlx::query("DELETE FROM consumer_rows WHERE table_name = $1 AND row_key = $2")
                .bind(table)
                .bind(key)
                .execute(&mut **tx)
                .await
        }
    };
    result.map(|_| ()).map_err(|e| storage_error("apply_write", e))
}

/// Durable [`ConsumerStore`].
///
/// Like [`PostgresOutboxStore`](crate::outbox::PostgresOutboxStore), the
/// synchronous trait methods block on `runtime` and belong on a plain thread
/// such as the consumer worker's.
#[derive(Debug, Clone)]
pub struct PostgresConsumerStore {
    pool: Arc<PgPool>,
    runtime: tokio::runtime::Handle,
}

impl PostgresConsumerStore {
    pub fn new(pool: PgPool, runtime: tokio::runtime::Handle) -> Self {
        Self {
            pool: Arc::new(pool),
            runtime,
        }
    }

    pub async fn is_applied_async(&self, consumer: &str, key: &DedupKey) -> Result<bool, ConsumerError> {
        is_applied(&self.pool, consumer, key).await
    }

    pub async fn row_async(&self, table: &str, key: &str) -> Result<Option<JsonValue>, ConsumerError> {
        let row = sqlx::query("SELECT value FROM consumer_rows WHERE table_name = $1 AND row_key = $2")
            .bind(table)
            .bind(key)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| storage_error("row", e))?;

        row.map(|row| row.try_get::<JsonValue, _>("value"))
            .transpose()
            .map_err(|e| storage_error("row", e))
    }

    #[instrument(skip_all, fields(consumer = %record.consumer, dedup_key = %record.key))]
    pub async fn commit_async(&self, record: DedupRecord, writes: Vec<RowWrite>) -> Result<CommitOutcome, ConsumerError> {
        let mut tx = self.pool.begin().await.map_err(|e| storage_error("begin", e))?;

        if !record_dedup(&mut tx, &record).await? {
            tx.rollback().await.map_err(|e| storage_error("rollback", e))?;
            debug!("dedup record already present, writes discarded");
            return Ok(CommitOutcome::AlreadyApplied);
        }

        for write in &writes {
            apply_write(&mut tx, write).await?;
        }
        tx.commit().await.map_err(|e| storage_error("commit", e))?;
        Ok(CommitOutcome::Committed)
    }
}

impl ConsumerStore for PostgresConsumerStore {
    fn is_applied(&self, consumer: &str, key: &DedupKey) -> Result<bool, ConsumerError> {
        self.runtime.block_on(self.is_applied_async(consumer, key))
    }

    fn row(&self, table: &str, key: &str) -> Result<Option<JsonValue>, ConsumerError> {
        self.runtime.block_on(self.row_async(table, key))
    }

    fn commit(&self, record: DedupRecord, writes: Vec<RowWrite>) -> Result<CommitOutcome, ConsumerError> {
        self.runtime.block_on(self.commit_async(record, writes))
    }
}

fn storage_error(operation: &str, err: sqlx::Error) -> ConsumerError {
    ConsumerError::Storage(format!("sqlx error in {operation}: {err}"))
}
