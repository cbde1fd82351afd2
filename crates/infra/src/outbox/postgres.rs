//! Postgres-backed outbox.
//!
//! Writers stage rows in a [`PgOutboxBatch`] (through
//! [`append_events`](super::append_events)) and write it with
//! [`PgOutboxBatch::write`] inside the transaction that carries their entity
//! changes. [`PostgresOutboxStore`] serves the relay.
//!
//! Only the earliest pending row of an aggregate is ever a claim candidate,
//! and candidates are locked with `FOR UPDATE SKIP LOCKED`. A relay that
//! skips a head row locked by another relay therefore skips the whole
//! aggregate for that pass; it can never reach past the head to a later row.
//! The price is one row per aggregate per pass.
//!
//! Schema: `migrations/0001_outbox.sql`.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::instrument;
use uuid::Uuid;

use folio_core::AggregateId;

use super::append::OutboxTransaction;
use super::message::{OutboxMessage, OutboxStatus};
use super::store::{OutboxError, OutboxStats, OutboxStore};

const COLUMNS: &str = "id, sequence, event_type, aggregate_type, aggregate_id, payload, occurred_at, \
     created_at, status, attempts, last_error, claimed_until, next_attempt_at, published_at";

/// Insert outbox rows as part of an open transaction.
///
/// Nothing becomes visible to the relay unless the caller commits `tx`.
pub async fn append_outbox(tx: &mut Transaction<'_, Postgres>, messages: &[OutboxMessage]) -> Result<(), OutboxError> {
    for message in messages {
        sqlx::query(
            r#"
            INSERT INTO outbox_messages
                (id, event_type, aggregate_type, aggregate_id, payload, occurred_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(message.id)
        .bind(&message.event_type)
        .bind(&message.aggregate_type)
        .bind(message.aggregate_id.as_uuid())
        .bind(&message.payload)
        .bind(message.occurred_at)
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("append_outbox", e))?;
    }
    Ok(())
}

/// Outbox rows collected for one Postgres transaction.
#[derive(Debug, Clone, Default)]
pub struct PgOutboxBatch {
    messages: Vec<OutboxMessage>,
}

impl PgOutboxBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> &[OutboxMessage] {
        &self.messages
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Insert every staged row into `tx`. Returns how many were written.
    pub async fn write(self, tx: &mut Transaction<'_, Postgres>) -> Result<usize, OutboxError> {
        append_outbox(tx, &self.messages).await?;
        Ok(self.messages.len())
    }
}

impl OutboxTransaction for PgOutboxBatch {
    fn stage_outbox(&mut self, message: OutboxMessage) {
        self.messages.push(message);
    }
}

/// Relay-side access to the `outbox_messages` table.
///
/// The synchronous [`OutboxStore`] methods block on `runtime`, so they must be
/// called from a plain thread (such as the relay's), not from inside an async task.
#[derive(Debug, Clone)]
pub struct PostgresOutboxStore {
    pool: Arc<PgPool>,
    runtime: tokio::runtime::Handle,
}

impl PostgresOutboxStore {
    pub fn new(pool: PgPool, runtime: tokio::runtime::Handle) -> Self {
        Self {
            pool: Arc::new(pool),
            runtime,
        }
    }

    #[instrument(skip(self))]
    pub async fn claim_batch_async(&self, limit: usize, lease: chrono::Duration) -> Result<Vec<OutboxMessage>, OutboxError> {
        let query = format!(
            r#"
            WITH candidates AS (
                SELECT o.id
                FROM outbox_messages o
                WHERE o.status = 'pending'
                  AND o.sequence = (
                      SELECT min(head.sequence) FROM outbox_messages head
                      WHERE head.aggregate_id = o.aggregate_id
                        AND head.status = 'pending'
                  )
                  AND (o.claimed_until IS NULL OR o.claimed_until <= now())
                  AND (o.next_attempt_at IS NULL OR o.next_attempt_at <= now())
                ORDER BY o.created_at, o.sequence
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE outbox_messages m
            SET claimed_until = now() + make_interval(secs => $2)
            FROM candidates c
            WHERE m.id = c.id
            RETURNING {COLUMNS}
            "#,
            COLUMNS = prefixed_columns("m"),
        );

        let rows = sqlx::query(&query)
            .bind(limit as i64)
            .bind(lease.num_milliseconds() as f64 / 1000.0)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("claim_batch", e))?;

        let mut messages = rows.iter().map(decode_row).collect::<Result<Vec<_>, _>>()?;
        // RETURNING order is unspecified.
        messages.sort_by_key(|m| (m.created_at, m.sequence));
        Ok(messages)
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn release_async(&self, id: Uuid) -> Result<(), OutboxError> {
        self.execute_for(id, "release", "UPDATE outbox_messages SET claimed_until = NULL WHERE id = $1")
            .await
    }

    pub async fn mark_published_async(&self, id: Uuid) -> Result<(), OutboxError> {
        self.execute_for(
            id,
            "mark_published",
            r#"
            UPDATE outbox_messages
            SET status = 'published', published_at = now(), claimed_until = NULL, next_attempt_at = NULL
            WHERE id = $1 AND status <> 'failed'
            "#,
        )
        .await
    }

    pub async fn record_failure_async(
        &self,
        id: Uuid,
        error: &str,
        retry_after: Option<chrono::Duration>,
    ) -> Result<OutboxStatus, OutboxError> {
        let row = sqlx::query(
            r#"
            UPDATE outbox_messages
            SET attempts = attempts + 1,
                last_error = $2,
                claimed_until = NULL,
                status = CASE WHEN $3::double precision IS NULL THEN 'failed' ELSE 'pending' END,
                next_attempt_at = CASE
                    WHEN $3::double precision IS NULL THEN NULL
                    ELSE now() + make_interval(secs => $3)
                END
            WHERE id = $1 AND status = 'pending'
            RETURNING status
            "#,
        )
        .bind(id)
        .bind(error)
        .bind(retry_after.map(|d| d.num_milliseconds() as f64 / 1000.0))
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("record_failure", e))?
        .ok_or(OutboxError::NotFound(id))?;

        parse_status(row.try_get("status").map_err(|e| map_sqlx_error("record_failure", e))?)
    }

    pub async fn get_async(&self, id: Uuid) -> Result<Option<OutboxMessage>, OutboxError> {
        let query = format!("SELECT {COLUMNS} FROM outbox_messages WHERE id = $1");
        let row = sqlx::query(&query)
            .bind(id)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;
        row.as_ref().map(decode_row).transpose()
    }

    pub async fn list_async(&self, status: Option<OutboxStatus>, limit: usize) -> Result<Vec<OutboxMessage>, OutboxError> {
        let query = format!(
            "SELECT {COLUMNS} FROM outbox_messages \
             WHERE ($1::text IS NULL OR status = $1) \
             ORDER BY created_at, sequence LIMIT $2"
        );
        let rows = sqlx::query(&query)
            .bind(status.map(|s| s.as_str()))
            .bind(limit as i64)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("list", e))?;
        rows.iter().map(decode_row).collect()
    }

    pub async fn requeue_async(&self, id: Uuid) -> Result<(), OutboxError> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_messages
            SET status = 'pending', attempts = 0, next_attempt_at = NULL, claimed_until = NULL
            WHERE id = $1 AND status = 'failed'
            "#,
        )
        .bind(id)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("requeue", e))?;

        if result.rows_affected() == 1 {
            return Ok(());
        }
        match self.get_async(id).await? {
            Some(row) => Err(OutboxError::InvalidTransition {
                id,
                status: row.status,
                operation: "requeue",
            }),
            None => Err(OutboxError::NotFound(id)),
        }
    }

    pub async fn archive_published_async(&self, before: DateTime<Utc>) -> Result<usize, OutboxError> {
        let result = sqlx::query(
            r#"
            WITH moved AS (
                DELETE FROM outbox_messages
                WHERE status = 'published' AND published_at < $1
                RETURNING *
            )
            INSERT INTO outbox_messages_archive SELECT * FROM moved
            "#,
        )
        .bind(before)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("archive_published", e))?;
        Ok(result.rows_affected() as usize)
    }

    pub async fn stats_async(&self) -> Result<OutboxStats, OutboxError> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status = 'pending')   AS pending,
                COUNT(*) FILTER (WHERE status = 'published') AS published,
                COUNT(*) FILTER (WHERE status = 'failed')    AS failed,
                (SELECT COUNT(*) FROM outbox_messages_archive) AS archived
            FROM outbox_messages
            "#,
        )
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("stats", e))?;

        let count = |column: &str| -> Result<usize, OutboxError> {
            row.try_get::<i64, _>(column)
                .map(|n| n as usize)
                .map_err(|e| map_sqlx_error("stats", e))
        };
        Ok(OutboxStats {
            pending: count("pending")?,
            published: count("published")?,
            failed: count("failed")?,
            archived: count("archived")?,
        })
    }

    async fn execute_for(&self, id: Uuid, operation: &str, sql: &str) -> Result<(), OutboxError> {
        let result = sqlx::query(sql)
            .bind(id)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error(operation, e))?;
        if result.rows_affected() == 0 {
            return Err(OutboxError::NotFound(id));
        }
        Ok(())
    }
}

fn prefixed_columns(alias: &str) -> String {
    COLUMNS
        .split(", ")
        .map(|column| format!("{alias}.{}", column.trim()))
        .collect::<Vec<_>>()
        .join(", ")
}

fn parse_status(raw: String) -> Result<OutboxStatus, OutboxError> {
    OutboxStatus::parse(&raw).ok_or_else(|| OutboxError::Storage(format!("unknown outbox status: {raw}")))
}

fn decode_row(row: &sqlx::postgres::PgRow) -> Result<OutboxMessage, OutboxError> {
    let get_err = |e| map_sqlx_error("decode_row", e);
    let aggregate_id: Uuid = row.try_get("aggregate_id").map_err(get_err)?;
    let sequence: i64 = row.try_get("sequence").map_err(get_err)?;
    let attempts: i32 = row.try_get("attempts").map_err(get_err)?;

    Ok(OutboxMessage {
        id: row.try_get("id").map_err(get_err)?,
        event_type: row.try_get("event_type").map_err(get_err)?,
        aggregate_type: row.try_get("aggregate_type").map_err(get_err)?,
        aggregate_id: AggregateId::from_uuid(aggregate_id),
        payload: row.try_get("payload").map_err(get_err)?,
        occurred_at: row.try_get("occurred_at").map_err(get_err)?,
        created_at: row.try_get("created_at").map_err(get_err)?,
        sequence: sequence as u64,
        status: parse_status(row.try_get("status").map_err(get_err)?)?,
        attempts: attempts.max(0) as u32,
        last_error: row.try_get("last_error").map_err(get_err)?,
        claimed_until: row.try_get("claimed_until").map_err(get_err)?,
        next_attempt_at: row.try_get("next_attempt_at").map_err(get_err)?,
        published_at: row.try_get("published_at").map_err(get_err)?,
    })
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> OutboxError {
    match err {
        sqlx::Error::Database(db_err) => {
            OutboxError::Storage(format!("database error in {operation}: {}", db_err.message()))
        }
        sqlx::Error::PoolClosed => OutboxError::Storage(format!("connection pool closed in {operation}")),
        other => OutboxError::Storage(format!("sqlx error in {operation}: {other}")),
    }
}

impl OutboxStore for PostgresOutboxStore {
    fn claim_batch(&self, limit: usize, lease: chrono::Duration) -> Result<Vec<OutboxMessage>, OutboxError> {
        self.runtime.block_on(self.claim_batch_async(limit, lease))
    }

    fn release(&self, id: Uuid) -> Result<(), OutboxError> {
        self.runtime.block_on(self.release_async(id))
    }

    fn mark_published(&self, id: Uuid) -> Result<(), OutboxError> {
        self.runtime.block_on(self.mark_published_async(id))
    }

    fn record_failure(
        &self,
        id: Uuid,
        error: &str,
        retry_after: Option<chrono::Duration>,
    ) -> Result<OutboxStatus, OutboxError> {
        self.runtime.block_on(self.record_failure_async(id, error, retry_after))
    }

    fn get(&self, id: Uuid) -> Result<Option<OutboxMessage>, OutboxError> {
        self.runtime.block_on(self.get_async(id))
    }

    fn list(&self, status: Option<OutboxStatus>, limit: usize) -> Result<Vec<OutboxMessage>, OutboxError> {
        self.runtime.block_on(self.list_async(status, limit))
    }

    fn requeue(&self, id: Uuid) -> Result<(), OutboxError> {
        self.runtime.block_on(self.requeue_async(id))
    }

    fn archive_published(&self, before: DateTime<Utc>) -> Result<usize, OutboxError> {
        self.runtime.block_on(self.archive_published_async(before))
    }

    fn stats(&self) -> Result<OutboxStats, OutboxError> {
        self.runtime.block_on(self.stats_async())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use folio_catalog::{Book, BookEvent, BookId};
    use folio_events::{EventRegistry, RecordsEvents};

    use crate::outbox::append_events;

    fn dune_batch() -> (PgOutboxBatch, Vec<DateTime<Utc>>) {
        let registry = EventRegistry::new().with::<BookEvent>().unwrap();
        let now = Utc::now();
        let mut book = Book::create(BookId::generate(), "Dune", None, now).unwrap();
        book.update("Dune Messiah", None, now).unwrap();
        let events = book.pending_events_mut().drain();

        let mut batch = PgOutboxBatch::new();
        append_events(&mut batch, &registry, &events, now).unwrap();
        (batch, events.iter().map(|e| e.occurred_at()).collect())
    }

    fn row(aggregate_id: AggregateId, event_type: &str) -> OutboxMessage {
        let now = Utc::now();
        OutboxMessage {
            id: Uuid::now_v7(),
            event_type: event_type.to_string(),
            aggregate_type: "test.aggregate".into(),
            aggregate_id,
            payload: serde_json::json!({}),
            occurred_at: now,
            created_at: now,
            sequence: 0,
            status: OutboxStatus::Pending,
            attempts: 0,
            last_error: None,
            claimed_until: None,
            next_attempt_at: None,
            published_at: None,
        }
    }

    async fn insert(pool: &PgPool, rows: &[OutboxMessage]) {
        let mut tx = pool.begin().await.unwrap();
        append_outbox(&mut tx, rows).await.unwrap();
        tx.commit().await.unwrap();
    }

    async fn claim_types(store: &PostgresOutboxStore) -> Vec<String> {
        store
            .claim_batch_async(10, chrono::Duration::seconds(30))
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.event_type)
            .collect()
    }

    #[test]
    fn batch_collects_relayed_rows_in_order() {
        let (batch, _) = dune_batch();
        let types: Vec<_> = batch.messages().iter().map(|m| m.event_type.as_str()).collect();
        assert_eq!(types, vec!["catalog.book.created", "catalog.book.updated"]);
    }

    #[sqlx::test(migrations = "./migrations")]
    #[ignore = "needs a Postgres DATABASE_URL"]
    async fn batch_rows_exist_only_once_the_transaction_commits(pool: PgPool) {
        let store = PostgresOutboxStore::new(pool.clone(), tokio::runtime::Handle::current());
        let (batch, occurred) = dune_batch();

        let mut tx = pool.begin().await.unwrap();
        assert_eq!(batch.clone().write(&mut tx).await.unwrap(), 2);
        tx.rollback().await.unwrap();
        assert_eq!(store.stats_async().await.unwrap().pending, 0);

        let mut tx = pool.begin().await.unwrap();
        batch.write(&mut tx).await.unwrap();
        tx.commit().await.unwrap();
        assert_eq!(store.stats_async().await.unwrap().pending, 2);

        // Microsecond stamps survive TIMESTAMPTZ, so dedup keys are unchanged.
        let rows = store.list_async(Some(OutboxStatus::Pending), 10).await.unwrap();
        let stored: Vec<_> = rows.iter().map(|m| m.occurred_at).collect();
        assert_eq!(stored, occurred);
    }

    #[sqlx::test(migrations = "./migrations")]
    #[ignore = "needs a Postgres DATABASE_URL"]
    async fn only_the_head_row_of_an_aggregate_is_claimed(pool: PgPool) {
        let store = PostgresOutboxStore::new(pool.clone(), tokio::runtime::Handle::current());
        let a = AggregateId::new();
        let a_rows = vec![row(a, "a1"), row(a, "a2")];
        insert(&pool, &a_rows).await;

        assert_eq!(claim_types(&store).await, vec!["a1"]);
        // a1 is leased; a2 must not overtake it
        assert!(claim_types(&store).await.is_empty());

        store.mark_published_async(a_rows[0].id).await.unwrap();
        assert_eq!(claim_types(&store).await, vec!["a2"]);
    }

    #[sqlx::test(migrations = "./migrations")]
    #[ignore = "needs a Postgres DATABASE_URL"]
    async fn head_row_locked_by_another_relay_hides_the_aggregate(pool: PgPool) {
        let store = PostgresOutboxStore::new(pool.clone(), tokio::runtime::Handle::current());
        let a = AggregateId::new();
        let a_rows = vec![row(a, "a1"), row(a, "a2")];
        insert(&pool, &a_rows).await;
        insert(&pool, &[row(AggregateId::new(), "b1")]).await;

        // Another relay holds a1 mid-claim; its lease is not committed yet.
        let mut other = pool.begin().await.unwrap();
        sqlx::query("SELECT id FROM outbox_messages WHERE id = $1 FOR UPDATE")
            .bind(a_rows[0].id)
            .execute(&mut *other)
            .await
            .unwrap();

        assert_eq!(claim_types(&store).await, vec!["b1"]);

        other.rollback().await.unwrap();
        assert_eq!(claim_types(&store).await, vec!["a1"]);
    }

    #[test]
    fn prefixed_columns_qualify_every_column() {
        let columns = prefixed_columns("m");
        assert!(columns.starts_with("m.id, m.sequence"));
        assert_eq!(columns.matches("m.").count(), COLUMNS.split(", ").count());
    }

    #[test]
    fn unknown_status_is_a_storage_error() {
        assert!(matches!(parse_status("archived".into()), Err(OutboxError::Storage(_))));
        assert_eq!(parse_status("failed".into()).unwrap(), OutboxStatus::Failed);
    }
}
