use std::collections::HashSet;

use chrono::{DateTime, Utc};
use tracing::{debug, info};
use uuid::Uuid;

use folio_core::AggregateId;

use super::message::{OutboxMessage, OutboxStatus};
use super::store::{OutboxError, OutboxStats, OutboxStore};
use crate::storage::{InMemoryDatabase, StorageError};

impl From<StorageError> for OutboxError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Outbox(inner) => inner,
            other => OutboxError::Storage(other.to_string()),
        }
    }
}

impl InMemoryDatabase {
    fn with_outbox_row<T>(
        &self,
        id: Uuid,
        f: impl FnOnce(&mut OutboxMessage, DateTime<Utc>) -> Result<T, OutboxError>,
    ) -> Result<T, OutboxError> {
        let now = self.now();
        let mut tables = self.write()?;
        let sequence = *tables.outbox_index.get(&id).ok_or(OutboxError::NotFound(id))?;
        let row = tables.outbox.get_mut(&sequence).ok_or(OutboxError::NotFound(id))?;
        f(row, now)
    }

    /// Rows moved out of the live table by `archive_published`.
    pub fn archived_outbox(&self) -> Result<Vec<OutboxMessage>, OutboxError> {
        Ok(self.read()?.outbox_archive.clone())
    }
}

impl OutboxStore for InMemoryDatabase {
    fn claim_batch(&self, limit: usize, lease: chrono::Duration) -> Result<Vec<OutboxMessage>, OutboxError> {
        let now = self.now();
        let mut tables = self.write()?;
        let mut blocked: HashSet<AggregateId> = HashSet::new();
        let mut claimed = Vec::new();

        for row in tables.outbox.values_mut() {
            if claimed.len() >= limit {
                break;
            }
            if row.status != OutboxStatus::Pending || blocked.contains(&row.aggregate_id) {
                continue;
            }
            if !row.is_claimable(now) {
                // An earlier event of this aggregate is in flight or backing off.
                blocked.insert(row.aggregate_id);
                continue;
            }
            row.claimed_until = Some(now + lease);
            claimed.push(row.clone());
        }

        if !claimed.is_empty() {
            debug!(count = claimed.len(), "claimed outbox batch");
        }
        Ok(claimed)
    }

    fn release(&self, id: Uuid) -> Result<(), OutboxError> {
        self.with_outbox_row(id, |row, _| {
            row.claimed_until = None;
            Ok(())
        })
    }

    fn mark_published(&self, id: Uuid) -> Result<(), OutboxError> {
        self.with_outbox_row(id, |row, now| {
            if row.status == OutboxStatus::Failed {
                return Err(OutboxError::InvalidTransition {
                    id,
                    status: row.status,
                    operation: "mark published",
                });
            }
            row.status = OutboxStatus::Published;
            row.published_at = Some(now);
            row.claimed_until = None;
            row.next_attempt_at = None;
            Ok(())
        })
    }

    fn record_failure(
        &self,
        id: Uuid,
        error: &str,
        retry_after: Option<chrono::Duration>,
    ) -> Result<OutboxStatus, OutboxError> {
        self.with_outbox_row(id, |row, now| {
            if row.status != OutboxStatus::Pending {
                return Err(OutboxError::InvalidTransition {
                    id,
                    status: row.status,
                    operation: "record a failure",
                });
            }
            row.attempts += 1;
            row.last_error = Some(error.to_string());
            row.claimed_until = None;
            match retry_after {
                Some(delay) => row.next_attempt_at = Some(now + delay),
                None => {
                    row.status = OutboxStatus::Failed;
                    row.next_attempt_at = None;
                }
            }
            Ok(row.status)
        })
    }

    fn get(&self, id: Uuid) -> Result<Option<OutboxMessage>, OutboxError> {
        let tables = self.read()?;
        Ok(tables
            .outbox_index
            .get(&id)
            .and_then(|sequence| tables.outbox.get(sequence))
            .cloned())
    }

    fn list(&self, status: Option<OutboxStatus>, limit: usize) -> Result<Vec<OutboxMessage>, OutboxError> {
        let tables = self.read()?;
        Ok(tables
            .outbox
            .values()
            .filter(|row| status.is_none_or(|s| row.status == s))
            .take(limit)
            .cloned()
            .collect())
    }

    fn requeue(&self, id: Uuid) -> Result<(), OutboxError> {
        self.with_outbox_row(id, |row, _| {
            if row.status != OutboxStatus::Failed {
                return Err(OutboxError::InvalidTransition {
                    id,
                    status: row.status,
                    operation: "requeue",
                });
            }
            row.status = OutboxStatus::Pending;
            row.attempts = 0;
            row.next_attempt_at = None;
            row.claimed_until = None;
            info!(outbox_id = %id, event_type = %row.event_type, "outbox message requeued");
            Ok(())
        })
    }

    fn archive_published(&self, before: DateTime<Utc>) -> Result<usize, OutboxError> {
        let mut tables = self.write()?;
        let expired: Vec<u64> = tables
            .outbox
            .iter()
            .filter(|(_, row)| row.status == OutboxStatus::Published && row.published_at.is_some_and(|at| at < before))
            .map(|(sequence, _)| *sequence)
            .collect();

        for sequence in &expired {
            if let Some(row) = tables.outbox.remove(sequence) {
                tables.outbox_index.remove(&row.id);
                tables.outbox_archive.push(row);
            }
        }
        Ok(expired.len())
    }

    fn stats(&self) -> Result<OutboxStats, OutboxError> {
        let tables = self.read()?;
        let mut stats = OutboxStats {
            archived: tables.outbox_archive.len(),
            ..Default::default()
        };
        for row in tables.outbox.values() {
            match row.status {
                OutboxStatus::Pending => stats.pending += 1,
                OutboxStatus::Published => stats.published += 1,
                OutboxStatus::Failed => stats.failed += 1,
            }
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    use folio_core::{Clock, ExpectedVersion, ManualClock};
    use folio_events::EventRegistry;

    use crate::outbox::OutboxTransaction;

    fn setup() -> (Arc<ManualClock>, InMemoryDatabase) {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let db = InMemoryDatabase::new(Arc::new(EventRegistry::new()), clock.clone());
        (clock, db)
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

    fn commit_rows(db: &InMemoryDatabase, rows: Vec<OutboxMessage>) -> Vec<Uuid> {
        let mut uow = db.begin();
        for r in rows {
            uow.stage_outbox(r);
        }
        // touch an entity so the commit looks like a real write
        uow.put("test.aggregate", AggregateId::new(), ExpectedVersion::Any, &0).unwrap();
        uow.commit().unwrap().outbox_ids
    }

    fn lease() -> chrono::Duration {
        chrono::Duration::seconds(30)
    }

    #[test]
    fn claim_returns_rows_in_sequence_order_and_leases_them() {
        let (_, db) = setup();
        let a = AggregateId::new();
        let ids = commit_rows(&db, vec![row(a, "e1"), row(a, "e2"), row(a, "e3")]);

        let batch = db.claim_batch(10, lease()).unwrap();
        assert_eq!(batch.iter().map(|m| m.id).collect::<Vec<_>>(), ids);
        assert!(batch.windows(2).all(|w| w[0].sequence < w[1].sequence));

        // leased rows are invisible to a second relay
        assert!(db.claim_batch(10, lease()).unwrap().is_empty());
    }

    #[test]
    fn lease_expiry_makes_rows_claimable_again() {
        let (clock, db) = setup();
        commit_rows(&db, vec![row(AggregateId::new(), "e1")]);

        assert_eq!(db.claim_batch(10, lease()).unwrap().len(), 1);
        clock.advance(chrono::Duration::seconds(31));
        assert_eq!(db.claim_batch(10, lease()).unwrap().len(), 1);
    }

    #[test]
    fn backing_off_row_blocks_later_rows_of_same_aggregate_only() {
        let (clock, db) = setup();
        let a = AggregateId::new();
        let b = AggregateId::new();
        let ids = commit_rows(&db, vec![row(a, "a1"), row(a, "a2"), row(b, "b1")]);

        let batch = db.claim_batch(1, lease()).unwrap();
        assert_eq!(batch[0].id, ids[0]);
        db.record_failure(ids[0], "broker down", Some(chrono::Duration::seconds(5)))
            .unwrap();

        let batch = db.claim_batch(10, lease()).unwrap();
        assert_eq!(batch.iter().map(|m| m.id).collect::<Vec<_>>(), vec![ids[2]]);

        clock.advance(chrono::Duration::seconds(5));
        let batch = db.claim_batch(10, lease()).unwrap();
        assert_eq!(batch.iter().map(|m| m.id).collect::<Vec<_>>(), vec![ids[0], ids[1]]);
        assert_eq!(batch[0].attempts, 1);
        assert_eq!(batch[0].last_error.as_deref(), Some("broker down"));
    }

    #[test]
    fn parked_rows_need_requeue() {
        let (_, db) = setup();
        let a = AggregateId::new();
        let ids = commit_rows(&db, vec![row(a, "a1"), row(a, "a2")]);

        db.claim_batch(1, lease()).unwrap();
        let status = db.record_failure(ids[0], "poison message", None).unwrap();
        assert_eq!(status, OutboxStatus::Failed);

        // a parked row does not hold back the rest of its aggregate
        let batch = db.claim_batch(10, lease()).unwrap();
        assert_eq!(batch.iter().map(|m| m.id).collect::<Vec<_>>(), vec![ids[1]]);
        assert_eq!(db.list(Some(OutboxStatus::Failed), 10).unwrap().len(), 1);

        assert!(matches!(
            db.requeue(ids[1]),
            Err(OutboxError::InvalidTransition { operation: "requeue", .. })
        ));
        db.requeue(ids[0]).unwrap();
        let requeued = db.get(ids[0]).unwrap().unwrap();
        assert_eq!(requeued.status, OutboxStatus::Pending);
        assert_eq!(requeued.attempts, 0);
    }

    #[test]
    fn published_rows_are_archived_after_cutoff() {
        let (clock, db) = setup();
        let ids = commit_rows(&db, vec![row(AggregateId::new(), "e1"), row(AggregateId::new(), "e2")]);

        db.claim_batch(10, lease()).unwrap();
        db.mark_published(ids[0]).unwrap();
        clock.advance(chrono::Duration::hours(1));

        let archived = db.archive_published(clock.now()).unwrap();
        assert_eq!(archived, 1);
        assert!(db.get(ids[0]).unwrap().is_none());
        assert_eq!(db.archived_outbox().unwrap()[0].id, ids[0]);
        assert_eq!(
            db.stats().unwrap(),
            OutboxStats {
                pending: 1,
                published: 0,
                failed: 0,
                archived: 1
            }
        );
    }

    #[test]
    fn unknown_ids_are_not_found() {
        let (_, db) = setup();
        let id = Uuid::now_v7();
        assert!(matches!(db.mark_published(id), Err(OutboxError::NotFound(x)) if x == id));
        assert!(db.get(id).unwrap().is_none());
    }
}
