//! Outbox relay: moves committed outbox rows onto the message broker.
//!
//! Each pass claims a batch, publishes it in order and marks every
//! acknowledged row as published. Delivery is at-least-once: a row whose
//! acknowledgement could not be recorded stays pending and is published again
//! after its lease runs out.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, error, info, warn};

use folio_core::AggregateId;
use folio_events::{BrokerMessage, EventBus};

use super::message::OutboxStatus;
use super::store::{OutboxError, OutboxStore};
use crate::retry::{RetryPolicy, to_chrono};

#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Sleep between passes that found less than a full batch.
    pub poll_interval: Duration,
    pub batch_size: usize,
    /// How long a claimed row stays invisible to other relays.
    pub lease: Duration,
    /// Backoff between publish attempts; `max_attempts` is the ceiling after
    /// which a row is parked as failed.
    pub retry: RetryPolicy,
    /// Name for logging
    pub name: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            batch_size: 100,
            lease: Duration::from_secs(30),
            retry: RetryPolicy::default(),
            name: "outbox-relay".to_string(),
        }
    }
}

impl RelayConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }
}

/// Outcome of one relay pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RelayReport {
    pub claimed: usize,
    pub published: usize,
    /// Publish failed; the row will be retried after backoff.
    pub failed: usize,
    /// Publish failed and the row hit the retry ceiling.
    pub parked: usize,
    /// Published but the acknowledgement could not be recorded.
    pub unconfirmed: usize,
    /// Released unpublished because an earlier row of the same aggregate failed.
    pub deferred: usize,
    /// Publish failed and the failure could not be recorded; the row stays
    /// leased and is retried once the lease runs out.
    pub unrecorded: usize,
}

/// Relay runtime statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RelayStats {
    pub passes: u64,
    pub published: u64,
    pub failed: u64,
    pub parked: u64,
    pub unrecorded: u64,
    pub pass_errors: u64,
    pub uptime_secs: u64,
}

/// Handle to control a running relay.
#[derive(Debug)]
pub struct RelayHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
    stats: Arc<Mutex<RelayStats>>,
}

impl RelayHandle {
    /// Request graceful shutdown and wait for the current pass to finish.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }

    pub fn stats(&self) -> RelayStats {
        self.stats.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

pub struct OutboxRelay<S, B> {
    store: S,
    bus: B,
    config: RelayConfig,
}

impl<S, B> OutboxRelay<S, B>
where
    S: OutboxStore,
    B: EventBus<BrokerMessage>,
{
    pub fn new(store: S, bus: B, config: RelayConfig) -> Self {
        Self { store, bus, config }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Run a single claim/publish/mark pass.
    pub fn run_once(&self) -> Result<RelayReport, OutboxError> {
        let batch = self.store.claim_batch(self.config.batch_size, to_chrono(self.config.lease))?;
        let mut report = RelayReport {
            claimed: batch.len(),
            ..Default::default()
        };
        // Aggregates whose ordering would break if later rows went out now.
        let mut held: HashSet<AggregateId> = HashSet::new();

        for message in batch {
            if held.contains(&message.aggregate_id) {
                report.deferred += 1;
                if let Err(err) = self.store.release(message.id) {
                    // Still leased; it comes back when the lease expires.
                    warn!(
                        relay = %self.config.name,
                        outbox_id = %message.id,
                        error = %err,
                        "failed to release deferred outbox message"
                    );
                }
                continue;
            }

            match self.bus.publish(message.to_broker_message()) {
                Ok(()) => match self.store.mark_published(message.id) {
                    Ok(()) => {
                        report.published += 1;
                        debug!(
                            relay = %self.config.name,
                            outbox_id = %message.id,
                            event_type = %message.event_type,
                            "outbox message published"
                        );
                    }
                    Err(err) => {
                        // Stays pending under lease; republished once the lease expires.
                        report.unconfirmed += 1;
                        held.insert(message.aggregate_id);
                        warn!(
                            relay = %self.config.name,
                            outbox_id = %message.id,
                            error = %err,
                            "published but failed to mark outbox message"
                        );
                    }
                },
                Err(err) => {
                    held.insert(message.aggregate_id);
                    let attempts = message.attempts + 1;
                    let reason = err.to_string();
                    let retry_after = self
                        .config
                        .retry
                        .should_retry(attempts)
                        .then(|| self.config.retry.chrono_delay_for_attempt(attempts));

                    match self.store.record_failure(message.id, &reason, retry_after) {
                        Err(store_err) => {
                            report.unrecorded += 1;
                            error!(
                                relay = %self.config.name,
                                outbox_id = %message.id,
                                event_type = %message.event_type,
                                attempts,
                                error = %reason,
                                store_error = %store_err,
                                "outbox publish failed and the failure could not be recorded"
                            );
                        }
                        Ok(OutboxStatus::Failed) => {
                            report.parked += 1;
                            error!(
                                relay = %self.config.name,
                                outbox_id = %message.id,
                                event_type = %message.event_type,
                                attempts,
                                error = %reason,
                                "outbox message parked after exhausting retries"
                            );
                        }
                        Ok(_) => {
                            report.failed += 1;
                            warn!(
                                relay = %self.config.name,
                                outbox_id = %message.id,
                                event_type = %message.event_type,
                                attempts,
                                error = %reason,
                                "outbox publish failed, will retry"
                            );
                        }
                    }
                }
            }
        }

        Ok(report)
    }
}

impl<S, B> OutboxRelay<S, B>
where
    S: OutboxStore + 'static,
    B: EventBus<BrokerMessage> + 'static,
{
    /// Spawn the relay loop on a background thread.
    pub fn spawn(self) -> std::io::Result<RelayHandle> {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let stats = Arc::new(Mutex::new(RelayStats::default()));
        let stats_clone = stats.clone();

        let join = thread::Builder::new()
            .name(self.config.name.clone())
            .spawn(move || relay_loop(self, shutdown_rx, stats_clone))?;

        Ok(RelayHandle {
            shutdown: shutdown_tx,
            join: Some(join),
            stats,
        })
    }
}

fn relay_loop<S, B>(relay: OutboxRelay<S, B>, shutdown_rx: mpsc::Receiver<()>, stats: Arc<Mutex<RelayStats>>)
where
    S: OutboxStore,
    B: EventBus<BrokerMessage>,
{
    info!(relay = %relay.config.name, "outbox relay started");
    let start_time = Instant::now();

    loop {
        let outcome = relay.run_once();
        let full_batch = matches!(&outcome, Ok(report) if report.claimed >= relay.config.batch_size);

        {
            let mut s = stats.lock().unwrap_or_else(|e| e.into_inner());
            s.passes += 1;
            s.uptime_secs = start_time.elapsed().as_secs();
            match &outcome {
                Ok(report) => {
                    s.published += report.published as u64;
                    s.failed += report.failed as u64;
                    s.parked += report.parked as u64;
                    s.unrecorded += report.unrecorded as u64;
                }
                Err(_) => s.pass_errors += 1,
            }
        }

        if let Err(err) = outcome {
            error!(relay = %relay.config.name, error = %err, "outbox relay pass failed");
        }

        // A full batch means more work is likely waiting.
        let wait = if full_batch { Duration::ZERO } else { relay.config.poll_interval };
        match shutdown_rx.recv_timeout(wait) {
            Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
            Err(mpsc::RecvTimeoutError::Timeout) => continue,
        }
    }

    info!(relay = %relay.config.name, "outbox relay stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};

    use chrono::Utc;
    use uuid::Uuid;

    use folio_core::{Clock, ExpectedVersion, ManualClock};
    use folio_events::{EventRegistry, InMemoryEventBus, Subscription};

    use crate::outbox::{OutboxMessage, OutboxTransaction};
    use crate::storage::InMemoryDatabase;

    /// Bus that fails the first `failures` publishes.
    struct FlakyBus {
        inner: InMemoryEventBus<BrokerMessage>,
        failures: AtomicUsize,
    }

    impl FlakyBus {
        fn failing(failures: usize) -> Self {
            Self {
                inner: InMemoryEventBus::new(),
                failures: AtomicUsize::new(failures),
            }
        }
    }

    impl EventBus<BrokerMessage> for FlakyBus {
        type Error = String;

        fn publish(&self, message: BrokerMessage) -> Result<(), String> {
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err("broker unavailable".to_string());
            }
            self.inner.publish(message).map_err(|e| e.to_string())
        }

        fn subscribe(&self) -> Subscription<BrokerMessage> {
            self.inner.subscribe()
        }
    }

    /// Store whose failure bookkeeping is unreachable; everything else works.
    struct NoFailureRecords {
        inner: Arc<InMemoryDatabase>,
    }

    impl OutboxStore for NoFailureRecords {
        fn claim_batch(&self, limit: usize, lease: chrono::Duration) -> Result<Vec<OutboxMessage>, OutboxError> {
            self.inner.claim_batch(limit, lease)
        }

        fn release(&self, id: Uuid) -> Result<(), OutboxError> {
            self.inner.release(id)
        }

        fn mark_published(&self, id: Uuid) -> Result<(), OutboxError> {
            self.inner.mark_published(id)
        }

        fn record_failure(
            &self,
            _id: Uuid,
            _error: &str,
            _retry_after: Option<chrono::Duration>,
        ) -> Result<OutboxStatus, OutboxError> {
            Err(OutboxError::Storage("connection reset".to_string()))
        }

        fn get(&self, id: Uuid) -> Result<Option<OutboxMessage>, OutboxError> {
            self.inner.get(id)
        }

        fn list(&self, status: Option<OutboxStatus>, limit: usize) -> Result<Vec<OutboxMessage>, OutboxError> {
            self.inner.list(status, limit)
        }

        fn requeue(&self, id: Uuid) -> Result<(), OutboxError> {
            self.inner.requeue(id)
        }

        fn archive_published(&self, before: chrono::DateTime<Utc>) -> Result<usize, OutboxError> {
            self.inner.archive_published(before)
        }

        fn stats(&self) -> Result<crate::outbox::OutboxStats, OutboxError> {
            self.inner.stats()
        }
    }

    fn setup() -> (Arc<ManualClock>, Arc<InMemoryDatabase>) {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let db = Arc::new(InMemoryDatabase::new(Arc::new(EventRegistry::new()), clock.clone()));
        (clock, db)
    }

    fn commit(db: &InMemoryDatabase, aggregate_id: AggregateId, event_types: &[&str]) -> Vec<Uuid> {
        let mut uow = db.begin();
        for (i, event_type) in event_types.iter().enumerate() {
            let occurred_at = db.clock().now() + chrono::Duration::nanoseconds(i as i64);
            uow.stage_outbox(OutboxMessage {
                id: Uuid::now_v7(),
                event_type: event_type.to_string(),
                aggregate_type: "test.aggregate".into(),
                aggregate_id,
                payload: serde_json::json!({ "seq": i }),
                occurred_at,
                created_at: occurred_at,
                sequence: 0,
                status: OutboxStatus::Pending,
                attempts: 0,
                last_error: None,
                claimed_until: None,
                next_attempt_at: None,
                published_at: None,
            });
        }
        uow.put("test.aggregate", aggregate_id, ExpectedVersion::Any, &event_types.len()).unwrap();
        uow.commit().unwrap().outbox_ids
    }

    fn config(max_attempts: u32) -> RelayConfig {
        RelayConfig::default().with_retry(RetryPolicy::fixed(max_attempts, Duration::from_secs(1)))
    }

    #[test]
    fn publishes_and_marks_in_order() {
        let (_, db) = setup();
        let bus = Arc::new(InMemoryEventBus::new());
        let sub = bus.subscribe();
        let aggregate = AggregateId::new();
        let ids = commit(&db, aggregate, &["e1", "e2", "e3"]);

        let relay = OutboxRelay::new(db.clone(), bus, config(5));
        let report = relay.run_once().unwrap();

        assert_eq!(report.published, 3);
        let received: Vec<Uuid> = (0..3).map(|_| *sub.try_recv().unwrap().event_id.as_uuid()).collect();
        assert_eq!(received, ids);
        assert!(ids.iter().all(|id| db.get(*id).unwrap().unwrap().status == OutboxStatus::Published));
    }

    #[test]
    fn failure_holds_back_the_rest_of_the_aggregate() {
        let (clock, db) = setup();
        let bus = Arc::new(FlakyBus::failing(1));
        let sub = bus.subscribe();
        let a = AggregateId::new();
        let b = AggregateId::new();
        let a_ids = commit(&db, a, &["a1", "a2"]);
        let b_ids = commit(&db, b, &["b1"]);

        let relay = OutboxRelay::new(db.clone(), bus, config(5));
        let report = relay.run_once().unwrap();

        assert_eq!(report.failed, 1);
        assert_eq!(report.deferred, 1);
        assert_eq!(report.published, 1);
        assert_eq!(*sub.try_recv().unwrap().event_id.as_uuid(), b_ids[0]);

        // a1 is backing off, so a2 cannot overtake it
        let report = relay.run_once().unwrap();
        assert_eq!(report.claimed, 0);

        clock.advance(chrono::Duration::seconds(1));
        let report = relay.run_once().unwrap();
        assert_eq!(report.published, 2);
        let order: Vec<Uuid> = (0..2).map(|_| *sub.try_recv().unwrap().event_id.as_uuid()).collect();
        assert_eq!(order, a_ids);
    }

    #[test]
    fn unrecorded_failure_does_not_abandon_the_batch() {
        let (clock, db) = setup();
        let bus = Arc::new(FlakyBus::failing(1));
        let sub = bus.subscribe();
        let a = AggregateId::new();
        let b = AggregateId::new();
        let a_ids = commit(&db, a, &["a1", "a2"]);
        let b_ids = commit(&db, b, &["b1"]);

        let store = NoFailureRecords { inner: db.clone() };
        let relay = OutboxRelay::new(store, bus, config(5));
        let report = relay.run_once().unwrap();

        assert_eq!(report.unrecorded, 1);
        assert_eq!(report.failed, 0);
        assert_eq!(report.deferred, 1);
        assert_eq!(report.published, 1);
        assert_eq!(*sub.try_recv().unwrap().event_id.as_uuid(), b_ids[0]);

        // a2 was released; a1 keeps its lease and still blocks it
        assert!(db.get(a_ids[1]).unwrap().unwrap().claimed_until.is_none());
        assert!(db.get(a_ids[0]).unwrap().unwrap().claimed_until.is_some());
        assert_eq!(relay.run_once().unwrap().claimed, 0);

        clock.advance(chrono::Duration::seconds(31));
        let report = relay.run_once().unwrap();
        assert_eq!(report.published, 2);
        let order: Vec<Uuid> = (0..2).map(|_| *sub.try_recv().unwrap().event_id.as_uuid()).collect();
        assert_eq!(order, a_ids);
    }

    #[test]
    fn rows_are_parked_at_the_retry_ceiling() {
        let (clock, db) = setup();
        let bus = Arc::new(FlakyBus::failing(usize::MAX));
        let ids = commit(&db, AggregateId::new(), &["e1"]);
        let relay = OutboxRelay::new(db.clone(), bus, config(3));

        for _ in 0..2 {
            assert_eq!(relay.run_once().unwrap().failed, 1);
            clock.advance(chrono::Duration::seconds(1));
        }
        let report = relay.run_once().unwrap();
        assert_eq!(report.parked, 1);

        let row = db.get(ids[0]).unwrap().unwrap();
        assert_eq!(row.status, OutboxStatus::Failed);
        assert_eq!(row.attempts, 3);
        assert_eq!(row.last_error.as_deref(), Some("broker unavailable"));

        clock.advance(chrono::Duration::hours(1));
        assert_eq!(relay.run_once().unwrap().claimed, 0);
    }

    #[test]
    fn spawned_relay_drains_the_outbox() {
        let (_, db) = setup();
        let bus = Arc::new(InMemoryEventBus::new());
        let sub = bus.subscribe();
        commit(&db, AggregateId::new(), &["e1", "e2"]);

        let handle = OutboxRelay::new(db.clone(), bus, config(5).with_poll_interval(Duration::from_millis(10)))
            .spawn()
            .unwrap();

        for _ in 0..2 {
            sub.recv_timeout(Duration::from_secs(5)).unwrap();
        }
        handle.shutdown();
        assert_eq!(db.stats().unwrap().published, 2);
    }
}
