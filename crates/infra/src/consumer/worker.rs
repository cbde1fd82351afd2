//! Background consumer worker.
//!
//! Subscribes an [`IdempotentConsumer`] to the bus, retries transient
//! failures with backoff and parks messages it cannot apply in a dead-letter
//! list.

use std::sync::{Arc, Mutex, mpsc};
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info, warn};

use folio_events::{BrokerMessage, EventBus, Subscription};

use super::idempotent::{ConsumeOutcome, IdempotentConsumer};
use super::store::ConsumerStore;
use crate::retry::RetryPolicy;

/// A message the consumer gave up on.
#[derive(Debug, Clone, Serialize)]
pub struct DeadLetter {
    pub consumer: String,
    pub message: BrokerMessage,
    pub error: String,
    pub attempts: u32,
    pub dead_lettered_at: DateTime<Utc>,
}

/// Shared dead-letter list.
#[derive(Debug, Clone, Default)]
pub struct DeadLetters {
    inner: Arc<Mutex<Vec<DeadLetter>>>,
}

impl DeadLetters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, letter: DeadLetter) {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).push(letter);
    }

    pub fn list(&self) -> Vec<DeadLetter> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove and return everything, e.g. to redeliver after a fix.
    pub fn drain(&self) -> Vec<DeadLetter> {
        std::mem::take(&mut *self.inner.lock().unwrap_or_else(|e| e.into_inner()))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    Consumed(ConsumeOutcome),
    DeadLettered,
}

/// Consumer runtime statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ConsumerStats {
    pub received: u64,
    pub applied: u64,
    pub duplicates: u64,
    pub ignored: u64,
    pub retries: u64,
    pub dead_lettered: u64,
}

/// Deliver one message, retrying transient failures per `retry`.
pub fn deliver<S: ConsumerStore>(
    consumer: &IdempotentConsumer<S>,
    message: &BrokerMessage,
    retry: &RetryPolicy,
    dead_letters: &DeadLetters,
    stats: &mut ConsumerStats,
) -> Delivery {
    stats.received += 1;
    let mut retries = 0;

    loop {
        match consumer.consume(message) {
            Ok(outcome) => {
                match outcome {
                    ConsumeOutcome::Applied => stats.applied += 1,
                    ConsumeOutcome::Duplicate => stats.duplicates += 1,
                    ConsumeOutcome::Ignored => stats.ignored += 1,
                }
                return Delivery::Consumed(outcome);
            }
            Err(err) if err.is_transient() && retry.should_retry(retries) => {
                retries += 1;
                stats.retries += 1;
                let delay = retry.delay_for_attempt(retries);
                warn!(
                    consumer = consumer.name(),
                    event_id = %message.event_id,
                    attempt = retries,
                    error = %err,
                    "consumer apply failed, retrying"
                );
                if !delay.is_zero() {
                    thread::sleep(delay);
                }
            }
            Err(err) => {
                stats.dead_lettered += 1;
                error!(
                    consumer = consumer.name(),
                    event_id = %message.event_id,
                    event_type = %message.event_type,
                    attempts = retries + 1,
                    error = %err,
                    "message dead-lettered"
                );
                dead_letters.push(DeadLetter {
                    consumer: consumer.name().to_string(),
                    message: message.clone(),
                    error: err.to_string(),
                    attempts: retries + 1,
                    dead_lettered_at: consumer.clock().now(),
                });
                return Delivery::DeadLettered;
            }
        }
    }
}

/// Handle to control and join a consumer worker.
#[derive(Debug)]
pub struct ConsumerWorkerHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
    stats: Arc<Mutex<ConsumerStats>>,
    dead_letters: DeadLetters,
}

impl ConsumerWorkerHandle {
    /// Request graceful shutdown and wait for the worker to stop.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }

    pub fn stats(&self) -> ConsumerStats {
        self.stats.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn dead_letters(&self) -> &DeadLetters {
        &self.dead_letters
    }
}

#[derive(Debug)]
pub struct ConsumerWorker;

impl ConsumerWorker {
    /// Subscribe `consumer` to `bus` and process messages on a background thread.
    ///
    /// The subscription is taken before this returns, so anything published
    /// afterwards is seen.
    pub fn spawn<S, B>(consumer: IdempotentConsumer<S>, bus: &B, retry: RetryPolicy) -> std::io::Result<ConsumerWorkerHandle>
    where
        S: ConsumerStore + 'static,
        B: EventBus<BrokerMessage>,
    {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let sub = bus.subscribe();
        let stats = Arc::new(Mutex::new(ConsumerStats::default()));
        let dead_letters = DeadLetters::new();

        let worker_stats = stats.clone();
        let worker_dead_letters = dead_letters.clone();
        let join = thread::Builder::new()
            .name(format!("consumer-{}", consumer.name()))
            .spawn(move || worker_loop(consumer, sub, shutdown_rx, retry, worker_dead_letters, worker_stats))?;

        Ok(ConsumerWorkerHandle {
            shutdown: shutdown_tx,
            join: Some(join),
            stats,
            dead_letters,
        })
    }
}

fn worker_loop<S: ConsumerStore>(
    consumer: IdempotentConsumer<S>,
    sub: Subscription<BrokerMessage>,
    shutdown_rx: mpsc::Receiver<()>,
    retry: RetryPolicy,
    dead_letters: DeadLetters,
    stats: Arc<Mutex<ConsumerStats>>,
) {
    let tick = Duration::from_millis(250);
    info!(consumer = consumer.name(), "consumer worker started");

    loop {
        if shutdown_rx.try_recv().is_ok() {
            break;
        }

        match sub.recv_timeout(tick) {
            Ok(message) => {
                let mut local = ConsumerStats::default();
                deliver(&consumer, &message, &retry, &dead_letters, &mut local);

                let mut s = stats.lock().unwrap_or_else(|e| e.into_inner());
                s.received += local.received;
                s.applied += local.applied;
                s.duplicates += local.duplicates;
                s.ignored += local.ignored;
                s.retries += local.retries;
                s.dead_lettered += local.dead_lettered;
            }
            Err(mpsc::RecvTimeoutError::Timeout) => continue,
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }

    info!(consumer = consumer.name(), "consumer worker stopped");
}
