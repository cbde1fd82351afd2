use std::thread;

use tracing::warn;

use folio_events::Command;

use super::behavior::{Behavior, Next};
use super::context::CommandContext;
use super::error::CommandError;
use crate::retry::RetryPolicy;

/// Re-runs the inner pipeline on optimistic-concurrency conflicts.
///
/// Innermost step: each attempt is a fresh load/modify/commit by the handler.
/// `retry.max_attempts` bounds the retries, so the handler runs at most
/// `max_attempts + 1` times. Cancellation is honoured before every attempt.
#[derive(Debug, Clone)]
pub struct ConcurrencyRetryBehavior {
    retry: RetryPolicy,
}

impl ConcurrencyRetryBehavior {
    pub fn new(retry: RetryPolicy) -> Self {
        Self { retry }
    }

    pub fn max_retries(&self) -> u32 {
        self.retry.max_attempts
    }
}

impl<C: Command> Behavior<C> for ConcurrencyRetryBehavior {
    fn name(&self) -> &'static str {
        "concurrency-retry"
    }

    fn handle(&self, command: &C, ctx: &CommandContext, next: Next<'_, C>) -> Result<C::Output, CommandError> {
        let mut retries = 0;

        loop {
            ctx.ensure_active()?;

            match next(command, ctx) {
                Err(CommandError::Concurrency(message)) => {
                    if !self.retry.should_retry(retries) {
                        return Err(CommandError::ConflictExhausted {
                            attempts: retries + 1,
                            message,
                        });
                    }
                    retries += 1;
                    warn!(
                        command = command.name(),
                        retry = retries,
                        max_retries = self.retry.max_attempts,
                        conflict = %message,
                        "concurrency conflict, retrying"
                    );
                    let delay = self.retry.delay_for_attempt(retries);
                    if !delay.is_zero() {
                        thread::sleep(delay);
                    }
                }
                other => return other,
            }
        }
    }
}
