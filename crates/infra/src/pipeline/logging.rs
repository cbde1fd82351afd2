use std::time::Instant;

use tracing::{debug, info, info_span, warn};

use folio_events::Command;

use super::behavior::{Behavior, Next};
use super::context::CommandContext;
use super::error::CommandError;

/// Logs every command with its outcome and elapsed time.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingBehavior;

impl<C: Command> Behavior<C> for LoggingBehavior {
    fn name(&self) -> &'static str {
        "logging"
    }

    fn handle(&self, command: &C, ctx: &CommandContext, next: Next<'_, C>) -> Result<C::Output, CommandError> {
        let span = info_span!(
            "command",
            command = command.name(),
            correlation_id = %ctx.correlation_id(),
            aggregate_id = ?command.target_aggregate_id(),
        );
        let _entered = span.enter();

        debug!("command started");
        let started = Instant::now();
        let result = next(command, ctx);
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match &result {
            Ok(_) => info!(elapsed_ms, outcome = "ok", "command executed"),
            Err(err) => warn!(elapsed_ms, outcome = err.kind(), error = %err, "command failed"),
        }
        result
    }
}
