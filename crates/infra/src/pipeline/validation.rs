use folio_events::Command;

use super::behavior::{Behavior, Next};
use super::context::CommandContext;
use super::error::CommandError;

/// Rejects invalid commands before anything else runs.
#[derive(Debug, Clone, Copy, Default)]
pub struct ValidationBehavior;

impl<C: Command> Behavior<C> for ValidationBehavior {
    fn name(&self) -> &'static str {
        "validation"
    }

    fn handle(&self, command: &C, ctx: &CommandContext, next: Next<'_, C>) -> Result<C::Output, CommandError> {
        command.validate().map_err(CommandError::Validation)?;
        next(command, ctx)
    }
}
