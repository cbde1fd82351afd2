use std::sync::Arc;

use folio_events::Command;

use super::context::CommandContext;
use super::error::CommandError;

/// Terminal step: turns a command into entity writes and events.
pub trait CommandHandler<C: Command>: Send + Sync {
    fn handle(&self, command: &C, ctx: &CommandContext) -> Result<C::Output, CommandError>;
}

impl<C, H> CommandHandler<C> for Arc<H>
where
    C: Command,
    H: CommandHandler<C> + ?Sized,
{
    fn handle(&self, command: &C, ctx: &CommandContext) -> Result<C::Output, CommandError> {
        (**self).handle(command, ctx)
    }
}

/// Adapter turning a closure into a [`CommandHandler`].
pub struct FnHandler<F>(pub F);

impl<C, F> CommandHandler<C> for FnHandler<F>
where
    C: Command,
    F: Fn(&C, &CommandContext) -> Result<C::Output, CommandError> + Send + Sync,
{
    fn handle(&self, command: &C, ctx: &CommandContext) -> Result<C::Output, CommandError> {
        (self.0)(command, ctx)
    }
}

/// The rest of the pipeline after the current step.
pub type Next<'a, C> = &'a dyn Fn(&C, &CommandContext) -> Result<<C as Command>::Output, CommandError>;

/// One cross-cutting pipeline step.
///
/// A behavior may short-circuit by returning without calling `next`, call it
/// once, or (for retries) call it several times.
pub trait Behavior<C: Command>: Send + Sync {
    fn name(&self) -> &'static str;

    fn handle(&self, command: &C, ctx: &CommandContext, next: Next<'_, C>) -> Result<C::Output, CommandError>;
}

/// An ordered chain of behaviors around a handler.
///
/// The first behavior added is the outermost.
pub struct Pipeline<C: Command> {
    behaviors: Vec<Box<dyn Behavior<C>>>,
    handler: Arc<dyn CommandHandler<C>>,
}

impl<C: Command> Pipeline<C> {
    pub fn builder() -> PipelineBuilder<C> {
        PipelineBuilder::new()
    }

    pub fn execute(&self, command: &C, ctx: &CommandContext) -> Result<C::Output, CommandError> {
        self.run(0, command, ctx)
    }

    /// Behavior names, outermost first.
    pub fn behavior_names(&self) -> Vec<&'static str> {
        self.behaviors.iter().map(|b| b.name()).collect()
    }

    fn run(&self, index: usize, command: &C, ctx: &CommandContext) -> Result<C::Output, CommandError> {
        match self.behaviors.get(index) {
            Some(behavior) => {
                let next = |command: &C, ctx: &CommandContext| self.run(index + 1, command, ctx);
                behavior.handle(command, ctx, &next)
            }
            None => self.handler.handle(command, ctx),
        }
    }
}

pub struct PipelineBuilder<C: Command> {
    behaviors: Vec<Box<dyn Behavior<C>>>,
}

impl<C: Command> Default for PipelineBuilder<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Command> PipelineBuilder<C> {
    pub fn new() -> Self {
        Self { behaviors: Vec::new() }
    }

    /// Append a behavior inside the ones already added.
    pub fn then(mut self, behavior: impl Behavior<C> + 'static) -> Self {
        self.behaviors.push(Box::new(behavior));
        self
    }

    pub fn build(self, handler: Arc<dyn CommandHandler<C>>) -> Pipeline<C> {
        Pipeline {
            behaviors: self.behaviors,
            handler,
        }
    }
}
