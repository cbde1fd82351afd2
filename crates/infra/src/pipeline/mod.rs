//! Ordered command pipeline: validation, logging, cache invalidation and
//! optimistic-concurrency retry wrapped around a command handler.

mod behavior;
mod concurrency;
mod context;
mod error;
mod invalidation;
mod logging;
mod validation;

use std::sync::Arc;

use folio_events::Command;

use crate::config::PipelineSettings;

pub use behavior::{Behavior, CommandHandler, FnHandler, Next, Pipeline, PipelineBuilder};
pub use concurrency::ConcurrencyRetryBehavior;
pub use context::{CancellationToken, CommandContext};
pub use error::CommandError;
pub use invalidation::{CacheInvalidationBehavior, CacheInvalidator, InvalidationReport};
pub use logging::LoggingBehavior;
pub use validation::ValidationBehavior;

impl<C: Command> Pipeline<C> {
    /// The standard chain: validation, logging, invalidation, then retry
    /// innermost around the handler.
    pub fn standard(
        handler: Arc<dyn CommandHandler<C>>,
        invalidator: CacheInvalidator,
        settings: &PipelineSettings,
    ) -> Self {
        Pipeline::builder()
            .then(ValidationBehavior)
            .then(LoggingBehavior)
            .then(CacheInvalidationBehavior::new(invalidator))
            .then(ConcurrencyRetryBehavior::new(settings.retry_policy()))
            .build(handler)
    }
}
