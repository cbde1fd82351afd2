use std::sync::Arc;

use tracing::{debug, warn};

use folio_events::{Command, Invalidations};

use super::behavior::{Behavior, Next};
use super::context::CommandContext;
use super::error::CommandError;
use crate::cache::{CacheStore, VersionTokenRegistry};

/// What one invalidation pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InvalidationReport {
    pub removed: usize,
    pub bumped: usize,
    pub failed: usize,
}

/// Applies a command's declared invalidations to the cache.
#[derive(Clone)]
pub struct CacheInvalidator {
    cache: Arc<dyn CacheStore>,
    tokens: VersionTokenRegistry,
}

impl CacheInvalidator {
    pub fn new(cache: Arc<dyn CacheStore>, tokens: VersionTokenRegistry) -> Self {
        Self { cache, tokens }
    }

    /// Remove keys and bump tokens. Failures are logged and counted, never raised.
    pub fn apply(&self, invalidations: &Invalidations) -> InvalidationReport {
        let mut report = InvalidationReport::default();

        for key in invalidations.keys() {
            match self.cache.remove(key) {
                Ok(()) => report.removed += 1,
                Err(err) => {
                    report.failed += 1;
                    warn!(key = %key, error = %err, "cache key removal failed");
                }
            }
        }
        for collection in invalidations.version_tokens() {
            match self.tokens.bump(collection) {
                Ok(_) => report.bumped += 1,
                Err(err) => {
                    report.failed += 1;
                    warn!(collection = %collection, error = %err, "version token bump failed");
                }
            }
        }
        report
    }
}

/// Invalidates cache state after the inner pipeline succeeded.
///
/// Sits outside the concurrency retry so it runs once, after the attempt that
/// committed. A failed command invalidates nothing.
pub struct CacheInvalidationBehavior {
    invalidator: CacheInvalidator,
}

impl CacheInvalidationBehavior {
    pub fn new(invalidator: CacheInvalidator) -> Self {
        Self { invalidator }
    }
}

impl<C: Command> Behavior<C> for CacheInvalidationBehavior {
    fn name(&self) -> &'static str {
        "cache-invalidation"
    }

    fn handle(&self, command: &C, ctx: &CommandContext, next: Next<'_, C>) -> Result<C::Output, CommandError> {
        let output = next(command, ctx)?;

        let invalidations = command.invalidations();
        if !invalidations.is_empty() {
            let report = self.invalidator.apply(&invalidations);
            debug!(
                command = command.name(),
                removed = report.removed,
                bumped = report.bumped,
                failed = report.failed,
                "cache invalidated"
            );
        }
        Ok(output)
    }
}
