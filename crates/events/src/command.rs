//! Command contract consumed by the write pipeline.

use folio_core::AggregateId;

/// A state-changing request.
///
/// Commands represent **intent**. They are transient (never persisted); the
/// handler that executes one turns it into entity writes and domain events.
///
/// Besides the intent itself, a command declares:
/// - structural/semantic validation that runs before any side effect
/// - which cache entries and collection version tokens its success makes stale
///
/// Commands must be cloneable: the pipeline may hand the same command to the
/// handler more than once when retrying an optimistic-concurrency conflict.
pub trait Command: Clone + core::fmt::Debug + Send + Sync + 'static {
    /// Result returned to the caller on success.
    type Output: Send + 'static;

    /// Stable name used in logs (e.g. "catalog.book.create").
    fn name(&self) -> &'static str;

    /// The aggregate this command targets, if it is already known.
    fn target_aggregate_id(&self) -> Option<AggregateId> {
        None
    }

    fn validate(&self) -> Result<(), ValidationErrors> {
        Ok(())
    }

    fn invalidations(&self) -> Invalidations {
        Invalidations::none()
    }
}

/// Cache state a command makes stale once its write commits.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Invalidations {
    keys: Vec<String>,
    version_tokens: Vec<String>,
}

impl Invalidations {
    pub fn none() -> Self {
        Self::default()
    }

    /// Remove a point-cache entry by key.
    pub fn remove_key(mut self, key: impl Into<String>) -> Self {
        self.keys.push(key.into());
        self
    }

    /// Bump the version token of a cached collection.
    pub fn bump_token(mut self, collection: impl Into<String>) -> Self {
        self.version_tokens.push(collection.into());
        self
    }

    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    pub fn version_tokens(&self) -> &[String] {
        &self.version_tokens
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty() && self.version_tokens.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

/// Every reason a command was rejected before execution.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationErrors {
    errors: Vec<FieldError>,
}

impl ValidationErrors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn single(field: impl Into<String>, message: impl Into<String>) -> Self {
        let mut errors = Self::new();
        errors.push(field, message);
        errors
    }

    pub fn push(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.errors.push(FieldError {
            field: field.into(),
            message: message.into(),
        });
    }

    /// Add an error when `condition` does not hold.
    pub fn ensure(&mut self, condition: bool, field: &str, message: &str) {
        if !condition {
            self.push(field, message);
        }
    }

    pub fn errors(&self) -> &[FieldError] {
        &self.errors
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    /// `Ok(())` when nothing was recorded.
    pub fn into_result(self) -> Result<(), ValidationErrors> {
        if self.is_empty() { Ok(()) } else { Err(self) }
    }
}

impl core::fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        for (idx, e) in self.errors.iter().enumerate() {
            if idx > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{}: {}", e.field, e.message)?;
        }
        Ok(())
    }
}

impl std::error::Error for ValidationErrors {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_errors_are_ok() {
        let mut errors = ValidationErrors::new();
        errors.ensure(true, "title", "required");
        assert!(errors.into_result().is_ok());
    }

    #[test]
    fn errors_render_field_and_message() {
        let mut errors = ValidationErrors::new();
        errors.ensure(false, "title", "required");
        errors.push("author", "too long");

        let err = errors.into_result().unwrap_err();
        assert_eq!(err.errors().len(), 2);
        assert_eq!(err.to_string(), "title: required; author: too long");
    }

    #[test]
    fn invalidations_collect_keys_and_tokens() {
        let inv = Invalidations::none()
            .remove_key("catalog.book:1")
            .bump_token("catalog.book");

        assert!(!inv.is_empty());
        assert_eq!(inv.keys(), ["catalog.book:1".to_string()]);
        assert_eq!(inv.version_tokens(), ["catalog.book".to_string()]);
        assert!(Invalidations::none().is_empty());
    }
}
