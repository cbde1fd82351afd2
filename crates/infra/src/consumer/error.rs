use thiserror::Error;

/// Failure reported by an [`EventHandler`](super::EventHandler).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApplyError {
    /// Worth retrying (lock timeout, downstream hiccup).
    #[error("transient failure: {0}")]
    Transient(String),
    /// Retrying will not help (malformed payload, broken invariant).
    #[error("permanent failure: {0}")]
    Permanent(String),
}

impl ApplyError {
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn permanent(msg: impl Into<String>) -> Self {
        Self::Permanent(msg.into())
    }
}

#[derive(Debug, Error)]
pub enum ConsumerError {
    #[error("handler failed for {event_type}: {source}")]
    Apply {
        event_type: String,
        #[source]
        source: ApplyError,
    },

    #[error("consumer storage error: {0}")]
    Storage(String),
}

impl ConsumerError {
    pub fn is_transient(&self) -> bool {
        match self {
            ConsumerError::Apply { source, .. } => matches!(source, ApplyError::Transient(_)),
            ConsumerError::Storage(_) => true,
        }
    }
}
