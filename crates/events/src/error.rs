use thiserror::Error;

use folio_core::AggregateId;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EventError {
    /// An aggregate tried to record an event that names a different aggregate.
    #[error("event targets aggregate {found}, but was recorded on {owner}")]
    AggregateMismatch {
        owner: AggregateId,
        found: AggregateId,
    },

    /// The event type was never registered at startup.
    #[error("event type '{0}' is not registered")]
    Unregistered(String),

    /// Two different descriptors were registered under the same event type.
    #[error("conflicting descriptors registered for event type '{0}'")]
    ConflictingDescriptor(&'static str),
}
