use chrono::{DateTime, Utc};

use folio_core::AggregateId;

/// Static description of one event variant.
///
/// Descriptors are declared as constants next to the event enum and collected
/// into an [`EventRegistry`](crate::EventRegistry) once at startup. The `relay`
/// flag decides whether the outbox append step persists the event for the
/// relay; non-relayed events stay local to the aggregate.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct EventDescriptor {
    /// Stable event name/type identifier (e.g. "catalog.book.created").
    pub event_type: &'static str,
    /// Aggregate kind the event belongs to (e.g. "catalog.book").
    pub aggregate_type: &'static str,
    /// Schema version for this event type.
    pub version: u32,
    /// Whether the event must be written to the outbox and relayed.
    pub relay: bool,
}

impl EventDescriptor {
    pub const fn relayed(event_type: &'static str, aggregate_type: &'static str) -> Self {
        Self {
            event_type,
            aggregate_type,
            version: 1,
            relay: true,
        }
    }

    pub const fn local(event_type: &'static str, aggregate_type: &'static str) -> Self {
        Self {
            event_type,
            aggregate_type,
            version: 1,
            relay: false,
        }
    }

    pub const fn with_version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }
}

/// A domain-agnostic event payload.
///
/// Events are:
/// - **immutable** (treat them as facts)
/// - **versioned** (schema evolution)
/// - owned by exactly one aggregate
///
/// Implementations are usually one enum per aggregate kind, with one
/// [`EventDescriptor`] per variant.
pub trait Event: Clone + core::fmt::Debug + Send + Sync + 'static {
    /// Every variant this type can take, for registration at startup.
    fn descriptors() -> &'static [EventDescriptor]
    where
        Self: Sized;

    /// Descriptor of this particular value.
    fn descriptor(&self) -> &'static EventDescriptor;

    /// Identity of the aggregate that changed.
    fn aggregate_id(&self) -> AggregateId;

    /// When the event occurred (business time).
    fn occurred_at(&self) -> DateTime<Utc>;

    fn event_type(&self) -> &'static str {
        self.descriptor().event_type
    }

    fn version(&self) -> u32 {
        self.descriptor().version
    }
}
