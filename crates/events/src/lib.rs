//! Domain events, their static descriptors, and the transport seams events
//! travel through after they leave the outbox.

pub mod bus;
pub mod command;
pub mod dedup;
pub mod domain_event;
pub mod error;
pub mod event;
pub mod in_memory_bus;
pub mod message;
pub mod registry;

#[cfg(test)]
mod testing;

pub use bus::{EventBus, Subscription};
pub use command::{Command, FieldError, Invalidations, ValidationErrors};
pub use dedup::DedupKey;
pub use domain_event::{DomainEvent, PendingEvents, RecordsEvents, next_occurred_at};
pub use error::EventError;
pub use event::{Event, EventDescriptor};
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus};
pub use message::BrokerMessage;
pub use registry::EventRegistry;
