//! Startup-time registry of event descriptors.

use std::collections::HashMap;

use crate::error::EventError;
use crate::event::{Event, EventDescriptor};

/// Maps each event type name to its static descriptor.
///
/// Built once while wiring the application and then shared read-only; lookups
/// at dispatch time are plain map reads.
#[derive(Debug, Default, Clone)]
pub struct EventRegistry {
    descriptors: HashMap<&'static str, EventDescriptor>,
}

impl EventRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register every variant of `E`.
    ///
    /// Registering the same type twice is harmless; registering a different
    /// descriptor under an existing name is an error.
    pub fn register<E: Event>(&mut self) -> Result<(), EventError> {
        for descriptor in E::descriptors() {
            self.insert(*descriptor)?;
        }
        Ok(())
    }

    /// Builder-style [`register`](Self::register).
    pub fn with<E: Event>(mut self) -> Result<Self, EventError> {
        self.register::<E>()?;
        Ok(self)
    }

    pub fn insert(&mut self, descriptor: EventDescriptor) -> Result<(), EventError> {
        match self.descriptors.get(descriptor.event_type) {
            Some(existing) if *existing != descriptor => {
                Err(EventError::ConflictingDescriptor(descriptor.event_type))
            }
            Some(_) => Ok(()),
            None => {
                self.descriptors.insert(descriptor.event_type, descriptor);
                Ok(())
            }
        }
    }

    pub fn describe(&self, event_type: &str) -> Option<&EventDescriptor> {
        self.descriptors.get(event_type)
    }

    pub fn require(&self, event_type: &str) -> Result<&EventDescriptor, EventError> {
        self.describe(event_type)
            .ok_or_else(|| EventError::Unregistered(event_type.to_string()))
    }

    pub fn event_types(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.descriptors.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }
}
