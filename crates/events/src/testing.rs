//! Event fixtures shared by this crate's unit tests.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use folio_core::AggregateId;

use crate::event::{Event, EventDescriptor};

pub const NOTE_CREATED: EventDescriptor = EventDescriptor::relayed("notes.note.created", "notes.note");
pub const NOTE_TOUCHED: EventDescriptor = EventDescriptor::local("notes.note.touched", "notes.note");

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum NoteEvent {
    Created {
        note_id: AggregateId,
        text: String,
        occurred_at: DateTime<Utc>,
    },
    Touched {
        note_id: AggregateId,
        occurred_at: DateTime<Utc>,
    },
}

impl Event for NoteEvent {
    fn descriptors() -> &'static [EventDescriptor] {
        &[NOTE_CREATED, NOTE_TOUCHED]
    }

    fn descriptor(&self) -> &'static EventDescriptor {
        match self {
            NoteEvent::Created { .. } => &NOTE_CREATED,
            NoteEvent::Touched { .. } => &NOTE_TOUCHED,
        }
    }

    fn aggregate_id(&self) -> AggregateId {
        match self {
            NoteEvent::Created { note_id, .. } | NoteEvent::Touched { note_id, .. } => *note_id,
        }
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            NoteEvent::Created { occurred_at, .. } | NoteEvent::Touched { occurred_at, .. } => {
                *occurred_at
            }
        }
    }
}

pub fn note_created(note_id: AggregateId, text: &str) -> NoteEvent {
    NoteEvent::Created {
        note_id,
        text: text.to_string(),
        occurred_at: Utc::now(),
    }
}
