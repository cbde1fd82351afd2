use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use folio_core::{AggregateId, AggregateRoot, DomainError, DomainResult};
use folio_events::{
    Command, Event, EventDescriptor, Invalidations, PendingEvents, RecordsEvents, ValidationErrors,
    next_occurred_at,
};

/// Aggregate kind used for storage rows, events and point-cache keys.
pub const BOOK_AGGREGATE_TYPE: &str = "catalog.book";

/// Collection name whose version token guards cached book listings.
pub const BOOKS_COLLECTION: &str = "catalog.books";

const MAX_TITLE_LEN: usize = 200;
const MAX_AUTHOR_LEN: usize = 120;

pub const BOOK_CREATED: EventDescriptor =
    EventDescriptor::relayed("catalog.book.created", BOOK_AGGREGATE_TYPE);
pub const BOOK_UPDATED: EventDescriptor =
    EventDescriptor::relayed("catalog.book.updated", BOOK_AGGREGATE_TYPE);
pub const BOOK_DELETED: EventDescriptor =
    EventDescriptor::relayed("catalog.book.deleted", BOOK_AGGREGATE_TYPE);

/// Book identifier.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BookId(pub AggregateId);

impl BookId {
    pub fn new(id: AggregateId) -> Self {
        Self(id)
    }

    pub fn generate() -> Self {
        Self(AggregateId::new())
    }

    /// Point-cache key for a single book.
    pub fn cache_key(&self) -> String {
        format!("{BOOK_AGGREGATE_TYPE}:{}", self.0)
    }
}

impl core::fmt::Display for BookId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// Aggregate root: Book.
///
/// `version` is the storage version stamp the instance was loaded at; it is
/// not part of the persisted state. `last_event_at` is persisted so every new
/// event is stamped strictly after the previous one, across loads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Book {
    id: BookId,
    title: String,
    author: Option<String>,
    deleted: bool,
    #[serde(default)]
    last_event_at: Option<DateTime<Utc>>,
    #[serde(skip)]
    version: u64,
    #[serde(skip)]
    pending: PendingEvents<BookEvent>,
}

impl Book {
    /// Create a new book, recording `BookCreated`.
    pub fn create(
        id: BookId,
        title: impl Into<String>,
        author: Option<String>,
        occurred_at: DateTime<Utc>,
    ) -> DomainResult<Self> {
        let title = title.into();
        ensure_title(&title)?;

        let mut book = Self {
            id,
            title: title.clone(),
            author: author.clone(),
            deleted: false,
            last_event_at: None,
            version: 0,
            pending: PendingEvents::new(),
        };
        let occurred_at = book.stamp(occurred_at);
        book.record(BookEvent::Created(BookCreated {
            book_id: id,
            title,
            author,
            occurred_at,
        }))?;
        Ok(book)
    }

    /// Attach the version stamp the state was loaded at.
    pub fn with_version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }

    pub fn id_typed(&self) -> BookId {
        self.id
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn author(&self) -> Option<&str> {
        self.author.as_deref()
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    pub fn update(
        &mut self,
        title: impl Into<String>,
        author: Option<String>,
        occurred_at: DateTime<Utc>,
    ) -> DomainResult<()> {
        if self.deleted {
            return Err(DomainError::invariant("cannot update a deleted book"));
        }
        let title = title.into();
        ensure_title(&title)?;

        self.title = title.clone();
        self.author = author.clone();
        let occurred_at = self.stamp(occurred_at);
        self.record(BookEvent::Updated(BookUpdated {
            book_id: self.id,
            title,
            author,
            occurred_at,
        }))
    }

    pub fn delete(&mut self, occurred_at: DateTime<Utc>) -> DomainResult<()> {
        if self.deleted {
            return Err(DomainError::not_found());
        }
        self.deleted = true;
        let occurred_at = self.stamp(occurred_at);
        self.record(BookEvent::Deleted(BookDeleted {
            book_id: self.id,
            occurred_at,
        }))
    }

    fn stamp(&mut self, now: DateTime<Utc>) -> DateTime<Utc> {
        let stamped = next_occurred_at(self.last_event_at, now);
        self.last_event_at = Some(stamped);
        stamped
    }

    fn record(&mut self, event: BookEvent) -> DomainResult<()> {
        self.pending
            .record(self.id.0, event)
            .map(|_| ())
            .map_err(|e| DomainError::invariant(e.to_string()))
    }
}

fn ensure_title(title: &str) -> DomainResult<()> {
    if title.trim().is_empty() {
        return Err(DomainError::validation("title must not be empty"));
    }
    if title.chars().count() > MAX_TITLE_LEN {
        return Err(DomainError::validation("title is too long"));
    }
    Ok(())
}

impl AggregateRoot for Book {
    type Id = BookId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

impl RecordsEvents for Book {
    type Event = BookEvent;

    fn aggregate_id(&self) -> AggregateId {
        self.id.0
    }

    fn pending_events(&self) -> &PendingEvents<BookEvent> {
        &self.pending
    }

    fn pending_events_mut(&mut self) -> &mut PendingEvents<BookEvent> {
        &mut self.pending
    }
}

/// Returned by every book command.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct BookReceipt {
    pub book_id: BookId,
    /// Version stamp after the write committed.
    pub version: u64,
}

/// Command: CreateBook.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateBook {
    pub book_id: BookId,
    pub title: String,
    pub author: Option<String>,
}

/// Command: UpdateBook.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateBook {
    pub book_id: BookId,
    pub title: String,
    pub author: Option<String>,
}

/// Command: DeleteBook.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteBook {
    pub book_id: BookId,
}

fn validate_fields(title: &str, author: Option<&str>) -> Result<(), ValidationErrors> {
    let mut errors = ValidationErrors::new();
    errors.ensure(!title.trim().is_empty(), "title", "must not be empty");
    errors.ensure(
        title.chars().count() <= MAX_TITLE_LEN,
        "title",
        "must be at most 200 characters",
    );
    if let Some(author) = author {
        errors.ensure(!author.trim().is_empty(), "author", "must not be blank");
        errors.ensure(
            author.chars().count() <= MAX_AUTHOR_LEN,
            "author",
            "must be at most 120 characters",
        );
    }
    errors.into_result()
}

impl Command for CreateBook {
    type Output = BookReceipt;

    fn name(&self) -> &'static str {
        "catalog.book.create"
    }

    fn target_aggregate_id(&self) -> Option<AggregateId> {
        Some(self.book_id.0)
    }

    fn validate(&self) -> Result<(), ValidationErrors> {
        validate_fields(&self.title, self.author.as_deref())
    }

    fn invalidations(&self) -> Invalidations {
        Invalidations::none().bump_token(BOOKS_COLLECTION)
    }
}

impl Command for UpdateBook {
    type Output = BookReceipt;

    fn name(&self) -> &'static str {
        "catalog.book.update"
    }

    fn target_aggregate_id(&self) -> Option<AggregateId> {
        Some(self.book_id.0)
    }

    fn validate(&self) -> Result<(), ValidationErrors> {
        validate_fields(&self.title, self.author.as_deref())
    }

    fn invalidations(&self) -> Invalidations {
        Invalidations::none()
            .remove_key(self.book_id.cache_key())
            .bump_token(BOOKS_COLLECTION)
    }
}

impl Command for DeleteBook {
    type Output = BookReceipt;

    fn name(&self) -> &'static str {
        "catalog.book.delete"
    }

    fn target_aggregate_id(&self) -> Option<AggregateId> {
        Some(self.book_id.0)
    }

    fn invalidations(&self) -> Invalidations {
        Invalidations::none()
            .remove_key(self.book_id.cache_key())
            .bump_token(BOOKS_COLLECTION)
    }
}

/// Event: BookCreated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookCreated {
    pub book_id: BookId,
    pub title: String,
    pub author: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

/// Event: BookUpdated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookUpdated {
    pub book_id: BookId,
    pub title: String,
    pub author: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

/// Event: BookDeleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookDeleted {
    pub book_id: BookId,
    pub occurred_at: DateTime<Utc>,
}

/// Serialized internally tagged: `{"kind": "created", "book_id": ..}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BookEvent {
    Created(BookCreated),
    Updated(BookUpdated),
    Deleted(BookDeleted),
}

impl Event for BookEvent {
    fn descriptors() -> &'static [EventDescriptor] {
        &[BOOK_CREATED, BOOK_UPDATED, BOOK_DELETED]
    }

    fn descriptor(&self) -> &'static EventDescriptor {
        match self {
            BookEvent::Created(_) => &BOOK_CREATED,
            BookEvent::Updated(_) => &BOOK_UPDATED,
            BookEvent::Deleted(_) => &BOOK_DELETED,
        }
    }

    fn aggregate_id(&self) -> AggregateId {
        match self {
            BookEvent::Created(e) => e.book_id.0,
            BookEvent::Updated(e) => e.book_id.0,
            BookEvent::Deleted(e) => e.book_id.0,
        }
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            BookEvent::Created(e) => e.occurred_at,
            BookEvent::Updated(e) => e.occurred_at,
            BookEvent::Deleted(e) => e.occurred_at,
        }
    }
}
