use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use folio_catalog::{
    BOOK_AGGREGATE_TYPE, BOOKS_COLLECTION, Book, BookId, BookReceipt, CreateBook, DeleteBook, UpdateBook,
};
use folio_core::{AggregateRoot, Clock, ExpectedVersion};

use crate::cache::{CacheStore, Cached, EntityCache, ListCache, ListQuery, VersionTokenRegistry};
use crate::config::{CacheSettings, PipelineSettings};
use crate::pipeline::{CacheInvalidator, CommandContext, CommandError, CommandHandler, Pipeline};
use crate::storage::{InMemoryDatabase, StorageError, UnitOfWork};

/// Executes book commands against the in-memory database.
///
/// Each call is one load/modify/commit attempt; conflicts surface as
/// [`CommandError::Concurrency`] for the pipeline to retry.
#[derive(Debug, Clone)]
pub struct BookCommandHandler {
    db: Arc<InMemoryDatabase>,
}

impl BookCommandHandler {
    pub fn new(db: Arc<InMemoryDatabase>) -> Self {
        Self { db }
    }

    fn load(&self, uow: &UnitOfWork<'_>, id: BookId) -> Result<Book, CommandError> {
        match uow.load_as::<Book>(BOOK_AGGREGATE_TYPE, id.0)? {
            Some((book, version)) if !book.is_deleted() => Ok(book.with_version(version)),
            _ => Err(CommandError::NotFound),
        }
    }

    fn save(&self, mut uow: UnitOfWork<'_>, mut book: Book, expected: ExpectedVersion) -> Result<BookReceipt, CommandError> {
        let book_id = book.id_typed();
        let staged = uow.save_aggregate(BOOK_AGGREGATE_TYPE, &mut book, expected)?;
        let receipt = uow.commit()?;
        let version = receipt
            .version_of(BOOK_AGGREGATE_TYPE, book_id.0)
            .ok_or_else(|| CommandError::Storage(format!("commit did not record book {book_id}")))?;

        debug!(book_id = %book_id, version, events = staged, "book saved");
        Ok(BookReceipt { book_id, version })
    }
}

impl CommandHandler<CreateBook> for BookCommandHandler {
    fn handle(&self, command: &CreateBook, _ctx: &CommandContext) -> Result<BookReceipt, CommandError> {
        let uow = self.db.begin();
        if uow.load(BOOK_AGGREGATE_TYPE, command.book_id.0)?.is_some() {
            return Err(CommandError::Domain(format!("book {} already exists", command.book_id)));
        }

        let book = Book::create(
            command.book_id,
            command.title.clone(),
            command.author.clone(),
            self.db.clock().now(),
        )?;
        self.save(uow, book, ExpectedVersion::Absent)
    }
}

impl CommandHandler<UpdateBook> for BookCommandHandler {
    fn handle(&self, command: &UpdateBook, _ctx: &CommandContext) -> Result<BookReceipt, CommandError> {
        let uow = self.db.begin();
        let mut book = self.load(&uow, command.book_id)?;
        let expected = ExpectedVersion::Exact(book.version());

        book.update(command.title.clone(), command.author.clone(), self.db.clock().now())?;
        self.save(uow, book, expected)
    }
}

impl CommandHandler<DeleteBook> for BookCommandHandler {
    fn handle(&self, command: &DeleteBook, _ctx: &CommandContext) -> Result<BookReceipt, CommandError> {
        let uow = self.db.begin();
        let mut book = self.load(&uow, command.book_id)?;
        let expected = ExpectedVersion::Exact(book.version());

        book.delete(self.db.clock().now())?;
        self.save(uow, book, expected)
    }
}

/// The three book pipelines sharing one handler and invalidator.
pub struct BookPipelines {
    pub create: Pipeline<CreateBook>,
    pub update: Pipeline<UpdateBook>,
    pub delete: Pipeline<DeleteBook>,
}

impl BookPipelines {
    pub fn new(handler: BookCommandHandler, invalidator: CacheInvalidator, settings: &PipelineSettings) -> Self {
        let handler = Arc::new(handler);
        Self {
            create: Pipeline::standard(handler.clone(), invalidator.clone(), settings),
            update: Pipeline::standard(handler.clone(), invalidator.clone(), settings),
            delete: Pipeline::standard(handler, invalidator, settings),
        }
    }
}

/// Read model of a live book.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookView {
    pub id: BookId,
    pub title: String,
    pub author: Option<String>,
    pub version: u64,
}

impl BookView {
    fn from_book(book: &Book, version: u64) -> Self {
        Self {
            id: book.id_typed(),
            title: book.title().to_string(),
            author: book.author().map(str::to_string),
            version,
        }
    }

    fn matches(&self, needle: &str) -> bool {
        let needle = needle.to_lowercase();
        self.title.to_lowercase().contains(&needle)
            || self
                .author
                .as_deref()
                .is_some_and(|author| author.to_lowercase().contains(&needle))
    }
}

/// Cached book reads: single books by id, and paged listings.
///
/// Pages are 1-based; page 0 is read as page 1. `sort` accepts `title`
/// (default), `-title`, `author` and `-author`.
#[derive(Clone)]
pub struct BookQueries {
    db: Arc<InMemoryDatabase>,
    lists: ListCache,
    entities: EntityCache,
}

impl BookQueries {
    pub fn new(
        db: Arc<InMemoryDatabase>,
        cache: Arc<dyn CacheStore>,
        tokens: VersionTokenRegistry,
        settings: &CacheSettings,
    ) -> Self {
        Self {
            db,
            lists: ListCache::new(cache.clone(), tokens, settings.list_options()),
            entities: EntityCache::new(cache, settings.entity_options()),
        }
    }

    pub fn get(&self, id: BookId) -> Result<Cached<Option<BookView>>, StorageError> {
        self.entities.get_or_load(&id.cache_key(), || {
            let Some(record) = self.db.entity(BOOK_AGGREGATE_TYPE, id.0)? else {
                return Ok(None);
            };
            let book: Book = record.decode()?;
            Ok((!book.is_deleted()).then(|| BookView::from_book(&book, record.version)))
        })
    }

    pub fn list(&self, query: &ListQuery) -> Result<Cached<Vec<BookView>>, StorageError> {
        self.lists.get_or_load(BOOKS_COLLECTION, query, || self.load_page(query))
    }

    fn load_page(&self, query: &ListQuery) -> Result<Vec<BookView>, StorageError> {
        let mut views = Vec::new();
        for record in self.db.entities(BOOK_AGGREGATE_TYPE)? {
            let book: Book = record.decode()?;
            if book.is_deleted() {
                continue;
            }
            let view = BookView::from_book(&book, record.version);
            if query.filter.as_deref().is_none_or(|f| view.matches(f)) {
                views.push(view);
            }
        }

        let (field, descending) = match query.sort.as_deref() {
            Some(sort) => match sort.strip_prefix('-') {
                Some(field) => (field, true),
                None => (sort, false),
            },
            None => ("title", false),
        };
        views.sort_by(|a, b| {
            let ordering = match field {
                "author" => a.author.cmp(&b.author),
                _ => a.title.cmp(&b.title),
            }
            .then_with(|| a.id.0.as_uuid().cmp(b.id.0.as_uuid()));
            if descending { ordering.reverse() } else { ordering }
        });

        let page_size = query.page_size.max(1) as usize;
        let skip = (query.page.max(1) as usize - 1) * page_size;
        Ok(views.into_iter().skip(skip).take(page_size).collect())
    }
}
