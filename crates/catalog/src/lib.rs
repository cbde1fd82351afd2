//! Catalog domain module.
//!
//! Business rules for books, implemented as deterministic domain logic (no IO,
//! no storage). Handlers in `folio-infra` persist the aggregate and relay the
//! events it records.

pub mod book;

pub use book::{
    BOOK_AGGREGATE_TYPE, BOOKS_COLLECTION, Book, BookCreated, BookDeleted, BookEvent, BookId,
    BookReceipt, BookUpdated, CreateBook, DeleteBook, UpdateBook,
};
