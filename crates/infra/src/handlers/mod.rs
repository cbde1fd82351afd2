//! Command handlers and cached queries for the catalog.

mod books;

pub use books::{BookCommandHandler, BookPipelines, BookQueries, BookView};
