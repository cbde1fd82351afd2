//! Infrastructure layer: storage, transactional outbox and relay, idempotent
//! consumers, caching and the command pipeline.

pub mod cache;
pub mod config;
pub mod consumer;
pub mod db;
pub mod handlers;
pub mod outbox;
pub mod pipeline;
pub mod retry;
pub mod storage;
