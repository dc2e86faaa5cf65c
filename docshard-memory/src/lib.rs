//! In-memory client backend for docshard.
//!
//! This crate provides an in-process implementation of the physical client
//! abstraction of `docshard-core`, for development and tests. It understands the
//! filter, update, sort and projection documents the typed layer sends, enforces
//! unique indexes and performs counter increments atomically.
//!
//! # Features
//!
//! - **Shared data per endpoint** - Connections to the same `host:port/database` see the same documents
//! - **Query support** - Comparison, membership and logical operators over dotted paths
//! - **Update support** - `$set`, `$unset`, `$inc` and `$setOnInsert`, with upserts
//! - **Index enforcement** - Unique and sparse indexes, duplicate identifiers
//!
//! # Quick Start
//!
//! ```ignore
//! use docshard::{prelude::*, memory::InMemoryConnector};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> ShardocResult<()> {
//!     let connector = Arc::new(InMemoryConnector::new());
//!     let mut db = Database::new(definition, "mongodb://127.0.0.1/Example", connector)?;
//!     db.start().await?;
//!
//!     let users = db.collection::<TopUser>("top_users")?;
//!     users.save(&mut TopUser { user_id: "u1".into(), place: 1 }).await?;
//!
//!     db.stop().await
//! }
//! ```

#[allow(unused_extern_crates)]
extern crate self as docshard_memory;

pub mod evaluator;
pub mod store;

pub use store::{DEFAULT_DATABASE, InMemoryConnector, InMemoryStore, MemoryCursor, MemorySession};
