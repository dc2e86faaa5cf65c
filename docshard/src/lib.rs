//! Main docshard crate: typed document collections over sharded document databases.
//!
//! This crate is the primary entry point for users of docshard. It re-exports the
//! core types from the sub-crates and provides access to the client backends.
//!
//! # Features
//!
//! - **Typed records** - Serde structs mapped to raw documents, with strict or loose decoding
//! - **Declarative collections** - Indexes, default filters and incremental identifiers per collection
//! - **Sharding** - One logical database fanned out over several endpoints, routed by key
//! - **Multiple backends** - In-memory and MongoDB clients behind one capability interface
//!
//! # Quick Start
//!
//! ```ignore
//! use docshard::{prelude::*, memory::InMemoryConnector};
//! use serde::{Serialize, Deserialize};
//! use std::sync::Arc;
//!
//! #[derive(Debug, Clone, Serialize, Deserialize, Record)]
//! pub struct TopUser {
//!     #[serde(rename = "_id")]
//!     pub user_id: String,
//!     pub place: i32,
//! }
//!
//! #[tokio::main]
//! async fn main() -> ShardocResult<()> {
//!     let definition = DatabaseDefinition::builder()
//!         .collection(
//!             "top_users",
//!             CollectionDescriptor::builder::<TopUser>()
//!                 .name("TopUsers")
//!                 .index(IndexSpec::descending("place"))
//!                 .build()?,
//!         )
//!         .build()?;
//!
//!     let mut db = Database::new(
//!         definition,
//!         "mongodb://127.0.0.1/Example",
//!         Arc::new(InMemoryConnector::new()),
//!     )?;
//!     db.start().await?;
//!
//!     let users = db.collection::<TopUser>("top_users")?;
//!     users.save(&mut TopUser { user_id: "u1".into(), place: 1 }).await?;
//!
//!     let top = users
//!         .load(Filter::lte("place", 3), FindOptions::builder().sort("place", SortDirection::Asc).build())
//!         .await?;
//!     println!("Top users: {:?}", top);
//!
//!     db.stop().await
//! }
//! ```
//!
//! # Sharding
//!
//! A registry built from a list of endpoints is sharded. Integer keys address a
//! shard by position, other keys are hashed.
//!
//! ```ignore
//! let mut db = Database::new(
//!     definition,
//!     DatabaseConfig::sharded(["mongodb://10.0.0.1/Example", "mongodb://10.0.0.2/Example"]),
//!     connector,
//! )?;
//! db.start().await?;
//!
//! let users = db.shard("user-42")?.collection::<TopUser>("top_users")?;
//! let first = db.shard(0)?.collection::<TopUser>("top_users")?;
//! ```
//!
//! # Backends
//!
//! - [`memory`] - In-process client for development and testing
//! - [`mongodb`] - MongoDB client (requires `mongodb` feature)

#[allow(unused_extern_crates)]
extern crate self as docshard;

pub mod prelude;

pub use docshard_core::{backend, collection, connection, database, descriptor, error, index, query, record};
pub use docshard_macros::Record;

// Re-export BSON types for convenience
pub use bson;

/// In-memory client backend.
pub mod memory {
    pub use docshard_memory::{InMemoryConnector, InMemoryStore, MemoryCursor, MemorySession};
}

/// MongoDB client backend.
///
/// This module is only available when the `mongodb` feature is enabled.
#[cfg(feature = "mongodb")]
pub mod mongodb {
    pub use docshard_mongodb::{MongoConnector, MongoCursor, MongoDbStore, MongoSession};
}
