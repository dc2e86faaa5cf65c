//! MongoDB client backend for docshard.
//!
//! This crate implements the physical client abstraction of `docshard-core` over
//! the official asynchronous MongoDB driver. Filters, updates and index key
//! documents are handed to the server as they are.
//!
//! To use this backend, include the `mongodb` feature in your `Cargo.toml`:
//!
//! ```toml
//! [dependencies]
//! docshard = { version = "x.y.z", features = ["mongodb"] }
//! ```
//!
//! # Connection
//!
//! [`MongoConnector`] opens one client per endpoint URI, and checks the server
//! answers a `ping` before the connection counts as started. The database is
//! taken from the URI path.
//!
//! # Example
//!
//! ```ignore
//! use docshard::{prelude::*, mongodb::MongoConnector};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> ShardocResult<()> {
//!     let mut db = Database::new(
//!         definition,
//!         DatabaseConfig::sharded(["mongodb://10.0.0.1/Example", "mongodb://10.0.0.2/Example"]),
//!         Arc::new(MongoConnector::new()),
//!     )?;
//!     db.start().await?;
//!
//!     let users = db.shard("user-42")?.collection::<TopUser>("top_users")?;
//!     println!("{}", users.count(doc! {}).await?);
//!
//!     db.stop().await
//! }
//! ```

#[allow(unused_extern_crates)]
extern crate self as docshard_mongodb;

pub mod store;

pub use store::{DEFAULT_DATABASE, MongoConnector, MongoCursor, MongoDbStore, MongoSession};
