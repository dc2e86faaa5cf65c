//! A typed document-collection layer over asynchronous document database clients.
//!
//! This crate is the core of the docshard project and provides:
//!
//! - **Records** ([`record`]) - The codec contract between typed records and raw documents
//! - **Collection descriptors** ([`descriptor`]) - Declarative metadata: indexes, default filter, strictness, identifier policy
//! - **Index specifications** ([`index`]) - Index shapes ensured when a collection is resolved
//! - **Query options and filters** ([`query`]) - Find options, filter merging and a filter expression builder
//! - **Client abstraction** ([`backend`]) - The minimal capability set required from a physical client
//! - **Collections** ([`collection`]) - Raw and typed collection handles
//! - **Connections** ([`connection`]) - Endpoint configuration and connection lifecycle
//! - **Registries** ([`database`]) - Database definitions, startup and shard routing
//! - **Error handling** ([`error`]) - Error taxonomy and result types
//!
//! # Example
//!
//! ```ignore
//! use docshard::prelude::*;
//! use serde::{Serialize, Deserialize};
//!
//! #[derive(Debug, Clone, Serialize, Deserialize, Record)]
//! pub struct TopUser {
//!     #[serde(rename = "_id")]
//!     pub user_id: String,
//!     pub place: i32,
//! }
//!
//! let definition = DatabaseDefinition::builder()
//!     .collection("top_users", CollectionDescriptor::builder::<TopUser>().name("TopUsers").build()?)
//!     .build()?;
//! ```

#[allow(unused_extern_crates)]
extern crate self as docshard_core;

pub mod backend;
pub mod collection;
pub mod connection;
pub mod database;
pub mod descriptor;
pub mod error;
pub mod index;
pub mod query;
pub mod record;

pub use bson;
