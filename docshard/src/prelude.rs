//! Convenient re-exports of commonly used types from docshard.
//!
//! ```ignore
//! use docshard::prelude::*;
//! ```
//!
//! This provides access to:
//! - Records and the `Record` derive
//! - Collection descriptors and index specifications
//! - Typed collections, find options and filters
//! - Connections, registries and shard routing
//! - Error types

pub use docshard_core::{
    backend::{ClientSession, Connector, RawCursor, StoreBackend, UpdateOptions, UpdateOutcome},
    collection::{CursorOptions, RawCollection, RecordStream, StoreOptions, TypedCollection},
    connection::{Connection, DatabaseConfig, EndpointConfig, HostPortConfig},
    database::{
        CollectionSet, Database, DatabaseDefinition, DatabaseState, Layout, Shard, ShardKey, ShardRouter,
    },
    descriptor::CollectionDescriptor,
    error::{ShardocError, ShardocResult},
    index::{IndexKind, IndexSpec},
    query::{CursorType, Expr, FieldOp, Filter, FindOptions, QueryVisitor, Sort, SortDirection},
    record::{Record, RecordExt},
};
pub use docshard_macros::Record;

pub use bson::{Bson, Document, doc};
