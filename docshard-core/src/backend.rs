//! Physical client abstraction.
//!
//! This module defines the minimal capability set the typed layer needs from an
//! underlying document database client. A backend crate implements:
//!
//! - [`StoreBackend`]: query, insert, update, atomic counters, index creation and
//!   sessions against one logical database
//! - [`RawCursor`]: the "fetch next, has more" cursor protocol
//! - [`ClientSession`]: passthrough session and transaction handle
//! - [`Connector`]: opens a [`StoreBackend`] from a connection URI
//!
//! Nothing else of the client surface is exposed through the abstraction.

use async_trait::async_trait;
use bson::{Bson, Document};
use std::{any::Any, fmt::Debug, sync::Arc};

use crate::{error::ShardocResult, index::IndexSpec, query::FindOptions};

/// An open cursor over raw documents.
///
/// Cursors are single-pass and are advanced by one task at a time.
#[async_trait]
pub trait RawCursor: Send + Sync + Debug {
    /// Fetches the next document, `None` once the cursor is exhausted.
    async fn advance(&mut self) -> ShardocResult<Option<Document>>;

    /// Whether the server reports further pending results.
    fn alive(&self) -> bool;
}

/// A client session, passed through to session-aware operations.
#[async_trait]
pub trait ClientSession: Send + Sync + Debug {
    async fn start_transaction(&mut self) -> ShardocResult<()>;
    async fn commit_transaction(&mut self) -> ShardocResult<()>;
    async fn abort_transaction(&mut self) -> ShardocResult<()>;

    /// Gives backends access to their concrete session type.
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Options of a single- or multi-document update.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdateOptions {
    /// Insert a document when nothing matches.
    pub upsert: bool,
    /// Filters selecting which array elements the update applies to.
    pub array_filters: Option<Vec<Document>>,
    /// Opt out of document-level validation.
    pub bypass_document_validation: bool,
    /// String comparison rules, as a collation document.
    pub collation: Option<Document>,
}

/// The result of an update.
///
/// A document inserted by an upsert is reported through `upserted_id` and is not
/// counted in `matched_count` or `modified_count`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdateOutcome {
    pub matched_count: u64,
    pub modified_count: u64,
    pub upserted_id: Option<Bson>,
}

/// Which version of the document `find_one_and_update` returns.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ReturnDocument {
    #[default]
    Before,
    After,
}

/// Options of [`StoreBackend::find_one_and_update`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FindOneAndUpdateOptions {
    pub upsert: bool,
    pub return_document: ReturnDocument,
    pub projection: Option<Document>,
}

/// Capability interface over one logical database of an underlying client.
///
/// Implementations must be safe to share between concurrently running tasks:
/// every typed collection bound through a connection holds the same backend.
#[async_trait]
pub trait StoreBackend: Send + Sync + Debug {
    /// Name of the logical database this backend operates on.
    fn database_name(&self) -> &str;

    /// Opens a cursor over the documents matching `filter`.
    async fn find(
        &self,
        collection: &str,
        filter: Document,
        options: FindOptions,
    ) -> ShardocResult<Box<dyn RawCursor>>;

    /// Returns the first document matching `filter`.
    async fn find_one(
        &self,
        collection: &str,
        filter: Document,
        options: FindOptions,
    ) -> ShardocResult<Option<Document>>;

    /// Counts the documents matching `filter`.
    async fn count_documents(&self, collection: &str, filter: Document) -> ShardocResult<u64>;

    /// Inserts one document, returning its identifier.
    async fn insert_one(&self, collection: &str, document: Document) -> ShardocResult<Bson>;

    /// Inserts several documents, returning how many were inserted.
    ///
    /// When `ordered` is false, a failing document does not stop the others; the
    /// failures are reported together once the batch completes.
    async fn insert_many(
        &self,
        collection: &str,
        documents: Vec<Document>,
        ordered: bool,
    ) -> ShardocResult<usize>;

    /// Updates the first document matching `filter`.
    async fn update_one(
        &self,
        collection: &str,
        filter: Document,
        update: Document,
        options: UpdateOptions,
        session: Option<&mut dyn ClientSession>,
    ) -> ShardocResult<UpdateOutcome>;

    /// Updates every document matching `filter`.
    async fn update_many(
        &self,
        collection: &str,
        filter: Document,
        update: Document,
        options: UpdateOptions,
        session: Option<&mut dyn ClientSession>,
    ) -> ShardocResult<UpdateOutcome>;

    /// Atomically updates one document and returns it.
    async fn find_one_and_update(
        &self,
        collection: &str,
        filter: Document,
        update: Document,
        options: FindOneAndUpdateOptions,
    ) -> ShardocResult<Option<Document>>;

    /// Ensures the given indexes exist.
    async fn create_indexes(&self, collection: &str, indexes: &[IndexSpec]) -> ShardocResult<()>;

    /// Starts a client session.
    async fn start_session(&self) -> ShardocResult<Box<dyn ClientSession>>;

    /// Closes the client. Later operations fail.
    async fn shutdown(&self) -> ShardocResult<()>;
}

/// Opens backends from connection URIs.
#[async_trait]
pub trait Connector: Send + Sync + Debug {
    /// Opens a client against `uri`.
    ///
    /// Fails with [`ShardocError::Connection`](crate::error::ShardocError::Connection)
    /// when the URI is malformed or the endpoint cannot be reached.
    async fn connect(&self, uri: &str) -> ShardocResult<Arc<dyn StoreBackend>>;
}
