//! Collection handles.
//!
//! - [`RawCollection`] - one physical collection of a live backend, raw documents in and out
//! - [`TypedCollection`] - a binding of a raw collection to a [`CollectionDescriptor`],
//!   encoding and decoding records, merging the default filter into every query,
//!   tracking an optional open cursor and allocating incremental identifiers
//!
//! # Example
//!
//! ```ignore
//! let mut users = db.collection::<TopUser>("top_users")?;
//!
//! users.save(&mut TopUser { user_id: Some("u1".into()), place: 3 }).await?;
//! let top = users.load(doc! { "place": { "$lte": 3 } }, FindOptions::default()).await?;
//!
//! let mut stream = users.cursor(doc! {}, CursorOptions::default()).await?;
//! let mut records = stream.next()?;
//! while let Some(user) = records.try_next().await? {
//!     println!("{:?}", user);
//! }
//! ```

use bson::{Bson, Document, doc};
use futures::{
    future::try_join_all,
    stream::{self, BoxStream, StreamExt},
};
use std::{fmt, marker::PhantomData, sync::Arc};
use tracing::{debug, warn};

use crate::{
    backend::{
        ClientSession, FindOneAndUpdateOptions, RawCursor, ReturnDocument, StoreBackend,
        UpdateOptions, UpdateOutcome,
    },
    descriptor::CollectionDescriptor,
    error::{ShardocError, ShardocResult},
    index::IndexSpec,
    query::{CursorType, FindOptions, merge_filter, reject_cursor, strip_extra, strip_projection},
    record::{ID_FIELD, Record, RecordExt},
};

/// Collection holding one counter document per logical collection using incremental identifiers.
pub const SEQUENCE_COLLECTION: &str = "_sequences";

/// One physical collection of a live backend.
///
/// Cloning is cheap: clones share the backend.
#[derive(Debug, Clone)]
pub struct RawCollection {
    name: String,
    backend: Arc<dyn StoreBackend>,
}

impl RawCollection {
    pub(crate) fn new(name: String, backend: Arc<dyn StoreBackend>) -> Self {
        Self { name, backend }
    }

    /// Returns the name of this collection.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The backend this collection lives on.
    pub fn backend(&self) -> &Arc<dyn StoreBackend> {
        &self.backend
    }

    pub async fn find(&self, filter: Document, options: FindOptions) -> ShardocResult<Box<dyn RawCursor>> {
        self.backend.find(&self.name, filter, options).await
    }

    pub async fn find_one(&self, filter: Document, options: FindOptions) -> ShardocResult<Option<Document>> {
        self.backend.find_one(&self.name, filter, options).await
    }

    pub async fn count_documents(&self, filter: Document) -> ShardocResult<u64> {
        self.backend.count_documents(&self.name, filter).await
    }

    pub async fn insert_one(&self, document: Document) -> ShardocResult<Bson> {
        self.backend.insert_one(&self.name, document).await
    }

    pub async fn insert_many(&self, documents: Vec<Document>, ordered: bool) -> ShardocResult<usize> {
        self.backend
            .insert_many(&self.name, documents, ordered)
            .await
    }

    pub async fn update_one(
        &self,
        filter: Document,
        update: Document,
        options: UpdateOptions,
        session: Option<&mut dyn ClientSession>,
    ) -> ShardocResult<UpdateOutcome> {
        self.backend
            .update_one(&self.name, filter, update, options, session)
            .await
    }

    pub async fn update_many(
        &self,
        filter: Document,
        update: Document,
        options: UpdateOptions,
        session: Option<&mut dyn ClientSession>,
    ) -> ShardocResult<UpdateOutcome> {
        self.backend
            .update_many(&self.name, filter, update, options, session)
            .await
    }

    pub async fn create_indexes(&self, indexes: &[IndexSpec]) -> ShardocResult<()> {
        self.backend.create_indexes(&self.name, indexes).await
    }
}

/// Options of [`TypedCollection::cursor`].
#[derive(Debug, Clone, Default)]
pub struct CursorOptions {
    /// Keep the cursor open after the last result.
    pub tailable: bool,
    /// Block fetches for a while waiting for new data. Only honoured with `tailable`.
    pub await_data: bool,
    /// Remaining find options. A projection is derived from the record type and is dropped.
    pub find: FindOptions,
}

/// Options of [`TypedCollection::store`].
#[derive(Default)]
pub struct StoreOptions<'a> {
    /// Insert a document when the filter matches nothing.
    pub upsert: bool,
    /// Filters selecting which array elements the update applies to.
    pub array_filters: Option<Vec<Document>>,
    /// Opt out of document-level validation.
    pub bypass_document_validation: bool,
    /// String comparison rules, as a collation document.
    pub collation: Option<Document>,
    /// Session to run the update in.
    pub session: Option<&'a mut dyn ClientSession>,
}

impl<'a> StoreOptions<'a> {
    fn split(self) -> (UpdateOptions, Option<&'a mut dyn ClientSession>) {
        (
            UpdateOptions {
                upsert: self.upsert,
                array_filters: self.array_filters,
                bypass_document_validation: self.bypass_document_validation,
                collation: self.collation,
            },
            self.session,
        )
    }
}

impl fmt::Debug for StoreOptions<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreOptions")
            .field("upsert", &self.upsert)
            .field("array_filters", &self.array_filters)
            .field("bypass_document_validation", &self.bypass_document_validation)
            .field("collation", &self.collation)
            .field("session", &self.session.is_some())
            .finish()
    }
}

/// Lazy, single-pass sequence of decoded records pulled from an open cursor.
pub type RecordStream<'a, R> = BoxStream<'a, ShardocResult<R>>;

/// A typed binding of one physical collection to one [`CollectionDescriptor`].
///
/// Each binding carries at most one open cursor. Streaming reads go through
/// [`cursor`](Self::cursor) and [`next`](Self::next); one-shot reads through
/// [`load`](Self::load) require that no cursor is open.
pub struct TypedCollection<R: Record> {
    collection: RawCollection,
    descriptor: Arc<CollectionDescriptor>,
    projection: Option<Document>,
    cursor: Option<Box<dyn RawCursor>>,
    _record: PhantomData<fn() -> R>,
}

impl<R: Record> fmt::Debug for TypedCollection<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypedCollection")
            .field("collection", &self.collection.name())
            .field("record", &self.descriptor.record_type().name())
            .field("cursor", &self.cursor.is_some())
            .finish()
    }
}

impl<R: Record> TypedCollection<R> {
    /// Binds `collection` to `descriptor`.
    ///
    /// Fails with [`ShardocError::Configuration`] when the descriptor declares another record type.
    pub fn bind(collection: RawCollection, descriptor: Arc<CollectionDescriptor>) -> ShardocResult<Self> {
        if !descriptor.record_type().is::<R>() {
            return Err(ShardocError::Configuration(format!(
                "collection `{}` holds {}, not {}",
                collection.name(),
                descriptor.record_type().name(),
                std::any::type_name::<R>()
            )));
        }

        Ok(Self {
            projection: descriptor.record_type().projection(),
            collection,
            descriptor,
            cursor: None,
            _record: PhantomData,
        })
    }

    /// Returns the physical collection name.
    pub fn collection_name(&self) -> &str {
        self.collection.name()
    }

    pub fn descriptor(&self) -> &CollectionDescriptor {
        &self.descriptor
    }

    /// The filter merged into every query of this binding.
    pub fn default_filter(&self) -> &Document {
        self.descriptor.default_filter()
    }

    /// The underlying raw collection.
    pub fn raw(&self) -> &RawCollection {
        &self.collection
    }

    fn decode(&self, raw: Document) -> ShardocResult<R> {
        R::decode(raw, self.descriptor.strict())
    }

    fn scoped(&self, filter: impl Into<Document>) -> Document {
        merge_filter(self.descriptor.default_filter(), filter.into())
    }

    /// Returns a new binding with a cursor open over the matching records.
    ///
    /// The original binding is left untouched.
    pub async fn cursor(&self, filter: impl Into<Document>, options: CursorOptions) -> ShardocResult<Self> {
        let CursorOptions { tailable, await_data, mut find } = options;

        strip_extra(&mut find, "cursor", "cursor");
        strip_projection(&mut find, "cursor");

        find.projection = self.projection.clone();
        find.cursor_type = match (tailable, await_data) {
            (true, true) => CursorType::TailableAwait,
            (true, false) => CursorType::Tailable,
            (false, _) => CursorType::NonTailable,
        };

        let cursor = self
            .collection
            .find(self.scoped(filter), find)
            .await
            .map_err(|e| ShardocError::State(format!("cannot open cursor on `{}`: {}", self.collection_name(), e)))?;

        Ok(Self {
            collection: self.collection.clone(),
            descriptor: Arc::clone(&self.descriptor),
            projection: self.projection.clone(),
            cursor: Some(cursor),
            _record: PhantomData,
        })
    }

    /// Streams the remaining records of the open cursor.
    ///
    /// The cursor is released once exhausted or on error, after which [`alive`](Self::alive)
    /// is false and another call fails with [`ShardocError::State`].
    pub fn next(&mut self) -> ShardocResult<RecordStream<'_, R>> {
        if self.cursor.is_none() {
            return Err(ShardocError::State("cursor not open, use cursor() first".into()));
        }

        Ok(stream::try_unfold(self, |binding| async move {
            let Some(cursor) = binding.cursor.as_mut() else {
                return Ok(None);
            };

            match cursor.advance().await {
                Ok(Some(raw)) => match binding.decode(raw) {
                    Ok(record) => Ok(Some((record, binding))),
                    Err(e) => {
                        binding.cursor = None;
                        Err(e)
                    }
                },
                Ok(None) => {
                    binding.cursor = None;
                    Ok(None)
                }
                Err(e) => {
                    binding.cursor = None;
                    Err(e)
                }
            }
        })
        .boxed())
    }

    /// Whether a cursor is open and has further pending results.
    pub fn alive(&self) -> bool {
        self.cursor.as_ref().is_some_and(|cursor| cursor.alive())
    }

    /// Reads every matching record at once.
    ///
    /// Fails with [`ShardocError::State`] while a cursor is open on this binding.
    pub async fn load(&self, filter: impl Into<Document>, options: FindOptions) -> ShardocResult<Vec<R>> {
        let mut options = options;

        reject_cursor(&options, "load")?;
        if self.cursor.is_some() {
            return Err(ShardocError::State("a cursor is open, use next() instead of load()".into()));
        }
        strip_projection(&mut options, "load");
        strip_extra(&mut options, "filter", "load");
        options.projection = self.projection.clone();

        let mut cursor = self.collection.find(self.scoped(filter), options).await?;
        let mut records = Vec::new();
        while let Some(raw) = cursor.advance().await? {
            records.push(self.decode(raw)?);
        }

        Ok(records)
    }

    /// Reads one record: the next one of the open cursor if any, else the first match.
    pub async fn load_one(&mut self, filter: impl Into<Document>, options: FindOptions) -> ShardocResult<Option<R>> {
        let mut options = options;

        reject_cursor(&options, "load_one")?;
        strip_projection(&mut options, "load_one");
        strip_extra(&mut options, "filter", "load_one");
        strip_extra(&mut options, "limit", "load_one");
        if options.limit.take().is_some() {
            warn!(option = "limit", operation = "load_one", "option is not permitted here and was dropped");
        }

        let raw = match self.cursor.as_mut() {
            Some(cursor) => match cursor.advance().await {
                Ok(Some(raw)) => Some(raw),
                Ok(None) => {
                    self.cursor = None;
                    None
                }
                Err(e) => {
                    self.cursor = None;
                    return Err(e);
                }
            },
            None => {
                options.projection = self.projection.clone();
                self.collection
                    .find_one(self.scoped(filter), options)
                    .await?
            }
        };

        raw.map(|raw| self.decode(raw)).transpose()
    }

    /// Returns raw matching documents.
    pub async fn find(&self, filter: impl Into<Document>, options: FindOptions) -> ShardocResult<Vec<Document>> {
        let mut cursor = self.collection.find(self.scoped(filter), options).await?;
        let mut documents = Vec::new();
        while let Some(raw) = cursor.advance().await? {
            documents.push(raw);
        }

        Ok(documents)
    }

    /// Returns the first raw matching document.
    pub async fn find_one(&self, filter: impl Into<Document>, options: FindOptions) -> ShardocResult<Option<Document>> {
        self.collection
            .find_one(self.scoped(filter), options)
            .await
    }

    /// Counts matching documents.
    pub async fn count(&self, filter: impl Into<Document>) -> ShardocResult<u64> {
        self.collection
            .count_documents(self.scoped(filter))
            .await
    }

    /// Inserts one record, allocating its identifier first when the collection
    /// uses incremental identifiers and the record has none.
    pub async fn save(&self, record: &mut R) -> ShardocResult<()> {
        if self.descriptor.incremental_ids() && record.id().is_none() {
            record.set_id(self.next_id().await?)?;
        }

        self.collection.insert_one(record.encode()?).await?;

        Ok(())
    }

    /// Inserts several records in one unordered bulk insert.
    ///
    /// Missing identifiers are allocated concurrently beforehand, in no particular
    /// order. A failing document does not prevent the others from being inserted.
    pub async fn save_many(&self, records: &mut [R]) -> ShardocResult<()> {
        if records.is_empty() {
            return Ok(());
        }

        if self.descriptor.incremental_ids() {
            try_join_all(
                records
                    .iter_mut()
                    .filter(|record| record.id().is_none())
                    .map(|record| async move {
                        let id = self.next_id().await?;
                        record.set_id(id)
                    }),
            )
            .await?;
        }

        let documents = records
            .iter()
            .map(|record| record.encode())
            .collect::<ShardocResult<Vec<_>>>()?;
        self.collection.insert_many(documents, false).await?;

        Ok(())
    }

    /// Replaces the fields of the first document matching `filter` with those of `record`.
    ///
    /// Returns the number of documents modified. A document inserted through
    /// `upsert` is not counted as modified.
    pub async fn store(&self, filter: impl Into<Document>, record: &R, options: StoreOptions<'_>) -> ShardocResult<u64> {
        let (options, session) = options.split();

        let outcome = self
            .collection
            .update_one(filter.into(), doc! { "$set": record.encode()? }, options, session)
            .await?;

        Ok(outcome.modified_count)
    }

    /// Stores each record over the document with its identifier, within `filter`.
    ///
    /// Records without an identifier update the first document matching `filter`.
    /// Returns the total number of documents modified.
    pub async fn store_many(
        &self,
        filter: impl Into<Document>,
        records: &[R],
        options: StoreOptions<'_>,
    ) -> ShardocResult<u64> {
        let filter = filter.into();
        let (options, mut session) = options.split();
        let mut modified = 0;

        for record in records {
            let mut scoped = filter.clone();
            if let Some(id) = record.id() {
                scoped.insert(ID_FIELD, id);
            }

            let outcome = self
                .collection
                .update_one(
                    scoped,
                    doc! { "$set": record.encode()? },
                    options.clone(),
                    session
                        .as_mut()
                        .map(|session| &mut **session as &mut dyn ClientSession),
                )
                .await?;
            modified += outcome.modified_count;
        }

        Ok(modified)
    }

    /// Allocates the next identifier from this collection's counter.
    ///
    /// The counter is incremented atomically by the database, so concurrent
    /// allocations never return the same value. Only valid on collections declared
    /// with incremental identifiers.
    pub async fn next_id(&self) -> ShardocResult<Bson> {
        if !self.descriptor.incremental_ids() {
            return Err(ShardocError::Configuration(format!(
                "collection `{}` is not declared with incremental identifiers",
                self.collection_name()
            )));
        }

        let key = self
            .descriptor
            .logical_name()
            .unwrap_or_else(|| self.collection.name());

        let counter = self
            .collection
            .backend()
            .find_one_and_update(
                SEQUENCE_COLLECTION,
                doc! { ID_FIELD: key },
                doc! { "$inc": { "seq": 1_i64 } },
                FindOneAndUpdateOptions {
                    upsert: true,
                    return_document: ReturnDocument::After,
                    projection: Some(doc! { "seq": 1, ID_FIELD: 0 }),
                },
            )
            .await?
            .ok_or_else(|| ShardocError::State(format!("sequence `{}` was not returned", key)))?;

        let seq = match counter.get("seq") {
            Some(Bson::Int64(seq)) => *seq,
            Some(Bson::Int32(seq)) => i64::from(*seq),
            other => {
                return Err(ShardocError::Decode(format!(
                    "sequence `{}` holds {:?}, expected an integer",
                    key, other
                )));
            }
        };
        debug!(collection = key, seq, "allocated identifier");

        Ok(Bson::Int64(seq))
    }
}
