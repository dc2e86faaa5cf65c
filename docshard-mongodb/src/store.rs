use async_trait::async_trait;
use bson::{Bson, Document, doc};
use mongodb::{
    Client, Collection as MongoCollection, Cursor, IndexModel,
    ClientSession as DriverSession,
    options::{
        ClientOptions, Collation, CursorType as DriverCursorType, FindOneAndUpdateOptions as DriverFindOneAndUpdateOptions,
        FindOneOptions, FindOptions as DriverFindOptions, Hint, IndexOptions, ReturnDocument as DriverReturnDocument,
        UpdateOptions as DriverUpdateOptions,
    },
};
use std::{
    any::Any,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};
use tracing::debug;

use docshard_core::{
    backend::{
        ClientSession, Connector, FindOneAndUpdateOptions, RawCursor, ReturnDocument, StoreBackend,
        UpdateOptions, UpdateOutcome,
    },
    error::{ShardocError, ShardocResult},
    index::IndexSpec,
    query::{CursorType, FindOptions},
};

/// Database name used when a URI names none.
pub const DEFAULT_DATABASE: &str = "test";

fn driver(err: mongodb::error::Error) -> ShardocError {
    ShardocError::backend(err)
}

fn closed() -> ShardocError {
    ShardocError::State("client has been shut down".into())
}

/// [`StoreBackend`] over one database of a MongoDB client.
///
/// Driver errors are passed through as [`ShardocError::Backend`] and can be
/// downcast to [`mongodb::error::Error`].
#[derive(Debug, Clone)]
pub struct MongoDbStore {
    client: Client,
    database: String,
    closed: Arc<AtomicBool>,
}

impl MongoDbStore {
    pub fn new(client: Client, database: impl Into<String>) -> Self {
        Self {
            client,
            database: database.into(),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// The driver client.
    pub fn client(&self) -> &Client {
        &self.client
    }

    fn get_collection(&self, collection_name: &str) -> ShardocResult<MongoCollection<Document>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(closed());
        }

        Ok(self.client.database(&self.database).collection(collection_name))
    }

    async fn update(
        &self,
        collection: &str,
        filter: Document,
        update: Document,
        options: UpdateOptions,
        session: Option<&mut dyn ClientSession>,
        multi: bool,
    ) -> ShardocResult<UpdateOutcome> {
        let collection = self.get_collection(collection)?;
        let options = update_options(options)?;

        let result = match (multi, session) {
            (false, None) => collection.update_one(filter, update).with_options(options).await,
            (false, Some(session)) => {
                collection
                    .update_one(filter, update)
                    .with_options(options)
                    .session(MongoSession::from_dyn(session)?)
                    .await
            }
            (true, None) => collection.update_many(filter, update).with_options(options).await,
            (true, Some(session)) => {
                collection
                    .update_many(filter, update)
                    .with_options(options)
                    .session(MongoSession::from_dyn(session)?)
                    .await
            }
        }
        .map_err(driver)?;

        Ok(UpdateOutcome {
            matched_count: result.matched_count,
            modified_count: result.modified_count,
            upserted_id: result.upserted_id,
        })
    }
}

fn cursor_type(cursor_type: CursorType) -> DriverCursorType {
    match cursor_type {
        CursorType::NonTailable => DriverCursorType::NonTailable,
        CursorType::Tailable => DriverCursorType::Tailable,
        CursorType::TailableAwait => DriverCursorType::TailableAwait,
    }
}

/// Find options understood by the driver. Unknown `extra` names are ignored.
fn find_options(options: FindOptions) -> DriverFindOptions {
    let mut driver_options = DriverFindOptions::default();

    driver_options.sort = options.sort_document();
    driver_options.projection = options.projection;
    driver_options.skip = options.skip;
    driver_options.limit = options.limit;
    driver_options.cursor_type = Some(cursor_type(options.cursor_type));

    for (name, value) in options.extra {
        match (name.as_str(), value) {
            ("batchSize", Bson::Int32(size)) => driver_options.batch_size = u32::try_from(size).ok(),
            ("batchSize", Bson::Int64(size)) => driver_options.batch_size = u32::try_from(size).ok(),
            ("allowDiskUse", Bson::Boolean(allow)) => driver_options.allow_disk_use = Some(allow),
            ("maxTimeMS", Bson::Int32(ms)) => {
                driver_options.max_time = u64::try_from(ms).ok().map(Duration::from_millis)
            }
            ("maxTimeMS", Bson::Int64(ms)) => {
                driver_options.max_time = u64::try_from(ms).ok().map(Duration::from_millis)
            }
            ("hint", Bson::String(index)) => driver_options.hint = Some(Hint::Name(index)),
            ("hint", Bson::Document(keys)) => driver_options.hint = Some(Hint::Keys(keys)),
            (name, _) => debug!(option = name, "ignoring find option"),
        }
    }

    driver_options
}

fn find_one_options(options: FindOptions) -> FindOneOptions {
    let mut driver_options = FindOneOptions::default();

    driver_options.sort = options.sort_document();
    driver_options.projection = options.projection;
    driver_options.skip = options.skip;

    driver_options
}

fn update_options(options: UpdateOptions) -> ShardocResult<DriverUpdateOptions> {
    let mut driver_options = DriverUpdateOptions::default();

    driver_options.upsert = Some(options.upsert);
    driver_options.array_filters = options.array_filters;
    driver_options.bypass_document_validation = Some(options.bypass_document_validation);
    driver_options.collation = options
        .collation
        .map(bson::deserialize_from_document::<Collation>)
        .transpose()
        .map_err(|e| ShardocError::Configuration(format!("invalid collation: {}", e)))?;

    Ok(driver_options)
}

fn index_model(index: &IndexSpec) -> IndexModel {
    IndexModel::builder()
        .keys(index.key_document())
        .options(
            IndexOptions::builder()
                .unique(index.is_unique())
                .sparse(index.is_sparse())
                .name(index.index_name().map(str::to_string))
                .build(),
        )
        .build()
}

#[async_trait]
impl StoreBackend for MongoDbStore {
    fn database_name(&self) -> &str {
        &self.database
    }

    async fn find(&self, collection: &str, filter: Document, options: FindOptions) -> ShardocResult<Box<dyn RawCursor>> {
        let cursor = self
            .get_collection(collection)?
            .find(filter)
            .with_options(find_options(options))
            .await
            .map_err(driver)?;

        Ok(Box::new(MongoCursor {
            cursor: Mutex::new(cursor),
            exhausted: false,
            closed: Arc::clone(&self.closed),
        }))
    }

    async fn find_one(&self, collection: &str, filter: Document, options: FindOptions) -> ShardocResult<Option<Document>> {
        self.get_collection(collection)?
            .find_one(filter)
            .with_options(find_one_options(options))
            .await
            .map_err(driver)
    }

    async fn count_documents(&self, collection: &str, filter: Document) -> ShardocResult<u64> {
        self.get_collection(collection)?
            .count_documents(filter)
            .await
            .map_err(driver)
    }

    async fn insert_one(&self, collection: &str, document: Document) -> ShardocResult<Bson> {
        Ok(self
            .get_collection(collection)?
            .insert_one(document)
            .await
            .map_err(driver)?
            .inserted_id)
    }

    async fn insert_many(&self, collection: &str, documents: Vec<Document>, ordered: bool) -> ShardocResult<usize> {
        if documents.is_empty() {
            return Ok(0);
        }

        Ok(self
            .get_collection(collection)?
            .insert_many(documents)
            .ordered(ordered)
            .await
            .map_err(driver)?
            .inserted_ids
            .len())
    }

    async fn update_one(
        &self,
        collection: &str,
        filter: Document,
        update: Document,
        options: UpdateOptions,
        session: Option<&mut dyn ClientSession>,
    ) -> ShardocResult<UpdateOutcome> {
        self.update(collection, filter, update, options, session, false).await
    }

    async fn update_many(
        &self,
        collection: &str,
        filter: Document,
        update: Document,
        options: UpdateOptions,
        session: Option<&mut dyn ClientSession>,
    ) -> ShardocResult<UpdateOutcome> {
        self.update(collection, filter, update, options, session, true).await
    }

    async fn find_one_and_update(
        &self,
        collection: &str,
        filter: Document,
        update: Document,
        options: FindOneAndUpdateOptions,
    ) -> ShardocResult<Option<Document>> {
        let mut driver_options = DriverFindOneAndUpdateOptions::default();
        driver_options.upsert = Some(options.upsert);
        driver_options.projection = options.projection;
        driver_options.return_document = Some(match options.return_document {
            ReturnDocument::Before => DriverReturnDocument::Before,
            ReturnDocument::After => DriverReturnDocument::After,
        });

        self.get_collection(collection)?
            .find_one_and_update(filter, update)
            .with_options(driver_options)
            .await
            .map_err(driver)
    }

    async fn create_indexes(&self, collection: &str, indexes: &[IndexSpec]) -> ShardocResult<()> {
        if indexes.is_empty() {
            return Ok(());
        }

        let result = self
            .get_collection(collection)?
            .create_indexes(indexes.iter().map(index_model))
            .await
            .map_err(driver)?;
        debug!(collection, indexes = ?result.index_names, "created indexes");

        Ok(())
    }

    async fn start_session(&self) -> ShardocResult<Box<dyn ClientSession>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(closed());
        }

        let session = self.client.start_session().await.map_err(driver)?;

        Ok(Box::new(MongoSession { session: Mutex::new(session) }))
    }

    async fn shutdown(&self) -> ShardocResult<()> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.client.clone().shutdown().await;
        }

        Ok(())
    }
}

/// [`RawCursor`] over a driver cursor.
///
/// The cursor is alive while the driver holds buffered documents or a server
/// cursor with further batches.
#[derive(Debug)]
pub struct MongoCursor {
    // advanced through `get_mut`, locked only to read `has_next`
    cursor: Mutex<Cursor<Document>>,
    exhausted: bool,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl RawCursor for MongoCursor {
    async fn advance(&mut self) -> ShardocResult<Option<Document>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(closed());
        }
        if self.exhausted {
            return Ok(None);
        }

        let cursor = self
            .cursor
            .get_mut()
            .map_err(|_| ShardocError::State("cursor is poisoned".into()))?;

        if !cursor.advance().await.map_err(driver)? {
            self.exhausted = true;
            return Ok(None);
        }

        cursor.deserialize_current().map(Some).map_err(driver)
    }

    fn alive(&self) -> bool {
        !self.exhausted
            && self
                .cursor
                .lock()
                .map(|cursor| cursor.has_next())
                .unwrap_or(false)
    }
}

/// [`ClientSession`] over a driver session.
#[derive(Debug)]
pub struct MongoSession {
    // only reached through `get_mut`, never locked
    session: Mutex<DriverSession>,
}

impl MongoSession {
    fn driver_session(&mut self) -> ShardocResult<&mut DriverSession> {
        self.session
            .get_mut()
            .map_err(|_| ShardocError::State("session is poisoned".into()))
    }

    fn from_dyn(session: &mut dyn ClientSession) -> ShardocResult<&mut DriverSession> {
        session
            .as_any_mut()
            .downcast_mut::<MongoSession>()
            .ok_or_else(|| ShardocError::State("session was not started by a MongoDB client".into()))?
            .driver_session()
    }
}

#[async_trait]
impl ClientSession for MongoSession {
    async fn start_transaction(&mut self) -> ShardocResult<()> {
        self.driver_session()?.start_transaction().await.map_err(driver)
    }

    async fn commit_transaction(&mut self) -> ShardocResult<()> {
        self.driver_session()?.commit_transaction().await.map_err(driver)
    }

    async fn abort_transaction(&mut self) -> ShardocResult<()> {
        self.driver_session()?.abort_transaction().await.map_err(driver)
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Opens [`MongoDbStore`] handles, checking reachability with a `ping`.
///
/// The database is the one named in the URI path, else [`DEFAULT_DATABASE`].
#[derive(Debug, Default, Clone)]
pub struct MongoConnector;

impl MongoConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for MongoConnector {
    async fn connect(&self, uri: &str) -> ShardocResult<Arc<dyn StoreBackend>> {
        let options = ClientOptions::parse(uri)
            .await
            .map_err(|e| ShardocError::Connection(e.to_string()))?;
        let database = options
            .default_database
            .clone()
            .unwrap_or_else(|| DEFAULT_DATABASE.to_string());

        let client = Client::with_options(options).map_err(|e| ShardocError::Connection(e.to_string()))?;
        client
            .database(&database)
            .run_command(doc! { "ping": 1 })
            .await
            .map_err(|e| ShardocError::Connection(e.to_string()))?;
        debug!(database = %database, "connected to MongoDB");

        Ok(Arc::new(MongoDbStore::new(client, database)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docshard_core::{index::IndexKind, query::SortDirection};

    #[test]
    fn find_options_translate_known_extras() {
        let options = FindOptions::builder()
            .sort("place", SortDirection::Desc)
            .skip(2)
            .limit(5)
            .projection(doc! { "place": 1 })
            .cursor_type(CursorType::TailableAwait)
            .extra("batchSize", 50)
            .extra("allowDiskUse", true)
            .extra("maxTimeMS", 1500_i64)
            .extra("hint", "place_-1")
            .extra("comment", "dropped")
            .build();

        let translated = find_options(options);
        assert_eq!(translated.sort, Some(doc! { "place": -1 }));
        assert_eq!(translated.skip, Some(2));
        assert_eq!(translated.limit, Some(5));
        assert_eq!(translated.projection, Some(doc! { "place": 1 }));
        assert!(matches!(translated.cursor_type, Some(DriverCursorType::TailableAwait)));
        assert_eq!(translated.batch_size, Some(50));
        assert_eq!(translated.allow_disk_use, Some(true));
        assert_eq!(translated.max_time, Some(Duration::from_millis(1500)));
        assert_eq!(translated.hint, Some(Hint::Name("place_-1".into())));
    }

    #[test]
    fn find_options_ignore_out_of_range_and_mistyped_extras() {
        let options = FindOptions::builder()
            .extra("batchSize", -1)
            .extra("maxTimeMS", "soon")
            .build();

        let translated = find_options(options);
        assert_eq!(translated.batch_size, None);
        assert_eq!(translated.max_time, None);
        assert!(matches!(translated.cursor_type, Some(DriverCursorType::NonTailable)));
    }

    #[test]
    fn update_options_parse_collation() {
        let options = update_options(UpdateOptions {
            upsert: true,
            collation: Some(doc! { "locale": "en" }),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(options.upsert, Some(true));
        assert_eq!(options.collation.map(|collation| collation.locale), Some("en".to_string()));

        let invalid = update_options(UpdateOptions {
            collation: Some(doc! { "strength": 2 }),
            ..Default::default()
        });
        assert!(matches!(invalid, Err(ShardocError::Configuration(_))));
    }

    #[test]
    fn index_models_carry_keys_and_flags() {
        let index = IndexSpec::descending("place")
            .then("name", IndexKind::Ascending)
            .unique(true)
            .name("by_place");

        let model = index_model(&index);
        assert_eq!(model.keys, doc! { "place": -1, "name": 1 });

        let options = model.options.unwrap();
        assert_eq!(options.unique, Some(true));
        assert_eq!(options.sparse, Some(false));
        assert_eq!(options.name.as_deref(), Some("by_place"));
    }
}
