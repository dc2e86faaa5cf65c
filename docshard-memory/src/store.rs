//! In-memory storage implementation of the physical client abstraction.
//!
//! Documents live in insertion-ordered maps keyed by their identifier, guarded by
//! async-aware read-write locks. Every operation that reads and writes the same
//! collection (updates, counters, upserts) runs under one write lock, which makes
//! it atomic with respect to concurrent tasks.

use async_trait::async_trait;
use bson::{Bson, Document, oid::ObjectId};
use indexmap::IndexMap;
use mea::rwlock::RwLock;
use std::{
    any::Any,
    collections::{HashMap, HashSet, VecDeque},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};
use tracing::debug;
use url::Url;

use docshard_core::{
    backend::{
        ClientSession, Connector, FindOneAndUpdateOptions, RawCursor, ReturnDocument, StoreBackend,
        UpdateOptions, UpdateOutcome,
    },
    error::{ShardocError, ShardocResult},
    index::IndexSpec,
    query::FindOptions,
    record::ID_FIELD,
};

use crate::evaluator::{
    Comparable, apply_update, lookup, matches, project, sort_documents, upsert_seed,
};

/// Database name used when a URI names none.
pub const DEFAULT_DATABASE: &str = "test";

#[derive(Debug, Default)]
struct CollectionData {
    documents: IndexMap<String, Document>,
    indexes: Vec<IndexSpec>,
}

type DatabaseMap = HashMap<String, CollectionData>;

/// Canonical map key of an identifier. Numeric identifiers of different widths
/// share a key when they compare equal; integers are keyed exactly.
fn id_key(id: &Bson) -> String {
    match id {
        Bson::Int32(n) => format!("i:{}", n),
        Bson::Int64(n) => format!("i:{}", n),
        Bson::Double(n) if n.fract() == 0.0 && *n >= i64::MIN as f64 && *n < i64::MAX as f64 => {
            format!("i:{}", *n as i64)
        }
        Bson::Double(n) => format!("d:{}", n),
        Bson::String(s) => format!("s:{}", s),
        Bson::ObjectId(oid) => format!("o:{}", oid.to_hex()),
        other => format!("x:{}", other),
    }
}

/// Values of the indexed fields of `document`, `None` when a sparse index skips it.
fn index_key<'a>(document: &'a Document, index: &IndexSpec) -> Option<Vec<Option<&'a Bson>>> {
    let values = index
        .keys()
        .iter()
        .map(|(field, _)| lookup(document, field))
        .collect::<Vec<_>>();

    if index.is_sparse() && values.iter().all(Option::is_none) {
        return None;
    }

    Some(values)
}

fn comparable(value: Option<&Bson>) -> Comparable<'_> {
    value.map(Comparable::from).unwrap_or(Comparable::Null)
}

fn same_key(left: &[Option<&Bson>], right: &[Option<&Bson>]) -> bool {
    left.iter()
        .zip(right)
        .all(|(l, r)| comparable(*l) == comparable(*r))
}

fn describe_key(index: &IndexSpec, values: &[Option<&Bson>]) -> String {
    index
        .keys()
        .iter()
        .zip(values)
        .map(|((field, _), value)| match value {
            Some(value) => format!("{}: {}", field, value),
            None => format!("{}: null", field),
        })
        .collect::<Vec<_>>()
        .join(", ")
}

impl CollectionData {
    /// Fails when `document` would break a unique index. `skip` names the stored
    /// document being replaced.
    fn check_unique(&self, collection: &str, document: &Document, skip: Option<&str>) -> ShardocResult<()> {
        for index in self.indexes.iter().filter(|index| index.is_unique()) {
            let Some(candidate) = index_key(document, index) else {
                continue;
            };

            let clash = self
                .documents
                .iter()
                .filter(|(key, _)| Some(key.as_str()) != skip)
                .filter_map(|(_, stored)| index_key(stored, index))
                .any(|existing| same_key(&existing, &candidate));

            if clash {
                return Err(ShardocError::DuplicateKey(
                    format!("{{ {} }}", describe_key(index, &candidate)),
                    collection.to_string(),
                ));
            }
        }

        Ok(())
    }

    fn insert(&mut self, collection: &str, mut document: Document) -> ShardocResult<Bson> {
        let id = match document.get(ID_FIELD) {
            Some(id) => id.clone(),
            None => {
                let id = Bson::ObjectId(ObjectId::new());
                document.insert(ID_FIELD, id.clone());
                id
            }
        };

        let key = id_key(&id);
        if self.documents.contains_key(&key) {
            return Err(ShardocError::DuplicateKey(
                format!("{{ _id: {} }}", id),
                collection.to_string(),
            ));
        }
        self.check_unique(collection, &document, None)?;
        self.documents.insert(key, document);

        Ok(id)
    }

    fn matching_keys(&self, filter: &Document, limit: Option<usize>) -> ShardocResult<Vec<String>> {
        let mut keys = Vec::new();
        for (key, document) in &self.documents {
            if limit.is_some_and(|limit| keys.len() >= limit) {
                break;
            }
            if matches(document, filter)? {
                keys.push(key.clone());
            }
        }

        Ok(keys)
    }

    /// Applies `update` to the stored document `key`, returning whether it changed.
    fn update(&mut self, collection: &str, key: &str, update: &Document) -> ShardocResult<bool> {
        let Some(current) = self.documents.get(key) else {
            return Ok(false);
        };

        let mut updated = current.clone();
        apply_update(&mut updated, update, false)?;
        if &updated == current {
            return Ok(false);
        }

        self.check_unique(collection, &updated, Some(key))?;
        self.documents.insert(key.to_string(), updated);

        Ok(true)
    }

    fn upsert(&mut self, collection: &str, filter: &Document, update: &Document) -> ShardocResult<Bson> {
        let mut document = upsert_seed(filter)?;
        apply_update(&mut document, update, true)?;
        self.insert(collection, document)
    }
}

/// In-memory implementation of [`StoreBackend`].
///
/// Handles opened on the same database share its data. Each handle is closed
/// independently by [`shutdown`](StoreBackend::shutdown), after which every
/// operation through it, including cursors it opened, fails.
///
/// Sessions are accepted and tracked but provide no isolation.
#[derive(Debug, Clone)]
pub struct InMemoryStore {
    database: String,
    data: Arc<RwLock<DatabaseMap>>,
    closed: Arc<AtomicBool>,
}

impl InMemoryStore {
    /// Creates an empty, standalone database.
    pub fn new(database: impl Into<String>) -> Self {
        Self::with_data(database.into(), Arc::new(RwLock::new(DatabaseMap::new())))
    }

    fn with_data(database: String, data: Arc<RwLock<DatabaseMap>>) -> Self {
        Self {
            database,
            data,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    fn ensure_open(&self) -> ShardocResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ShardocError::State(format!(
                "client for database `{}` has been shut down",
                self.database
            )));
        }

        Ok(())
    }

    /// Names of the collections holding documents or indexes.
    pub async fn collection_names(&self) -> ShardocResult<Vec<String>> {
        self.ensure_open()?;

        let mut names = self.data.read().await.keys().cloned().collect::<Vec<_>>();
        names.sort();

        Ok(names)
    }

    async fn select(&self, collection: &str, filter: &Document, options: &FindOptions) -> ShardocResult<Vec<Document>> {
        self.ensure_open()?;

        let data = self.data.read().await;
        let Some(stored) = data.get(collection) else {
            return Ok(Vec::new());
        };

        let mut selected = Vec::new();
        for document in stored.documents.values() {
            if matches(document, filter)? {
                selected.push(document.clone());
            }
        }
        drop(data);

        sort_documents(&mut selected, &options.sort);

        let skip = options.skip.map_or(0, |skip| usize::try_from(skip).unwrap_or(usize::MAX));
        let limit = match options.limit {
            None | Some(0) => usize::MAX,
            Some(limit) => usize::try_from(limit.unsigned_abs()).unwrap_or(usize::MAX),
        };

        selected
            .into_iter()
            .skip(skip)
            .take(limit)
            .map(|document| match &options.projection {
                Some(projection) => project(document, projection),
                None => Ok(document),
            })
            .collect()
    }

    async fn update(
        &self,
        collection: &str,
        filter: Document,
        update: Document,
        options: UpdateOptions,
        multi: bool,
    ) -> ShardocResult<UpdateOutcome> {
        self.ensure_open()?;

        let mut data = self.data.write().await;
        let stored = data.entry(collection.to_string()).or_default();

        let keys = stored.matching_keys(&filter, (!multi).then_some(1))?;
        if keys.is_empty() {
            if !options.upsert {
                return Ok(UpdateOutcome::default());
            }

            let id = stored.upsert(collection, &filter, &update)?;
            debug!(collection, id = %id, "upserted document");
            return Ok(UpdateOutcome {
                matched_count: 0,
                modified_count: 0,
                upserted_id: Some(id),
            });
        }

        let mut modified = 0;
        for key in &keys {
            if stored.update(collection, key, &update)? {
                modified += 1;
            }
        }

        Ok(UpdateOutcome {
            matched_count: keys.len() as u64,
            modified_count: modified,
            upserted_id: None,
        })
    }
}

#[async_trait]
impl StoreBackend for InMemoryStore {
    fn database_name(&self) -> &str {
        &self.database
    }

    async fn find(&self, collection: &str, filter: Document, options: FindOptions) -> ShardocResult<Box<dyn RawCursor>> {
        let documents = self.select(collection, &filter, &options).await?;

        Ok(Box::new(MemoryCursor {
            documents: documents.into(),
            closed: Arc::clone(&self.closed),
        }))
    }

    async fn find_one(&self, collection: &str, filter: Document, options: FindOptions) -> ShardocResult<Option<Document>> {
        let options = FindOptions {
            limit: Some(1),
            ..options
        };

        Ok(self
            .select(collection, &filter, &options)
            .await?
            .into_iter()
            .next())
    }

    async fn count_documents(&self, collection: &str, filter: Document) -> ShardocResult<u64> {
        self.ensure_open()?;

        let data = self.data.read().await;
        let Some(stored) = data.get(collection) else {
            return Ok(0);
        };

        let mut count = 0;
        for document in stored.documents.values() {
            if matches(document, &filter)? {
                count += 1;
            }
        }

        Ok(count)
    }

    async fn insert_one(&self, collection: &str, document: Document) -> ShardocResult<Bson> {
        self.ensure_open()?;

        self.data
            .write()
            .await
            .entry(collection.to_string())
            .or_default()
            .insert(collection, document)
    }

    async fn insert_many(&self, collection: &str, documents: Vec<Document>, ordered: bool) -> ShardocResult<usize> {
        self.ensure_open()?;

        let mut data = self.data.write().await;
        let stored = data.entry(collection.to_string()).or_default();

        let mut inserted = 0;
        let mut failures = Vec::new();
        for document in documents {
            match stored.insert(collection, document) {
                Ok(_) => inserted += 1,
                Err(e) => {
                    failures.push(e);
                    if ordered {
                        break;
                    }
                }
            }
        }

        let failed = failures.len();
        match failures.into_iter().next() {
            None => Ok(inserted),
            Some(first) => Err(ShardocError::BulkWrite {
                inserted,
                failed,
                first: Box::new(first),
            }),
        }
    }

    async fn update_one(
        &self,
        collection: &str,
        filter: Document,
        update: Document,
        options: UpdateOptions,
        _session: Option<&mut dyn ClientSession>,
    ) -> ShardocResult<UpdateOutcome> {
        self.update(collection, filter, update, options, false).await
    }

    async fn update_many(
        &self,
        collection: &str,
        filter: Document,
        update: Document,
        options: UpdateOptions,
        _session: Option<&mut dyn ClientSession>,
    ) -> ShardocResult<UpdateOutcome> {
        self.update(collection, filter, update, options, true).await
    }

    async fn find_one_and_update(
        &self,
        collection: &str,
        filter: Document,
        update: Document,
        options: FindOneAndUpdateOptions,
    ) -> ShardocResult<Option<Document>> {
        self.ensure_open()?;

        let mut data = self.data.write().await;
        let stored = data.entry(collection.to_string()).or_default();

        let (before, after) = match stored.matching_keys(&filter, Some(1))?.into_iter().next() {
            Some(key) => {
                let before = stored.documents.get(&key).cloned();
                stored.update(collection, &key, &update)?;
                (before, stored.documents.get(&key).cloned())
            }
            None if options.upsert => {
                let id = stored.upsert(collection, &filter, &update)?;
                (None, stored.documents.get(&id_key(&id)).cloned())
            }
            None => (None, None),
        };

        let returned = match options.return_document {
            ReturnDocument::Before => before,
            ReturnDocument::After => after,
        };

        match (returned, &options.projection) {
            (Some(document), Some(projection)) => project(document, projection).map(Some),
            (returned, _) => Ok(returned),
        }
    }

    async fn create_indexes(&self, collection: &str, indexes: &[IndexSpec]) -> ShardocResult<()> {
        self.ensure_open()?;

        let mut data = self.data.write().await;
        let stored = data.entry(collection.to_string()).or_default();

        for index in indexes {
            index.validate()?;
            if stored.indexes.contains(index) {
                continue;
            }

            if index.is_unique() {
                let mut seen: Vec<Vec<Option<&Bson>>> = Vec::new();
                for document in stored.documents.values() {
                    let Some(key) = index_key(document, index) else {
                        continue;
                    };
                    if seen.iter().any(|existing| same_key(existing, &key)) {
                        return Err(ShardocError::DuplicateKey(
                            format!("{{ {} }}", describe_key(index, &key)),
                            collection.to_string(),
                        ));
                    }
                    seen.push(key);
                }
            }

            debug!(collection, keys = %index.key_document(), unique = index.is_unique(), "created index");
            stored.indexes.push(index.clone());
        }

        Ok(())
    }

    async fn start_session(&self) -> ShardocResult<Box<dyn ClientSession>> {
        self.ensure_open()?;

        Ok(Box::new(MemorySession::default()))
    }

    async fn shutdown(&self) -> ShardocResult<()> {
        self.closed.store(true, Ordering::Release);

        Ok(())
    }
}

/// Cursor over a snapshot of the matching documents.
///
/// Tailable cursors behave as regular ones: the snapshot never grows.
#[derive(Debug)]
pub struct MemoryCursor {
    documents: VecDeque<Document>,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl RawCursor for MemoryCursor {
    async fn advance(&mut self) -> ShardocResult<Option<Document>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ShardocError::State("cursor belongs to a client that has been shut down".into()));
        }

        Ok(self.documents.pop_front())
    }

    fn alive(&self) -> bool {
        !self.documents.is_empty()
    }
}

/// Session handle tracking transaction state only.
#[derive(Debug, Default)]
pub struct MemorySession {
    in_transaction: bool,
}

impl MemorySession {
    pub fn in_transaction(&self) -> bool {
        self.in_transaction
    }
}

#[async_trait]
impl ClientSession for MemorySession {
    async fn start_transaction(&mut self) -> ShardocResult<()> {
        if self.in_transaction {
            return Err(ShardocError::State("transaction already in progress".into()));
        }
        self.in_transaction = true;

        Ok(())
    }

    async fn commit_transaction(&mut self) -> ShardocResult<()> {
        if !self.in_transaction {
            return Err(ShardocError::State("no transaction in progress".into()));
        }
        self.in_transaction = false;

        Ok(())
    }

    async fn abort_transaction(&mut self) -> ShardocResult<()> {
        if !self.in_transaction {
            return Err(ShardocError::State("no transaction in progress".into()));
        }
        self.in_transaction = false;

        Ok(())
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Opens [`InMemoryStore`] handles from `mongodb://` URIs.
///
/// URIs naming the same `host:port/database` share data, so several connections
/// (or a stop followed by a new registry) see the same documents. Distinct hosts
/// hold distinct data, which makes one connector enough to emulate a sharded
/// deployment.
///
/// ```ignore
/// let connector = Arc::new(InMemoryConnector::new());
/// let mut db = Database::new(definition, "mongodb://127.0.0.1/Example", connector.clone())?;
/// ```
#[derive(Debug)]
pub struct InMemoryConnector {
    databases: RwLock<HashMap<String, Arc<RwLock<DatabaseMap>>>>,
    refused: RwLock<HashSet<String>>,
}

impl InMemoryConnector {
    pub fn new() -> Self {
        Self {
            databases: RwLock::new(HashMap::new()),
            refused: RwLock::new(HashSet::new()),
        }
    }

    /// Makes later connections to `host` fail with [`ShardocError::Connection`].
    pub async fn refuse(&self, host: impl Into<String>) {
        self.refused.write().await.insert(host.into());
    }

    /// Makes `host` reachable again.
    pub async fn accept(&self, host: &str) {
        self.refused.write().await.remove(host);
    }
}

impl Default for InMemoryConnector {
    fn default() -> Self {
        Self::new()
    }
}

/// `host:port` and database name of a connection URI.
fn parse_endpoint(uri: &str) -> ShardocResult<(String, String)> {
    let url = Url::parse(uri).map_err(|e| ShardocError::Connection(format!("invalid URI: {}", e)))?;

    if !matches!(url.scheme(), "mongodb" | "mongodb+srv") {
        return Err(ShardocError::Connection(format!(
            "unsupported scheme `{}`",
            url.scheme()
        )));
    }

    let host = url
        .host_str()
        .filter(|host| !host.is_empty())
        .ok_or_else(|| ShardocError::Connection("URI names no host".into()))?;
    let port = url.port().unwrap_or(27017);

    let database = url.path().trim_start_matches('/');
    let database = if database.is_empty() { DEFAULT_DATABASE } else { database };

    Ok((format!("{}:{}", host, port), database.to_string()))
}

#[async_trait]
impl Connector for InMemoryConnector {
    async fn connect(&self, uri: &str) -> ShardocResult<Arc<dyn StoreBackend>> {
        let (host, database) = parse_endpoint(uri)?;

        let hostname = host.rsplit_once(':').map_or(host.as_str(), |(name, _)| name);
        if self.refused.read().await.contains(hostname) {
            return Err(ShardocError::Connection(format!("{} refused the connection", host)));
        }

        let data = Arc::clone(
            self.databases
                .write()
                .await
                .entry(format!("{}/{}", host, database))
                .or_insert_with(|| Arc::new(RwLock::new(DatabaseMap::new()))),
        );
        debug!(host = %host, database = %database, "connected to in-memory database");

        Ok(Arc::new(InMemoryStore::with_data(database, data)))
    }
}
