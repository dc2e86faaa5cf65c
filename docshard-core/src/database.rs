//! Database registries and shard routing.
//!
//! A [`DatabaseDefinition`] declares the logical collections of a database. A
//! [`Database`] pairs a definition with a [`DatabaseConfig`]: it owns one
//! [`Connection`] per endpoint and, once started, one bound collection per
//! declared descriptor and connection.
//!
//! A registry configured with a single endpoint is unsharded and exposes its
//! collections directly. A registry configured with a list of endpoints is
//! sharded: every endpoint becomes a [`Shard`] holding its own bound collections,
//! looked up by [`ShardKey`].
//!
//! # Example
//!
//! ```ignore
//! let definition = DatabaseDefinition::builder()
//!     .collection("top_users", CollectionDescriptor::builder::<TopUser>().name("TopUsers").build()?)
//!     .build()?;
//!
//! let mut db = Database::new(definition, "mongodb://127.0.0.1/Example", connector)?;
//! db.start().await?;
//!
//! let users = db.collection::<TopUser>("top_users")?;
//! println!("{} users", users.count(doc! {}).await?);
//!
//! db.stop().await?;
//! ```

use futures::future::{join_all, try_join_all};
use std::{
    collections::{HashSet, hash_map::DefaultHasher},
    fmt,
    hash::{Hash, Hasher},
    sync::Arc,
};
use tracing::{debug, info};

use crate::{
    backend::Connector,
    collection::{RawCollection, TypedCollection},
    connection::{Connection, DatabaseConfig},
    descriptor::CollectionDescriptor,
    error::{ShardocError, ShardocResult},
    record::Record,
};

/// The declared collections of a database, in declaration order.
#[derive(Debug, Clone, Default)]
pub struct DatabaseDefinition {
    collections: Vec<(String, CollectionDescriptor)>,
}

impl DatabaseDefinition {
    pub fn builder() -> DatabaseDefinitionBuilder {
        DatabaseDefinitionBuilder::default()
    }

    /// Logical collection names, in declaration order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.collections.iter().map(|(name, _)| name.as_str())
    }

    pub fn descriptor(&self, name: &str) -> Option<&CollectionDescriptor> {
        self.collections
            .iter()
            .find(|(declared, _)| declared == name)
            .map(|(_, descriptor)| descriptor)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &CollectionDescriptor)> {
        self.collections
            .iter()
            .map(|(name, descriptor)| (name.as_str(), descriptor))
    }

    pub fn len(&self) -> usize {
        self.collections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.collections.is_empty()
    }

    /// A definition restricted to the named collections.
    ///
    /// Use it to limit which indexes a process ensures on startup.
    pub fn with_collections(&self, names: &[&str]) -> ShardocResult<Self> {
        derive_subset(self, names)
    }
}

/// Copies the descriptors named in `names` out of `definition`, keeping declaration order.
///
/// Fails with [`ShardocError::Configuration`] on an undeclared name.
pub fn derive_subset(definition: &DatabaseDefinition, names: &[&str]) -> ShardocResult<DatabaseDefinition> {
    let wanted = names.iter().copied().collect::<HashSet<_>>();

    for name in &wanted {
        if definition.descriptor(name).is_none() {
            return Err(ShardocError::Configuration(format!(
                "collection `{}` is not declared",
                name
            )));
        }
    }

    Ok(DatabaseDefinition {
        collections: definition
            .collections
            .iter()
            .filter(|(name, _)| wanted.contains(name.as_str()))
            .cloned()
            .collect(),
    })
}

/// Builder for [`DatabaseDefinition`].
#[derive(Debug, Default)]
pub struct DatabaseDefinitionBuilder {
    collections: Vec<(String, CollectionDescriptor)>,
}

impl DatabaseDefinitionBuilder {
    /// Declares the collection `name`.
    pub fn collection(mut self, name: impl Into<String>, descriptor: CollectionDescriptor) -> Self {
        self.collections.push((name.into(), descriptor));
        self
    }

    /// Fails with [`ShardocError::Configuration`] when a name is empty or declared twice.
    pub fn build(self) -> ShardocResult<DatabaseDefinition> {
        let mut seen = HashSet::new();
        let mut collections = Vec::with_capacity(self.collections.len());

        for (name, descriptor) in self.collections {
            if name.is_empty() {
                return Err(ShardocError::Configuration("collection name is empty".into()));
            }
            if !seen.insert(name.clone()) {
                return Err(ShardocError::Configuration(format!(
                    "collection `{}` is declared twice",
                    name
                )));
            }

            let descriptor = descriptor.with_logical_name(&name);
            collections.push((name, descriptor));
        }

        Ok(DatabaseDefinition { collections })
    }
}

/// One declared collection resolved against a live connection.
#[derive(Debug, Clone)]
struct BoundCollection {
    name: String,
    collection: RawCollection,
    descriptor: Arc<CollectionDescriptor>,
}

/// The bound collections of one connection.
#[derive(Debug, Clone, Default)]
pub struct CollectionSet {
    collections: Vec<BoundCollection>,
}

impl CollectionSet {
    fn bound(&self, name: &str) -> ShardocResult<&BoundCollection> {
        self.collections
            .iter()
            .find(|bound| bound.name == name)
            .ok_or_else(|| ShardocError::Configuration(format!("collection `{}` is not declared", name)))
    }

    /// A fresh typed binding of the collection `name`, with no cursor open.
    ///
    /// Fails with [`ShardocError::Configuration`] for an undeclared name or when the
    /// collection holds another record type.
    pub fn collection<R: Record>(&self, name: &str) -> ShardocResult<TypedCollection<R>> {
        let bound = self.bound(name)?;
        TypedCollection::bind(bound.collection.clone(), Arc::clone(&bound.descriptor))
    }

    /// The physical collection behind `name`.
    pub fn raw(&self, name: &str) -> ShardocResult<&RawCollection> {
        self.bound(name).map(|bound| &bound.collection)
    }

    pub fn descriptor(&self, name: &str) -> ShardocResult<&CollectionDescriptor> {
        self.bound(name).map(|bound| bound.descriptor.as_ref())
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.collections.iter().map(|bound| bound.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.collections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.collections.is_empty()
    }
}

/// One endpoint of a sharded registry.
#[derive(Debug)]
pub struct Shard {
    index: usize,
    collections: CollectionSet,
}

impl Shard {
    /// Position of this shard in the configured endpoint list.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn collections(&self) -> &CollectionSet {
        &self.collections
    }

    /// A fresh typed binding of the collection `name` on this shard.
    pub fn collection<R: Record>(&self, name: &str) -> ShardocResult<TypedCollection<R>> {
        self.collections.collection(name)
    }
}

/// Selects a shard.
///
/// Integers address a shard by position; anything else is hashed, and the hash
/// taken modulo the shard count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardKey {
    Index(i128),
    Hashed(u64),
}

impl ShardKey {
    /// A key routed by the hash of `key`.
    ///
    /// The hasher is unkeyed, so the same key maps to the same shard across calls
    /// and processes built from the same toolchain.
    pub fn hashed<K: Hash + ?Sized>(key: &K) -> Self {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        ShardKey::Hashed(hasher.finish())
    }

    /// The shard this key selects among `shards`.
    pub fn route(self, shards: usize) -> ShardocResult<usize> {
        match self {
            ShardKey::Index(index) => usize::try_from(index)
                .ok()
                .filter(|position| *position < shards)
                .ok_or(ShardocError::ShardIndex { index, shards }),
            ShardKey::Hashed(_) if shards == 0 => Err(ShardocError::State("no shards to route to".into())),
            ShardKey::Hashed(hash) => Ok((hash % shards as u64) as usize),
        }
    }
}

macro_rules! shard_index_from {
    ($($t:ty),*) => {
        $(
            impl From<$t> for ShardKey {
                fn from(index: $t) -> Self {
                    ShardKey::Index(i128::from(index))
                }
            }
        )*
    };
}

shard_index_from!(i8, i16, i32, i64, u8, u16, u32, u64);

impl From<usize> for ShardKey {
    fn from(index: usize) -> Self {
        // usize is at most 64 bits wide on every supported target
        ShardKey::Index(index as i128)
    }
}

impl From<&str> for ShardKey {
    fn from(key: &str) -> Self {
        ShardKey::hashed(key)
    }
}

impl From<&String> for ShardKey {
    fn from(key: &String) -> Self {
        ShardKey::hashed(key.as_str())
    }
}

impl From<String> for ShardKey {
    fn from(key: String) -> Self {
        ShardKey::hashed(key.as_str())
    }
}

/// Read-only view over the shards of a started, sharded registry.
#[derive(Debug, Clone, Copy)]
pub struct ShardRouter<'a> {
    shards: &'a [Shard],
}

impl<'a> ShardRouter<'a> {
    /// The shard selected by `key`.
    pub fn shard(&self, key: impl Into<ShardKey>) -> ShardocResult<&'a Shard> {
        let position = key.into().route(self.shards.len())?;
        Ok(&self.shards[position])
    }

    pub fn len(&self) -> usize {
        self.shards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'a, Shard> {
        self.shards.iter()
    }
}

/// How the collections of a started registry are laid out.
#[derive(Debug)]
pub enum Layout<'a> {
    /// One connection; collections are reached directly.
    Unsharded(&'a CollectionSet),
    /// Several connections; collections are reached through a shard.
    Sharded(ShardRouter<'a>),
}

/// Lifecycle state of a [`Database`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatabaseState {
    Unconfigured,
    Connecting,
    Ready,
    Stopped,
}

impl fmt::Display for DatabaseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self {
            DatabaseState::Unconfigured => "unconfigured",
            DatabaseState::Connecting => "connecting",
            DatabaseState::Ready => "ready",
            DatabaseState::Stopped => "stopped",
        };
        f.write_str(state)
    }
}

#[derive(Debug)]
enum Topology {
    Unsharded {
        connection: Connection,
        collections: Option<CollectionSet>,
    },
    Sharded {
        connections: Vec<Connection>,
        shards: Vec<Shard>,
    },
}

/// A database registry: declared collections bound over one or several connections.
#[derive(Debug)]
pub struct Database {
    definition: DatabaseDefinition,
    topology: Topology,
    state: DatabaseState,
}

impl Database {
    /// Creates a registry; nothing is opened until [`start`](Self::start).
    ///
    /// Fails with [`ShardocError::Configuration`] when the configuration is not a
    /// valid endpoint or a non-empty list of endpoints.
    pub fn new(
        definition: DatabaseDefinition,
        config: impl Into<DatabaseConfig>,
        connector: Arc<dyn Connector>,
    ) -> ShardocResult<Self> {
        let config = config.into();
        config.validate()?;

        let topology = match &config {
            DatabaseConfig::Single(endpoint) => Topology::Unsharded {
                connection: Connection::from_endpoint(endpoint, connector)?,
                collections: None,
            },
            DatabaseConfig::Sharded(endpoints) => Topology::Sharded {
                connections: endpoints
                    .iter()
                    .map(|endpoint| Connection::from_endpoint(endpoint, Arc::clone(&connector)))
                    .collect::<ShardocResult<Vec<_>>>()?,
                shards: Vec::new(),
            },
        };

        Ok(Self {
            definition,
            topology,
            state: DatabaseState::Unconfigured,
        })
    }

    pub fn definition(&self) -> &DatabaseDefinition {
        &self.definition
    }

    pub fn state(&self) -> DatabaseState {
        self.state
    }

    /// Whether the registry was configured with a list of endpoints.
    pub fn sharded(&self) -> bool {
        matches!(self.topology, Topology::Sharded { .. })
    }

    /// The number of shards, 0 when unsharded.
    pub fn shards(&self) -> usize {
        match &self.topology {
            Topology::Unsharded { .. } => 0,
            Topology::Sharded { connections, .. } => connections.len(),
        }
    }

    /// Opens every connection and binds every declared collection on each of them.
    ///
    /// Connections start concurrently, and the collections of one connection are
    /// resolved concurrently, creating their declared indexes. The first failure
    /// fails the whole start; connections already opened stay open and a later
    /// call may retry.
    pub async fn start(&mut self) -> ShardocResult<()> {
        match self.state {
            DatabaseState::Ready => return Ok(()),
            DatabaseState::Stopped => {
                return Err(ShardocError::State("database registry has been stopped".into()));
            }
            DatabaseState::Unconfigured | DatabaseState::Connecting => {}
        }
        self.state = DatabaseState::Connecting;

        let definition = &self.definition;
        match &mut self.topology {
            Topology::Unsharded { connection, collections } => {
                *collections = Some(open(connection, definition).await?);
            }
            Topology::Sharded { connections, shards } => {
                let resolved = try_join_all(
                    connections
                        .iter_mut()
                        .map(|connection| open(connection, definition)),
                )
                .await?;

                *shards = resolved
                    .into_iter()
                    .enumerate()
                    .map(|(index, collections)| Shard { index, collections })
                    .collect();
            }
        }

        self.state = DatabaseState::Ready;
        info!(
            shards = self.shards(),
            collections = self.definition.len(),
            "database registry ready"
        );

        Ok(())
    }

    /// Closes every connection.
    ///
    /// Every connection is stopped even when another fails; the first failure is
    /// returned afterwards.
    pub async fn stop(&mut self) -> ShardocResult<()> {
        let results = match &mut self.topology {
            Topology::Unsharded { connection, collections } => {
                *collections = None;
                vec![connection.stop().await]
            }
            Topology::Sharded { connections, shards } => {
                shards.clear();
                join_all(connections.iter_mut().map(|connection| connection.stop())).await
            }
        };

        self.state = DatabaseState::Stopped;
        info!("database registry stopped");

        results.into_iter().collect::<ShardocResult<Vec<_>>>()?;

        Ok(())
    }

    fn ensure_ready(&self) -> ShardocResult<()> {
        if self.state != DatabaseState::Ready {
            return Err(ShardocError::State(format!(
                "database registry is {}, not ready",
                self.state
            )));
        }

        Ok(())
    }

    /// The collection layout of the started registry.
    pub fn layout(&self) -> ShardocResult<Layout<'_>> {
        self.ensure_ready()?;

        match &self.topology {
            Topology::Unsharded { collections: Some(collections), .. } => Ok(Layout::Unsharded(collections)),
            Topology::Unsharded { collections: None, .. } => {
                Err(ShardocError::State("collections are not resolved".into()))
            }
            Topology::Sharded { shards, .. } => Ok(Layout::Sharded(ShardRouter { shards })),
        }
    }

    /// The collections of an unsharded registry.
    ///
    /// Fails with [`ShardocError::State`] on a sharded registry; go through [`shard`](Self::shard).
    pub fn collections(&self) -> ShardocResult<&CollectionSet> {
        match self.layout()? {
            Layout::Unsharded(collections) => Ok(collections),
            Layout::Sharded(_) => Err(ShardocError::State(
                "database registry is sharded, select a shard first".into(),
            )),
        }
    }

    /// A fresh typed binding of the collection `name` of an unsharded registry.
    pub fn collection<R: Record>(&self, name: &str) -> ShardocResult<TypedCollection<R>> {
        self.collections()?.collection(name)
    }

    /// The shards of a sharded registry.
    pub fn router(&self) -> ShardocResult<ShardRouter<'_>> {
        match self.layout()? {
            Layout::Sharded(router) => Ok(router),
            Layout::Unsharded(_) => Err(ShardocError::State("database registry is not sharded".into())),
        }
    }

    /// The shard selected by `key`.
    ///
    /// Fails with [`ShardocError::State`] when the registry is not sharded, and with
    /// [`ShardocError::ShardIndex`] for an explicit index outside `0..shards`.
    pub fn shard(&self, key: impl Into<ShardKey>) -> ShardocResult<&Shard> {
        if !self.sharded() {
            return Err(ShardocError::State("database registry is not sharded".into()));
        }

        self.router()?.shard(key)
    }
}

/// Starts `connection` and binds every declared collection on it.
async fn open(connection: &mut Connection, definition: &DatabaseDefinition) -> ShardocResult<CollectionSet> {
    connection.start().await?;
    let database = connection.get_database()?;

    let collections = try_join_all(definition.iter().map(|(name, descriptor)| {
        let database = database.clone();
        async move {
            let physical = descriptor.collection_name().unwrap_or(name);
            let collection = database.collection(physical);

            if !descriptor.indexes().is_empty() {
                collection.create_indexes(descriptor.indexes()).await?;
                debug!(
                    collection = physical,
                    indexes = descriptor.indexes().len(),
                    "ensured indexes"
                );
            }
            debug!(logical = name, collection = physical, database = database.name(), "resolved collection");

            Ok::<_, ShardocError>(BoundCollection {
                name: name.to_string(),
                collection,
                descriptor: Arc::new(descriptor.clone()),
            })
        }
    }))
    .await?;

    Ok(CollectionSet { collections })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{backend::StoreBackend, connection::EndpointConfig};
    use async_trait::async_trait;
    use bson::Document;
    use futures::executor::block_on;

    #[derive(Debug)]
    struct Unreachable;

    #[async_trait]
    impl Connector for Unreachable {
        async fn connect(&self, uri: &str) -> ShardocResult<Arc<dyn StoreBackend>> {
            Err(ShardocError::Connection(format!("{} is unreachable", uri)))
        }
    }

    fn definition() -> DatabaseDefinition {
        DatabaseDefinition::builder()
            .collection("a", CollectionDescriptor::of::<Document>())
            .collection("b", CollectionDescriptor::of::<Document>())
            .collection("c", CollectionDescriptor::of::<Document>())
            .build()
            .unwrap()
    }

    #[test]
    fn subset_keeps_only_named_collections() {
        let subset = definition().with_collections(&["b", "a"]).unwrap();
        assert_eq!(subset.names().collect::<Vec<_>>(), vec!["a", "b"]);
        assert_eq!(subset.descriptor("a").unwrap().logical_name(), Some("a"));

        let err = definition().with_collections(&["a", "d"]).unwrap_err();
        assert!(matches!(err, ShardocError::Configuration(msg) if msg.contains("`d`")));
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let err = DatabaseDefinition::builder()
            .collection("a", CollectionDescriptor::of::<Document>())
            .collection("a", CollectionDescriptor::of::<Document>())
            .build()
            .unwrap_err();
        assert!(matches!(err, ShardocError::Configuration(_)));
    }

    #[test]
    fn mode_follows_configuration_shape() {
        let single = Database::new(definition(), "mongodb://a/db", Arc::new(Unreachable)).unwrap();
        assert!(!single.sharded());
        assert_eq!(single.shards(), 0);
        assert_eq!(single.state(), DatabaseState::Unconfigured);

        let sharded = Database::new(
            definition(),
            DatabaseConfig::sharded(["mongodb://a/db", "mongodb://b/db", "mongodb://c/db"]),
            Arc::new(Unreachable),
        )
        .unwrap();
        assert!(sharded.sharded());
        assert_eq!(sharded.shards(), 3);

        let one = Database::new(
            definition(),
            vec![EndpointConfig::from("mongodb://a/db")],
            Arc::new(Unreachable),
        )
        .unwrap();
        assert!(one.sharded());
        assert_eq!(one.shards(), 1);

        let empty = Database::new(definition(), Vec::<EndpointConfig>::new(), Arc::new(Unreachable));
        assert!(matches!(empty, Err(ShardocError::Configuration(_))));
    }

    #[test]
    fn integer_keys_select_shards_directly() {
        assert_eq!(ShardKey::from(2_i64).route(3).unwrap(), 2);
        assert_eq!(ShardKey::from(0_u8).route(3).unwrap(), 0);
        assert!(matches!(
            ShardKey::from(3_i32).route(3),
            Err(ShardocError::ShardIndex { index: 3, shards: 3 })
        ));
        assert!(matches!(ShardKey::from(-1_i32).route(3), Err(ShardocError::ShardIndex { .. })));

        // indexes beyond i64 are reported as given
        assert!(matches!(
            ShardKey::from(u64::MAX).route(3),
            Err(ShardocError::ShardIndex { index, shards: 3 }) if index == i128::from(u64::MAX)
        ));
        assert!(matches!(
            ShardKey::from(usize::MAX).route(3),
            Err(ShardocError::ShardIndex { index, shards: 3 }) if index == usize::MAX as i128
        ));
    }

    #[test]
    fn hashed_keys_route_deterministically() {
        let first = ShardKey::from("user-42").route(3).unwrap();
        for _ in 0..10 {
            assert_eq!(ShardKey::from("user-42").route(3).unwrap(), first);
        }
        assert!(first < 3);
        assert_eq!(ShardKey::from(String::from("user-42")), ShardKey::from("user-42"));
    }

    #[test]
    fn failed_start_leaves_registry_connecting() {
        let mut db = Database::new(definition(), "mongodb://a/db", Arc::new(Unreachable)).unwrap();

        let err = block_on(db.start()).unwrap_err();
        assert!(matches!(err, ShardocError::Connection(_)));
        assert_eq!(db.state(), DatabaseState::Connecting);
        assert!(matches!(db.collection::<Document>("a"), Err(ShardocError::State(_))));

        block_on(db.stop()).unwrap();
        assert_eq!(db.state(), DatabaseState::Stopped);
        assert!(matches!(block_on(db.start()), Err(ShardocError::State(_))));
    }

    #[test]
    fn unsharded_registry_refuses_shard_lookup() {
        let db = Database::new(definition(), "mongodb://a/db", Arc::new(Unreachable)).unwrap();
        assert!(matches!(db.shard(0_i64), Err(ShardocError::State(_))));
    }
}
