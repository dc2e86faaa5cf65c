//! Error types and result types for typed collection and registry operations.
//!
//! Use [`ShardocResult<T>`] as the return type for fallible operations. Errors raised
//! by the underlying database client are carried through [`ShardocError::Backend`]
//! unchanged, so callers can downcast them to the driver's own error type.

use bson::error::Error as BsonError;
use serde_json::Error as SerdeJsonError;
use std::error::Error as StdError;
use thiserror::Error;

/// A boxed error coming from the underlying database client.
pub type BackendError = Box<dyn StdError + Send + Sync + 'static>;

/// Represents all possible errors raised by the typed collection layer.
#[derive(Error, Debug)]
pub enum ShardocError {
    /// Invalid descriptor, index or connection configuration shape.
    ///
    /// Raised eagerly when the offending value is constructed, never at use time.
    #[error("Configuration error: {0}")]
    Configuration(String),
    /// The underlying client failed to open or reach its endpoint.
    #[error("Connection error: {0}")]
    Connection(String),
    /// An operation was invoked in a state that forbids it.
    #[error("State error: {0}")]
    State(String),
    /// A raw document could not be mapped onto the declared record shape.
    #[error("Decode error: {0}")]
    Decode(String),
    /// An explicit shard index was outside `0..shards`.
    #[error("Shard index {index} out of range for {shards} shards")]
    ShardIndex {
        /// The requested index.
        index: i128,
        /// The number of shards of the registry.
        shards: usize,
    },
    /// Serialization error when converting a record into a raw document.
    #[error("Serialization error: {0}")]
    Serialization(String),
    /// A document with the given key already exists in the collection.
    /// The first argument is the key, the second is the collection name.
    #[error("Duplicate key {0} in collection {1}")]
    DuplicateKey(String, String),
    /// Some documents of an unordered bulk insert failed.
    ///
    /// The documents that could be inserted were inserted; `first` is the first failure seen.
    #[error("Bulk write failed for {failed} documents ({inserted} inserted): {first}")]
    BulkWrite {
        /// Number of documents inserted.
        inserted: usize,
        /// Number of documents rejected.
        failed: usize,
        /// The first rejection.
        first: Box<ShardocError>,
    },
    /// An error raised by the underlying database client, passed through as-is.
    #[error("Backend error: {0}")]
    Backend(BackendError),
}

impl ShardocError {
    /// Wraps an underlying client error.
    pub fn backend<E>(err: E) -> Self
    where
        E: Into<BackendError>,
    {
        ShardocError::Backend(err.into())
    }
}

/// A specialized `Result` type for typed collection operations.
pub type ShardocResult<T> = Result<T, ShardocError>;

impl From<BsonError> for ShardocError {
    fn from(err: BsonError) -> Self {
        ShardocError::Serialization(err.to_string())
    }
}

impl From<SerdeJsonError> for ShardocError {
    fn from(err: SerdeJsonError) -> Self {
        ShardocError::Serialization(err.to_string())
    }
}
