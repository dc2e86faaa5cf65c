//! Declarative metadata for one logical collection.
//!
//! A [`CollectionDescriptor`] names the record type, the physical collection, the
//! indexes to ensure, the default filter merged into every query, the decoding
//! strictness and the identifier policy. It is built once and only read afterwards.
//!
//! ```ignore
//! use docshard::prelude::*;
//!
//! let top_users = CollectionDescriptor::builder::<TopUser>()
//!     .name("TopUsers")
//!     .index(IndexSpec::descending("place"))
//!     .default_filter(doc! { "deleted": false })
//!     .build()?;
//! ```

use bson::Document;
use std::sync::Arc;

use crate::{
    error::ShardocResult,
    index::IndexSpec,
    record::{Record, RecordType},
};

/// Immutable metadata for one logical collection.
///
/// Cloning yields an independent descriptor: the index list is copied, the
/// default filter is shared since it is never mutated.
#[derive(Debug, Clone)]
pub struct CollectionDescriptor {
    record_type: RecordType,
    logical_name: Option<String>,
    physical_name: Option<String>,
    indexes: Vec<IndexSpec>,
    default_filter: Arc<Document>,
    strict: bool,
    incremental_ids: bool,
}

impl CollectionDescriptor {
    /// Starts a descriptor for record type `R`.
    pub fn builder<R: Record>() -> CollectionDescriptorBuilder {
        CollectionDescriptorBuilder::new(RecordType::of::<R>())
    }

    /// A descriptor for `R` with every option at its default.
    pub fn of<R: Record>() -> Self {
        Self {
            record_type: RecordType::of::<R>(),
            logical_name: None,
            physical_name: None,
            indexes: Vec::new(),
            default_filter: Arc::new(Document::new()),
            strict: true,
            incremental_ids: false,
        }
    }

    pub fn record_type(&self) -> &RecordType {
        &self.record_type
    }

    /// The name the collection is declared under in its database definition.
    pub fn logical_name(&self) -> Option<&str> {
        self.logical_name.as_deref()
    }

    /// The name of the physical collection: the override if any, else the logical name.
    pub fn collection_name(&self) -> Option<&str> {
        self.physical_name.as_deref().or(self.logical_name.as_deref())
    }

    pub fn indexes(&self) -> &[IndexSpec] {
        &self.indexes
    }

    pub fn default_filter(&self) -> &Document {
        &self.default_filter
    }

    pub fn strict(&self) -> bool {
        self.strict
    }

    pub fn incremental_ids(&self) -> bool {
        self.incremental_ids
    }

    pub(crate) fn with_logical_name(mut self, name: &str) -> Self {
        self.logical_name = Some(name.to_string());
        self
    }
}

/// Builder for [`CollectionDescriptor`].
#[derive(Debug)]
pub struct CollectionDescriptorBuilder {
    descriptor: CollectionDescriptor,
}

impl CollectionDescriptorBuilder {
    fn new(record_type: RecordType) -> Self {
        Self {
            descriptor: CollectionDescriptor {
                record_type,
                ..CollectionDescriptor::of::<Document>()
            },
        }
    }

    /// Overrides the physical collection name.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.descriptor.physical_name = Some(name.into());
        self
    }

    /// Declares an index.
    pub fn index(mut self, index: IndexSpec) -> Self {
        self.descriptor.indexes.push(index);
        self
    }

    /// Declares several indexes, in order.
    pub fn indexes(mut self, indexes: impl IntoIterator<Item = IndexSpec>) -> Self {
        self.descriptor.indexes.extend(indexes);
        self
    }

    /// Sets the filter merged into every query.
    pub fn default_filter(mut self, filter: impl Into<Document>) -> Self {
        self.descriptor.default_filter = Arc::new(filter.into());
        self
    }

    /// Rejects unknown fields when decoding. Defaults to `true`.
    pub fn strict(mut self, strict: bool) -> Self {
        self.descriptor.strict = strict;
        self
    }

    /// Allocates missing identifiers from a per-collection counter. Defaults to `false`.
    pub fn incremental_ids(mut self, incremental_ids: bool) -> Self {
        self.descriptor.incremental_ids = incremental_ids;
        self
    }

    /// Validates every declared index and returns the descriptor.
    pub fn build(self) -> ShardocResult<CollectionDescriptor> {
        for index in &self.descriptor.indexes {
            index.validate()?;
        }

        Ok(self.descriptor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{error::ShardocError, index::IndexKind};
    use bson::doc;

    #[test]
    fn defaults_are_strict_without_incremental_ids() {
        let descriptor = CollectionDescriptor::builder::<Document>().build().unwrap();
        assert!(descriptor.strict());
        assert!(!descriptor.incremental_ids());
        assert!(descriptor.indexes().is_empty());
        assert!(descriptor.default_filter().is_empty());
        assert!(descriptor.record_type().is::<Document>());
    }

    #[test]
    fn physical_name_falls_back_to_logical_name() {
        let plain = CollectionDescriptor::of::<Document>().with_logical_name("top_users");
        assert_eq!(plain.collection_name(), Some("top_users"));

        let renamed = CollectionDescriptor::builder::<Document>()
            .name("TopUsers")
            .build()
            .unwrap()
            .with_logical_name("top_users");
        assert_eq!(renamed.collection_name(), Some("TopUsers"));
        assert_eq!(renamed.logical_name(), Some("top_users"));
    }

    #[test]
    fn build_rejects_invalid_indexes() {
        let err = CollectionDescriptor::builder::<Document>()
            .index(IndexSpec::ascending("a"))
            .index(IndexSpec::new("b", IndexKind::Hashed).unique(true))
            .build()
            .unwrap_err();
        assert!(matches!(err, ShardocError::Configuration(_)));
    }

    #[test]
    fn clone_copies_indexes_and_shares_filter() {
        let original = CollectionDescriptor::builder::<Document>()
            .index(IndexSpec::ascending("a"))
            .default_filter(doc! { "deleted": false })
            .incremental_ids(true)
            .build()
            .unwrap();
        let copy = original.clone();

        assert_eq!(copy.indexes(), original.indexes());
        assert!(Arc::ptr_eq(&copy.default_filter, &original.default_filter));
        assert!(copy.incremental_ids());
    }
}
