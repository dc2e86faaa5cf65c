//! Index specifications declared on collection descriptors.
//!
//! Indexes are ensured once, when a registry resolves a descriptor against a live
//! connection. Shapes are validated when the descriptor is built.

use bson::{Bson, Document};
use std::collections::HashSet;

use crate::error::{ShardocError, ShardocResult};

/// The kind of one index key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexKind {
    Ascending,
    Descending,
    Text,
    Hashed,
    Sphere2d,
}

impl IndexKind {
    /// The value of this key in an index key document.
    pub fn to_bson(self) -> Bson {
        match self {
            IndexKind::Ascending => Bson::Int32(1),
            IndexKind::Descending => Bson::Int32(-1),
            IndexKind::Text => Bson::String("text".into()),
            IndexKind::Hashed => Bson::String("hashed".into()),
            IndexKind::Sphere2d => Bson::String("2dsphere".into()),
        }
    }

    fn from_bson(value: &Bson) -> Option<Self> {
        match value {
            Bson::Int32(1) | Bson::Int64(1) => Some(IndexKind::Ascending),
            Bson::Int32(-1) | Bson::Int64(-1) => Some(IndexKind::Descending),
            Bson::Double(v) if *v == 1.0 => Some(IndexKind::Ascending),
            Bson::Double(v) if *v == -1.0 => Some(IndexKind::Descending),
            Bson::String(s) => match s.as_str() {
                "text" => Some(IndexKind::Text),
                "hashed" => Some(IndexKind::Hashed),
                "2dsphere" => Some(IndexKind::Sphere2d),
                _ => None,
            },
            _ => None,
        }
    }
}

/// An index over one or more fields, in key order.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexSpec {
    keys: Vec<(String, IndexKind)>,
    unique: bool,
    sparse: bool,
    name: Option<String>,
}

impl IndexSpec {
    /// Starts an index with its first key.
    pub fn new(field: impl Into<String>, kind: IndexKind) -> Self {
        Self {
            keys: vec![(field.into(), kind)],
            unique: false,
            sparse: false,
            name: None,
        }
    }

    /// An ascending single-field index.
    pub fn ascending(field: impl Into<String>) -> Self {
        Self::new(field, IndexKind::Ascending)
    }

    /// A descending single-field index.
    pub fn descending(field: impl Into<String>) -> Self {
        Self::new(field, IndexKind::Descending)
    }

    /// Parses an index from a raw key document such as `{ "place": -1, "name": 1 }`.
    pub fn from_keys(keys: &Document) -> ShardocResult<Self> {
        let keys = keys
            .iter()
            .map(|(field, value)| {
                IndexKind::from_bson(value)
                    .map(|kind| (field.clone(), kind))
                    .ok_or_else(|| {
                        ShardocError::Configuration(format!(
                            "index key `{}` has unrecognized kind {}",
                            field, value
                        ))
                    })
            })
            .collect::<ShardocResult<Vec<_>>>()?;

        let spec = Self {
            keys,
            unique: false,
            sparse: false,
            name: None,
        };
        spec.validate()?;

        Ok(spec)
    }

    /// Appends a key to a compound index.
    pub fn then(mut self, field: impl Into<String>, kind: IndexKind) -> Self {
        self.keys.push((field.into(), kind));
        self
    }

    /// Enforces uniqueness of the indexed values.
    pub fn unique(mut self, unique: bool) -> Self {
        self.unique = unique;
        self
    }

    /// Skips documents missing every indexed field.
    pub fn sparse(mut self, sparse: bool) -> Self {
        self.sparse = sparse;
        self
    }

    /// Names the index.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn keys(&self) -> &[(String, IndexKind)] {
        &self.keys
    }

    pub fn is_unique(&self) -> bool {
        self.unique
    }

    pub fn is_sparse(&self) -> bool {
        self.sparse
    }

    pub fn index_name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// The key document of this index.
    pub fn key_document(&self) -> Document {
        self.keys
            .iter()
            .map(|(field, kind)| (field.clone(), kind.to_bson()))
            .collect()
    }

    /// Checks the index has a shape the database accepts.
    pub fn validate(&self) -> ShardocResult<()> {
        if self.keys.is_empty() {
            return Err(ShardocError::Configuration("index has no keys".into()));
        }

        let mut seen = HashSet::new();
        for (field, _) in &self.keys {
            if field.is_empty() {
                return Err(ShardocError::Configuration("index key has an empty field name".into()));
            }
            if !seen.insert(field.as_str()) {
                return Err(ShardocError::Configuration(format!(
                    "index lists field `{}` twice",
                    field
                )));
            }
        }

        if self.unique && self.keys.iter().any(|(_, kind)| *kind == IndexKind::Hashed) {
            return Err(ShardocError::Configuration("hashed indexes cannot be unique".into()));
        }

        Ok(())
    }
}
