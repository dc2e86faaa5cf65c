//! The record codec contract.
//!
//! A [`Record`] is a strongly-typed shape stored as one raw document. The codec is
//! serde: [`RecordExt::encode`] serializes a record into a [`Document`] and
//! [`RecordExt::decode`] maps a raw document back, honouring the collection's
//! strictness setting.
//!
//! Most records derive the trait:
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
//! ```

use bson::{Bson, Document, de::deserialize_from_bson, ser::serialize_to_bson};
use serde::{Serialize, de::DeserializeOwned};
use std::any::{TypeId, type_name};

use crate::error::{ShardocError, ShardocResult};

/// Key holding the document identifier.
pub const ID_FIELD: &str = "_id";

/// Core trait every record stored through a typed collection implements.
pub trait Record: Serialize + DeserializeOwned + Send + Sync + Clone + 'static {
    /// Serialized names of the declared fields.
    ///
    /// `None` marks a dynamic, table-like shape: queries project every field and
    /// decoding never rejects unknown keys.
    const FIELDS: Option<&'static [&'static str]>;

    /// Returns the identifier, or `None` when it has not been assigned yet.
    fn id(&self) -> Option<Bson>;

    /// Assigns the identifier.
    fn set_id(&mut self, id: Bson) -> ShardocResult<()>;
}

/// Encoding and decoding helpers, implemented for every [`Record`].
pub trait RecordExt: Record {
    /// Converts this record to a raw document.
    ///
    /// An absent (`null`) identifier is left out, so the database can assign one.
    fn encode(&self) -> ShardocResult<Document>;

    /// Maps a raw document onto this record type.
    ///
    /// With `strict` set, keys that are not declared fields fail with
    /// [`ShardocError::Decode`]; otherwise they are dropped before decoding.
    fn decode(raw: Document, strict: bool) -> ShardocResult<Self>;
}

impl<R: Record> RecordExt for R {
    fn encode(&self) -> ShardocResult<Document> {
        let mut document = match serialize_to_bson(self)? {
            Bson::Document(document) => document,
            other => {
                return Err(ShardocError::Serialization(format!(
                    "{} encoded to {:?}, expected a document",
                    type_name::<R>(),
                    other.element_type()
                )));
            }
        };

        if matches!(document.get(ID_FIELD), Some(Bson::Null)) {
            document.remove(ID_FIELD);
        }

        Ok(document)
    }

    fn decode(mut raw: Document, strict: bool) -> ShardocResult<Self> {
        if let Some(fields) = R::FIELDS {
            let unknown = raw
                .keys()
                .filter(|key| !fields.contains(&key.as_str()))
                .cloned()
                .collect::<Vec<_>>();

            for key in unknown {
                if strict && key != ID_FIELD {
                    return Err(ShardocError::Decode(format!(
                        "unknown field `{}` for {}",
                        key,
                        type_name::<R>()
                    )));
                }
                raw.remove(&key);
            }
        }

        deserialize_from_bson(Bson::Document(raw))
            .map_err(|e| ShardocError::Decode(format!("{}: {}", type_name::<R>(), e)))
    }
}

/// Converts an identifier field into its raw form, `None` when unassigned.
///
/// Used by `#[derive(Record)]`.
pub fn id_to_bson<T: Serialize>(value: &T) -> Option<Bson> {
    match serialize_to_bson(value) {
        Ok(Bson::Null) | Err(_) => None,
        Ok(bson) => Some(bson),
    }
}

/// Converts a raw identifier into the identifier field's type.
///
/// Used by `#[derive(Record)]`.
pub fn id_from_bson<T: DeserializeOwned>(id: Bson) -> ShardocResult<T> {
    deserialize_from_bson(id).map_err(|e| ShardocError::Decode(format!("identifier: {}", e)))
}

/// The dynamic, table-like record shape.
impl Record for Document {
    const FIELDS: Option<&'static [&'static str]> = None;

    fn id(&self) -> Option<Bson> {
        match self.get(ID_FIELD) {
            None | Some(Bson::Null) => None,
            Some(id) => Some(id.clone()),
        }
    }

    fn set_id(&mut self, id: Bson) -> ShardocResult<()> {
        self.insert(ID_FIELD, id);
        Ok(())
    }
}

/// Type-erased handle on a record type, carried by collection descriptors.
#[derive(Debug, Clone, Copy)]
pub struct RecordType {
    type_id: TypeId,
    name: &'static str,
    fields: Option<&'static [&'static str]>,
}

impl RecordType {
    /// Captures the record type `R`.
    pub fn of<R: Record>() -> Self {
        Self {
            type_id: TypeId::of::<R>(),
            name: type_name::<R>(),
            fields: R::FIELDS,
        }
    }

    /// Whether this is the record type `R`.
    pub fn is<R: Record>(&self) -> bool {
        self.type_id == TypeId::of::<R>()
    }

    /// The Rust type name of the record.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Declared field names, `None` for dynamic shapes.
    pub fn fields(&self) -> Option<&'static [&'static str]> {
        self.fields
    }

    /// The projection document sent with typed reads, `None` meaning all fields.
    pub fn projection(&self) -> Option<Document> {
        self.fields.map(|fields| {
            fields
                .iter()
                .map(|field| (field.to_string(), Bson::Int32(1)))
                .collect()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct TopUser {
        #[serde(rename = "_id")]
        user_id: Option<String>,
        place: i32,
    }

    impl Record for TopUser {
        const FIELDS: Option<&'static [&'static str]> = Some(&["_id", "place"]);

        fn id(&self) -> Option<Bson> {
            id_to_bson(&self.user_id)
        }

        fn set_id(&mut self, id: Bson) -> ShardocResult<()> {
            self.user_id = id_from_bson(id)?;
            Ok(())
        }
    }

    #[test]
    fn encode_drops_unassigned_id() {
        let user = TopUser { user_id: None, place: 3 };
        assert_eq!(user.encode().unwrap(), doc! { "place": 3 });

        let user = TopUser { user_id: Some("u1".into()), place: 3 };
        assert_eq!(user.encode().unwrap(), doc! { "_id": "u1", "place": 3 });
    }

    #[test]
    fn strict_decode_rejects_unknown_fields() {
        let raw = doc! { "_id": "u1", "place": 1, "score": 10 };
        let err = TopUser::decode(raw, true).unwrap_err();
        assert!(matches!(err, ShardocError::Decode(msg) if msg.contains("score")));
    }

    #[test]
    fn loose_decode_drops_unknown_fields() {
        let raw = doc! { "_id": "u1", "place": 1, "score": 10 };
        let user = TopUser::decode(raw, false).unwrap();
        assert_eq!(user, TopUser { user_id: Some("u1".into()), place: 1 });
    }

    #[test]
    fn decode_reports_type_mismatch() {
        let raw = doc! { "_id": "u1", "place": "first" };
        assert!(matches!(TopUser::decode(raw.clone(), true), Err(ShardocError::Decode(_))));
        assert!(matches!(TopUser::decode(raw, false), Err(ShardocError::Decode(_))));
    }

    #[test]
    fn dynamic_documents_keep_every_key() {
        let raw = doc! { "_id": 7, "anything": [1, 2] };
        let decoded = Document::decode(raw.clone(), true).unwrap();
        assert_eq!(decoded, raw);
        assert_eq!(decoded.id(), Some(Bson::Int32(7)));
        assert!(RecordType::of::<Document>().projection().is_none());
    }

    #[test]
    fn set_id_converts_sequence_values() {
        let mut user = TopUser { user_id: None, place: 1 };
        assert!(user.id().is_none());
        user.set_id(Bson::String("u9".into())).unwrap();
        assert_eq!(user.id(), Some(Bson::String("u9".into())));

        let projection = RecordType::of::<TopUser>().projection().unwrap();
        assert_eq!(projection, doc! { "_id": 1, "place": 1 });
    }
}
