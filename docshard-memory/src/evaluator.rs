//! Query document evaluation for in-memory collections.
//!
//! This module interprets the raw filter, update, sort and projection documents
//! the typed layer sends to its backend, against BSON documents held in memory.

use bson::{Bson, DateTime, Document, oid::ObjectId};
use std::{cmp::Ordering, collections::HashMap};

use docshard_core::{
    error::{ShardocError, ShardocResult},
    query::{Sort, SortDirection},
    record::ID_FIELD,
};

/// Type-erased, comparable representation of BSON values.
///
/// Integers of either width share a variant and compare exactly; against a
/// double they compare as f64, so `1`, `1i64` and `1.0` are equal.
#[derive(Debug)]
pub(crate) enum Comparable<'a> {
    Null,
    Bool(bool),
    Integer(i64),
    Number(f64),
    DateTime(DateTime),
    String(&'a str),
    ObjectId(ObjectId),
    Array(Vec<Comparable<'a>>),
    Map(HashMap<&'a str, Comparable<'a>>),
}

impl<'a> From<&'a Bson> for Comparable<'a> {
    fn from(bson: &'a Bson) -> Self {
        match bson {
            Bson::Null => Comparable::Null,
            Bson::Boolean(value) => Comparable::Bool(*value),
            Bson::Int32(value) => Comparable::Integer(i64::from(*value)),
            Bson::Int64(value) => Comparable::Integer(*value),
            Bson::Double(value) => Comparable::Number(*value),
            Bson::DateTime(value) => Comparable::DateTime(*value),
            Bson::String(value) => Comparable::String(value),
            Bson::ObjectId(value) => Comparable::ObjectId(*value),
            Bson::Array(arr) => Comparable::Array(arr.iter().map(Comparable::from).collect::<Vec<_>>()),
            Bson::Document(doc) => Comparable::Map(
                doc.iter()
                    .map(|(k, v)| (k.as_str(), Comparable::from(v)))
                    .collect::<HashMap<_, _>>(),
            ),
            _ => Comparable::Null,
        }
    }
}

impl PartialEq for Comparable<'_> {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Comparable::Null, Comparable::Null) => true,
            (Comparable::Bool(a), Comparable::Bool(b)) => a == b,
            (Comparable::Integer(a), Comparable::Integer(b)) => a == b,
            (Comparable::Integer(a), Comparable::Number(b)) | (Comparable::Number(b), Comparable::Integer(a)) => {
                *a as f64 == *b
            }
            (Comparable::Number(a), Comparable::Number(b)) => a == b,
            (Comparable::DateTime(a), Comparable::DateTime(b)) => a == b,
            (Comparable::String(a), Comparable::String(b)) => a == b,
            (Comparable::ObjectId(a), Comparable::ObjectId(b)) => a == b,
            (Comparable::Array(a), Comparable::Array(b)) => a == b,
            (Comparable::Map(a), Comparable::Map(b)) => a == b,
            _ => false,
        }
    }
}

impl PartialOrd for Comparable<'_> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (Comparable::Null, Comparable::Null) => Some(Ordering::Equal),
            (Comparable::Bool(a), Comparable::Bool(b)) => a.partial_cmp(b),
            (Comparable::Integer(a), Comparable::Integer(b)) => a.partial_cmp(b),
            (Comparable::Integer(a), Comparable::Number(b)) => (*a as f64).partial_cmp(b),
            (Comparable::Number(a), Comparable::Integer(b)) => a.partial_cmp(&(*b as f64)),
            (Comparable::Number(a), Comparable::Number(b)) => a.partial_cmp(b),
            (Comparable::DateTime(a), Comparable::DateTime(b)) => a.partial_cmp(b),
            (Comparable::String(a), Comparable::String(b)) => a.partial_cmp(b),
            (Comparable::ObjectId(a), Comparable::ObjectId(b)) => a.partial_cmp(b),
            _ => None,
        }
    }
}

impl Comparable<'_> {
    /// Position of the value's type in the cross-type sort order.
    fn rank(&self) -> u8 {
        match self {
            Comparable::Null => 0,
            Comparable::Integer(_) | Comparable::Number(_) => 1,
            Comparable::String(_) => 2,
            Comparable::Map(_) => 3,
            Comparable::Array(_) => 4,
            Comparable::ObjectId(_) => 5,
            Comparable::Bool(_) => 6,
            Comparable::DateTime(_) => 7,
        }
    }

    /// A total order for sorting: by type first, then by value.
    pub(crate) fn sort_cmp(&self, other: &Self) -> Ordering {
        self.partial_cmp(other)
            .unwrap_or_else(|| self.rank().cmp(&other.rank()))
    }
}

fn malformed(message: String) -> ShardocError {
    ShardocError::backend(message)
}

/// Follows a dotted path through nested documents and array positions.
pub(crate) fn lookup<'a>(document: &'a Document, path: &str) -> Option<&'a Bson> {
    let mut segments = path.split('.');
    let mut current = document.get(segments.next()?)?;

    for segment in segments {
        current = match current {
            Bson::Document(inner) => inner.get(segment)?,
            Bson::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }

    Some(current)
}

/// Sets the value at a dotted path, creating intermediate documents.
pub(crate) fn set_path(document: &mut Document, path: &str, value: Bson) -> ShardocResult<()> {
    let Some((head, rest)) = path.split_once('.') else {
        document.insert(path, value);
        return Ok(());
    };

    if !document.contains_key(head) {
        document.insert(head, Document::new());
    }

    match document.get_mut(head) {
        Some(Bson::Document(inner)) => set_path(inner, rest, value),
        _ => Err(malformed(format!("cannot create field `{}` inside non-document `{}`", rest, head))),
    }
}

/// Removes the value at a dotted path.
pub(crate) fn remove_path(document: &mut Document, path: &str) -> Option<Bson> {
    match path.split_once('.') {
        None => document.remove(path),
        Some((head, rest)) => match document.get_mut(head) {
            Some(Bson::Document(inner)) => remove_path(inner, rest),
            _ => None,
        },
    }
}

pub(crate) fn truthy(value: &Bson) -> bool {
    match value {
        Bson::Boolean(b) => *b,
        Bson::Int32(n) => *n != 0,
        Bson::Int64(n) => *n != 0,
        Bson::Double(n) => *n != 0.0,
        Bson::Null => false,
        _ => true,
    }
}

fn is_operator_document(document: &Document) -> bool {
    document.keys().next().is_some_and(|key| key.starts_with('$'))
}

fn clauses<'f>(operator: &str, condition: &'f Bson) -> ShardocResult<Vec<&'f Document>> {
    let items = match condition {
        Bson::Array(items) if !items.is_empty() => items,
        _ => return Err(malformed(format!("{} expects a non-empty array", operator))),
    };

    items
        .iter()
        .map(|item| {
            item.as_document()
                .ok_or_else(|| malformed(format!("{} entries must be documents", operator)))
        })
        .collect()
}

/// Whether `document` satisfies `filter`.
///
/// Supports `$and`, `$or`, `$nor` and, per field, `$eq`, `$ne`, `$gt`, `$gte`,
/// `$lt`, `$lte`, `$in`, `$nin`, `$exists` and `$not`. Unknown operators fail.
pub(crate) fn matches(document: &Document, filter: &Document) -> ShardocResult<bool> {
    for (key, condition) in filter {
        let matched = match key.as_str() {
            "$and" => {
                let mut all = true;
                for clause in clauses(key, condition)? {
                    if !matches(document, clause)? {
                        all = false;
                        break;
                    }
                }
                all
            }
            "$or" | "$nor" => {
                let mut any = false;
                for clause in clauses(key, condition)? {
                    if matches(document, clause)? {
                        any = true;
                        break;
                    }
                }
                if key == "$or" { any } else { !any }
            }
            operator if operator.starts_with('$') => {
                return Err(malformed(format!("unknown top-level operator {}", operator)));
            }
            path => matches_field(lookup(document, path), condition)?,
        };

        if !matched {
            return Ok(false);
        }
    }

    Ok(true)
}

fn matches_field(value: Option<&Bson>, condition: &Bson) -> ShardocResult<bool> {
    match condition {
        Bson::Document(operators) if is_operator_document(operators) => {
            for (operator, operand) in operators {
                if !apply_operator(value, operator, operand)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        _ => Ok(equals(value, condition)),
    }
}

/// Equality, where an array field also matches when one of its elements does.
fn equals(value: Option<&Bson>, expected: &Bson) -> bool {
    let target = Comparable::from(expected);

    match value {
        None => matches!(expected, Bson::Null),
        Some(Bson::Array(items)) if !matches!(expected, Bson::Array(_)) => {
            items.iter().any(|item| Comparable::from(item) == target)
        }
        Some(value) => Comparable::from(value) == target,
    }
}

fn compare(value: Option<&Bson>, operand: &Bson, accept: fn(Ordering) -> bool) -> bool {
    let target = Comparable::from(operand);
    let satisfies = |candidate: &Bson| {
        Comparable::from(candidate)
            .partial_cmp(&target)
            .is_some_and(accept)
    };

    match value {
        None => false,
        Some(Bson::Array(items)) if !matches!(operand, Bson::Array(_)) => items.iter().any(satisfies),
        Some(value) => satisfies(value),
    }
}

fn apply_operator(value: Option<&Bson>, operator: &str, operand: &Bson) -> ShardocResult<bool> {
    match operator {
        "$eq" => Ok(equals(value, operand)),
        "$ne" => Ok(!equals(value, operand)),
        "$gt" => Ok(compare(value, operand, Ordering::is_gt)),
        "$gte" => Ok(compare(value, operand, Ordering::is_ge)),
        "$lt" => Ok(compare(value, operand, Ordering::is_lt)),
        "$lte" => Ok(compare(value, operand, Ordering::is_le)),
        "$in" | "$nin" => {
            let candidates = operand
                .as_array()
                .ok_or_else(|| malformed(format!("{} expects an array", operator)))?;
            let found = candidates.iter().any(|candidate| equals(value, candidate));
            Ok(if operator == "$in" { found } else { !found })
        }
        "$exists" => Ok(truthy(operand) == value.is_some()),
        "$not" => match operand {
            Bson::Document(inner) if is_operator_document(inner) => Ok(!matches_field(value, operand)?),
            _ => Err(malformed("$not expects an operator document".to_string())),
        },
        other => Err(malformed(format!("unknown operator {}", other))),
    }
}

/// Sorts in place, stable, by each key in turn. Missing fields sort as null.
pub(crate) fn sort_documents(documents: &mut [Document], sort: &[Sort]) {
    if sort.is_empty() {
        return;
    }

    documents.sort_by(|a, b| {
        for key in sort {
            let left = lookup(a, &key.field)
                .map(Comparable::from)
                .unwrap_or(Comparable::Null);
            let right = lookup(b, &key.field)
                .map(Comparable::from)
                .unwrap_or(Comparable::Null);

            let ordering = match key.direction {
                SortDirection::Asc => left.sort_cmp(&right),
                SortDirection::Desc => right.sort_cmp(&left),
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }

        Ordering::Equal
    });
}

/// Applies an inclusion or exclusion projection.
///
/// `_id` is kept by an inclusion projection unless explicitly excluded.
pub(crate) fn project(document: Document, projection: &Document) -> ShardocResult<Document> {
    let inclusive = projection
        .iter()
        .any(|(field, flag)| field != ID_FIELD && truthy(flag));

    if !inclusive {
        let mut projected = document;
        for (field, _) in projection.iter().filter(|(_, flag)| !truthy(flag)) {
            remove_path(&mut projected, field);
        }
        return Ok(projected);
    }

    let mut projected = Document::new();
    if projection.get(ID_FIELD).is_none_or(truthy) {
        if let Some(id) = document.get(ID_FIELD) {
            projected.insert(ID_FIELD, id.clone());
        }
    }

    for (field, flag) in projection {
        if field == ID_FIELD || !truthy(flag) {
            continue;
        }
        if let Some(value) = lookup(&document, field) {
            set_path(&mut projected, field, value.clone())?;
        }
    }

    Ok(projected)
}

fn increment(current: Option<&Bson>, by: &Bson, path: &str) -> ShardocResult<Bson> {
    let sum = match (current, by) {
        (None, Bson::Int32(_) | Bson::Int64(_) | Bson::Double(_)) => Some(by.clone()),
        (Some(Bson::Int32(a)), Bson::Int32(b)) => Some(
            a.checked_add(*b)
                .map(Bson::Int32)
                .unwrap_or(Bson::Int64(i64::from(*a) + i64::from(*b))),
        ),
        (Some(Bson::Int32(a)), Bson::Int64(b)) => i64::from(*a).checked_add(*b).map(Bson::Int64),
        (Some(Bson::Int64(a)), Bson::Int32(b)) => a.checked_add(i64::from(*b)).map(Bson::Int64),
        (Some(Bson::Int64(a)), Bson::Int64(b)) => a.checked_add(*b).map(Bson::Int64),
        (Some(a), b) => match (Comparable::from(a), Comparable::from(b)) {
            (Comparable::Number(a), Comparable::Number(b)) => Some(Bson::Double(a + b)),
            (Comparable::Integer(a), Comparable::Number(b)) | (Comparable::Number(b), Comparable::Integer(a)) => {
                Some(Bson::Double(a as f64 + b))
            }
            _ => None,
        },
        _ => None,
    };

    sum.ok_or_else(|| malformed(format!("cannot apply $inc to `{}`", path)))
}

/// Applies an update document made of `$set`, `$unset`, `$inc` and `$setOnInsert`.
///
/// `$setOnInsert` only takes effect when `inserting` is set. The identifier is immutable.
pub(crate) fn apply_update(document: &mut Document, update: &Document, inserting: bool) -> ShardocResult<()> {
    if update.is_empty() {
        return Err(malformed("update document is empty".to_string()));
    }

    for (operator, fields) in update {
        let fields = match fields {
            Bson::Document(fields) if operator.starts_with('$') => fields,
            _ => {
                return Err(malformed(format!(
                    "update field `{}` is not an operator, replacements are not supported",
                    operator
                )));
            }
        };

        for (path, value) in fields {
            if path == ID_FIELD && operator != "$setOnInsert" {
                let unchanged = operator == "$set"
                    && document
                        .get(ID_FIELD)
                        .is_none_or(|id| Comparable::from(id) == Comparable::from(value));
                if !unchanged {
                    return Err(malformed("the `_id` field is immutable".to_string()));
                }
            }

            match operator.as_str() {
                "$set" => set_path(document, path, value.clone())?,
                "$setOnInsert" if inserting => set_path(document, path, value.clone())?,
                "$setOnInsert" => {}
                "$unset" => {
                    remove_path(document, path);
                }
                "$inc" => {
                    let next = increment(lookup(document, path), value, path)?;
                    set_path(document, path, next)?;
                }
                other => return Err(malformed(format!("unsupported update operator {}", other))),
            }
        }
    }

    Ok(())
}

/// The document an upsert starts from: the equality conditions of `filter`.
pub(crate) fn upsert_seed(filter: &Document) -> ShardocResult<Document> {
    let mut seed = Document::new();
    collect_equalities(filter, &mut seed)?;

    Ok(seed)
}

fn collect_equalities(filter: &Document, seed: &mut Document) -> ShardocResult<()> {
    for (key, condition) in filter {
        if key == "$and" {
            for clause in clauses(key, condition)? {
                collect_equalities(clause, seed)?;
            }
            continue;
        }
        if key.starts_with('$') {
            continue;
        }

        match condition {
            Bson::Document(operators) if is_operator_document(operators) => {
                if let Some(value) = operators.get("$eq") {
                    set_path(seed, key, value.clone())?;
                }
            }
            other => set_path(seed, key, other.clone())?,
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    fn user() -> Document {
        doc! {
            "_id": "u1",
            "place": 3,
            "deleted": false,
            "tags": ["gold", "early"],
            "profile": { "country": "NL", "score": 12.5 },
        }
    }

    #[test]
    fn field_operators() {
        let user = user();
        assert!(matches(&user, &doc! { "place": 3_i64 }).unwrap());
        assert!(matches(&user, &doc! { "place": { "$gte": 3, "$lt": 4.5 } }).unwrap());
        assert!(!matches(&user, &doc! { "place": { "$gt": 3 } }).unwrap());
        assert!(matches(&user, &doc! { "place": { "$in": [1, 2, 3] } }).unwrap());
        assert!(matches(&user, &doc! { "place": { "$nin": [1, 2] } }).unwrap());
        assert!(matches(&user, &doc! { "missing": { "$ne": 1 } }).unwrap());
        assert!(matches(&user, &doc! { "missing": { "$exists": false } }).unwrap());
        assert!(matches(&user, &doc! { "missing": null }).unwrap());
        assert!(!matches(&user, &doc! { "place": { "$gt": "a" } }).unwrap());
    }

    #[test]
    fn large_integers_compare_exactly() {
        let event = doc! { "_id": 9_007_199_254_740_993_i64 };
        assert!(matches(&event, &doc! { "_id": 9_007_199_254_740_993_i64 }).unwrap());
        assert!(!matches(&event, &doc! { "_id": 9_007_199_254_740_992_i64 }).unwrap());
        assert!(matches(&event, &doc! { "_id": { "$gt": 9_007_199_254_740_992_i64 } }).unwrap());
        assert!(matches(&doc! { "n": 2 }, &doc! { "n": 2.0 }).unwrap());
    }

    #[test]
    fn dotted_paths_and_arrays() {
        let user = user();
        assert!(matches(&user, &doc! { "profile.country": "NL" }).unwrap());
        assert!(matches(&user, &doc! { "profile.score": { "$gt": 12 } }).unwrap());
        assert!(matches(&user, &doc! { "tags": "gold" }).unwrap());
        assert!(matches(&user, &doc! { "tags.1": "early" }).unwrap());
        assert!(matches(&user, &doc! { "tags": ["gold", "early"] }).unwrap());
    }

    #[test]
    fn logical_operators() {
        let user = user();
        assert!(matches(&user, &doc! { "$or": [{ "place": 1 }, { "deleted": false }] }).unwrap());
        assert!(!matches(&user, &doc! { "$nor": [{ "place": 1 }, { "deleted": false }] }).unwrap());
        assert!(matches(&user, &doc! { "$and": [{ "place": 3 }], "deleted": false }).unwrap());
        assert!(matches(&user, &doc! { "place": { "$not": { "$gt": 5 } } }).unwrap());
        assert!(matches(&user, &doc! { "$where": "true" }).is_err());
        assert!(matches(&user, &doc! { "place": { "$regex": "3" } }).is_err());
    }

    #[test]
    fn projections() {
        let projected = project(user(), &doc! { "place": 1, "profile.country": 1 }).unwrap();
        assert_eq!(projected, doc! { "_id": "u1", "place": 3, "profile": { "country": "NL" } });

        let without_id = project(user(), &doc! { "place": 1, "_id": 0 }).unwrap();
        assert_eq!(without_id, doc! { "place": 3 });

        let excluded = project(doc! { "_id": 1, "a": 1, "b": 2 }, &doc! { "b": 0 }).unwrap();
        assert_eq!(excluded, doc! { "_id": 1, "a": 1 });
    }

    #[test]
    fn sorts_by_several_keys() {
        let mut documents = vec![
            doc! { "n": "c", "place": 2 },
            doc! { "n": "a", "place": 1 },
            doc! { "n": "b", "place": 2 },
            doc! { "n": "d" },
        ];
        sort_documents(
            &mut documents,
            &[
                Sort { field: "place".into(), direction: SortDirection::Desc },
                Sort { field: "n".into(), direction: SortDirection::Asc },
            ],
        );

        let order = documents
            .iter()
            .map(|d| d.get_str("n").unwrap())
            .collect::<Vec<_>>();
        assert_eq!(order, vec!["b", "c", "a", "d"]);
    }

    #[test]
    fn update_operators() {
        let mut document = doc! { "_id": "c", "seq": 1_i64, "old": true };
        apply_update(
            &mut document,
            &doc! { "$inc": { "seq": 1 }, "$set": { "meta.at": 5 }, "$unset": { "old": "" } },
            false,
        )
        .unwrap();
        assert_eq!(document, doc! { "_id": "c", "seq": 2_i64, "meta": { "at": 5 } });

        assert!(apply_update(&mut document, &doc! { "$set": { "_id": "other" } }, false).is_err());
        assert!(apply_update(&mut document, &doc! { "seq": 4 }, false).is_err());
        assert!(apply_update(&mut document, &doc! { "$inc": { "meta": 1 } }, false).is_err());
    }

    #[test]
    fn upsert_seed_takes_equalities() {
        let seed = upsert_seed(&doc! {
            "_id": "top_users",
            "place": { "$gt": 1 },
            "kind": { "$eq": "daily" },
            "$and": [{ "region.code": "eu" }],
        })
        .unwrap();
        assert_eq!(seed, doc! { "_id": "top_users", "kind": "daily", "region": { "code": "eu" } });
    }
}
