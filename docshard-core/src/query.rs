//! Filters, find options and the default-filter merge.
//!
//! Filters are plain query documents. They can be written with [`bson::doc!`] or
//! built with the [`Filter`] helpers, which produce an [`Expr`] that converts into a
//! query document:
//!
//! ```ignore
//! use docshard::query::Filter;
//!
//! let filter = Filter::eq("status", "active").and(Filter::gt("age", 18));
//! let users = collection.load(filter, FindOptions::default()).await?;
//! ```
//!
//! Every query issued through a typed collection is sent with
//! [`merge_filter`]`(default_filter, filter)`: the collection's default filter
//! overridden key by key by the caller's filter.

use bson::{Bson, Document, doc};
use tracing::warn;

use crate::error::{ShardocError, ShardocResult};

/// Sort direction for query results.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    /// Ascending order (A to Z, 0 to 9, earliest to latest).
    Asc,
    /// Descending order (Z to A, 9 to 0, latest to earliest).
    Desc,
}

impl SortDirection {
    /// The numeric form used in sort documents.
    pub fn as_i32(self) -> i32 {
        match self {
            SortDirection::Asc => 1,
            SortDirection::Desc => -1,
        }
    }
}

/// One key of a sort specification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sort {
    /// The field name to sort by.
    pub field: String,
    /// The sort direction.
    pub direction: SortDirection,
}

/// Kind of cursor opened by a find.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CursorType {
    /// A regular cursor, exhausted once the last result is returned.
    #[default]
    NonTailable,
    /// A cursor left open after the last result, for capped collections.
    Tailable,
    /// A tailable cursor whose fetches block for a while waiting for new data.
    TailableAwait,
}

/// Options accepted by finds.
///
/// `extra` carries additional driver options by name (for example `comment`,
/// `hint`, `maxTimeMS`, `batchSize`, `allowDiskUse`). Backends ignore names they
/// do not know.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FindOptions {
    /// Fields to return, `None` for every field.
    pub projection: Option<Document>,
    /// Number of documents to skip.
    pub skip: Option<u64>,
    /// Maximum number of documents to return.
    pub limit: Option<i64>,
    /// Sort keys, applied in order.
    pub sort: Vec<Sort>,
    /// Kind of cursor to open.
    pub cursor_type: CursorType,
    /// Additional driver options.
    pub extra: Document,
}

impl FindOptions {
    /// Creates a builder for find options.
    pub fn builder() -> FindOptionsBuilder {
        FindOptionsBuilder::default()
    }

    /// The sort specification as a document, `None` when unsorted.
    pub fn sort_document(&self) -> Option<Document> {
        if self.sort.is_empty() {
            return None;
        }

        Some(
            self.sort
                .iter()
                .map(|sort| (sort.field.clone(), Bson::Int32(sort.direction.as_i32())))
                .collect(),
        )
    }
}

/// Fluent construction of [`FindOptions`].
#[derive(Debug, Clone, Default)]
pub struct FindOptionsBuilder {
    options: FindOptions,
}

impl FindOptionsBuilder {
    /// Sets the projection document.
    pub fn projection(mut self, projection: Document) -> Self {
        self.options.projection = Some(projection);
        self
    }

    /// Sets the number of documents to skip.
    pub fn skip(mut self, skip: u64) -> Self {
        self.options.skip = Some(skip);
        self
    }

    /// Sets the maximum number of documents to return.
    pub fn limit(mut self, limit: i64) -> Self {
        self.options.limit = Some(limit);
        self
    }

    /// Appends a sort key.
    pub fn sort(mut self, field: impl Into<String>, direction: SortDirection) -> Self {
        self.options.sort.push(Sort { field: field.into(), direction });
        self
    }

    /// Sets the cursor type.
    pub fn cursor_type(mut self, cursor_type: CursorType) -> Self {
        self.options.cursor_type = cursor_type;
        self
    }

    /// Adds a driver option by name.
    pub fn extra(mut self, name: impl Into<String>, value: impl Into<Bson>) -> Self {
        self.options.extra.insert(name.into(), value.into());
        self
    }

    /// Builds the options.
    pub fn build(self) -> FindOptions {
        self.options
    }
}

/// Returns `default_filter` overridden key by key by `filter`.
pub fn merge_filter(default_filter: &Document, filter: Document) -> Document {
    let mut merged = default_filter.clone();
    for (key, value) in filter {
        merged.insert(key, value);
    }
    merged
}

/// Removes a caller-supplied option the collection derives itself, with a warning.
pub(crate) fn strip_extra(options: &mut FindOptions, name: &str, operation: &str) {
    if options.extra.remove(name).is_some() {
        warn!(option = name, operation, "option is not permitted here and was dropped");
    }
}

/// Drops a caller-supplied projection, with a warning.
pub(crate) fn strip_projection(options: &mut FindOptions, operation: &str) {
    if options.projection.take().is_some() {
        warn!(option = "projection", operation, "option is not permitted here and was dropped");
    }
    strip_extra(options, "fields", operation);
    strip_extra(options, "projection", operation);
}

/// Rejects a caller-supplied `cursor` option on one-shot reads.
pub(crate) fn reject_cursor(options: &FindOptions, operation: &str) -> ShardocResult<()> {
    if options.extra.contains_key("cursor") {
        warn!(option = "cursor", operation, "cursor is not permitted here, use cursor()/next()");
        return Err(ShardocError::State(format!(
            "`cursor` is not accepted by {}, use cursor()/next() instead",
            operation
        )));
    }
    Ok(())
}

/// Field comparison operators for filter expressions.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldOp {
    /// Equal to (exact match).
    Eq,
    /// Not equal to.
    Ne,
    /// Greater than.
    Gt,
    /// Greater than or equal to.
    Gte,
    /// Less than.
    Lt,
    /// Less than or equal to.
    Lte,
    /// Field equals any of the values.
    AnyOf,
    /// Field equals none of the values.
    NoneOf,
}

impl FieldOp {
    /// The query operator for this comparison.
    pub fn operator(&self) -> &'static str {
        match self {
            FieldOp::Eq => "$eq",
            FieldOp::Ne => "$ne",
            FieldOp::Gt => "$gt",
            FieldOp::Gte => "$gte",
            FieldOp::Lt => "$lt",
            FieldOp::Lte => "$lte",
            FieldOp::AnyOf => "$in",
            FieldOp::NoneOf => "$nin",
        }
    }
}

/// A filter expression.
///
/// Expressions can be combined using logical operators (`And`, `Or`, `Not`)
/// and convert into a query document with [`Expr::to_document`].
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// Logical AND of multiple expressions (all must match).
    And(Vec<Expr>),
    /// Logical OR of multiple expressions (any must match).
    Or(Vec<Expr>),
    /// Logical NOT of an expression (inverts the result).
    Not(Box<Expr>),
    /// Checks if a field exists or doesn't exist.
    Exists(String, bool),
    /// Field comparison expression.
    Field {
        /// The field name (or dotted path) to compare.
        field: String,
        /// The comparison operator.
        op: FieldOp,
        /// The value to compare against.
        value: Bson,
    },
}

impl Expr {
    /// Creates a field comparison expression.
    pub fn field(field: String, op: FieldOp, value: Bson) -> Self {
        Expr::Field { field, op, value }
    }

    /// Combines this expression with another using logical AND.
    pub fn and(self, other: Expr) -> Self {
        match self {
            Expr::And(mut list) => {
                list.push(other);
                Expr::And(list)
            }
            _ => Expr::And(vec![self, other]),
        }
    }

    /// Combines this expression with another using logical OR.
    pub fn or(self, other: Expr) -> Self {
        match self {
            Expr::Or(mut list) => {
                list.push(other);
                Expr::Or(list)
            }
            _ => Expr::Or(vec![self, other]),
        }
    }

    /// Negates this expression (logical NOT).
    pub fn not(self) -> Self {
        Expr::Not(Box::new(self))
    }

    /// Translates this expression into a query document.
    pub fn to_document(&self) -> Document {
        FilterTranslator.visit_expr(self)
    }
}

impl From<Expr> for Document {
    fn from(expr: Expr) -> Self {
        expr.to_document()
    }
}

/// Helper for constructing filter expressions.
pub struct Filter;

impl Filter {
    /// Matches documents where the field equals the value.
    pub fn eq(field: impl Into<String>, value: impl Into<Bson>) -> Expr {
        Expr::field(field.into(), FieldOp::Eq, value.into())
    }

    /// Matches documents where the field does not equal the value.
    pub fn ne(field: impl Into<String>, value: impl Into<Bson>) -> Expr {
        Expr::field(field.into(), FieldOp::Ne, value.into())
    }

    /// Matches documents where the field is greater than the value.
    pub fn gt(field: impl Into<String>, value: impl Into<Bson>) -> Expr {
        Expr::field(field.into(), FieldOp::Gt, value.into())
    }

    /// Matches documents where the field is greater than or equal to the value.
    pub fn gte(field: impl Into<String>, value: impl Into<Bson>) -> Expr {
        Expr::field(field.into(), FieldOp::Gte, value.into())
    }

    /// Matches documents where the field is less than the value.
    pub fn lt(field: impl Into<String>, value: impl Into<Bson>) -> Expr {
        Expr::field(field.into(), FieldOp::Lt, value.into())
    }

    /// Matches documents where the field is less than or equal to the value.
    pub fn lte(field: impl Into<String>, value: impl Into<Bson>) -> Expr {
        Expr::field(field.into(), FieldOp::Lte, value.into())
    }

    /// Matches documents where the field exists.
    pub fn exists(field: impl Into<String>) -> Expr {
        Expr::Exists(field.into(), true)
    }

    /// Matches documents where the field is missing.
    pub fn not_exists(field: impl Into<String>) -> Expr {
        Expr::Exists(field.into(), false)
    }

    /// All expressions must match.
    pub fn and(exprs: impl IntoIterator<Item = Expr>) -> Expr {
        Expr::And(exprs.into_iter().collect())
    }

    /// Any expression may match.
    pub fn or(exprs: impl IntoIterator<Item = Expr>) -> Expr {
        Expr::Or(exprs.into_iter().collect())
    }

    /// Matches documents where the field equals any of the values.
    pub fn any_of<V: Into<Bson>>(field: impl Into<String>, values: impl IntoIterator<Item = V>) -> Expr {
        Expr::field(
            field.into(),
            FieldOp::AnyOf,
            Bson::Array(values.into_iter().map(Into::into).collect()),
        )
    }

    /// Matches documents where the field equals none of the values.
    pub fn none_of<V: Into<Bson>>(field: impl Into<String>, values: impl IntoIterator<Item = V>) -> Expr {
        Expr::field(
            field.into(),
            FieldOp::NoneOf,
            Bson::Array(values.into_iter().map(Into::into).collect()),
        )
    }
}

/// Visitor over filter expressions.
pub trait QueryVisitor {
    type Output;

    fn visit_and(&mut self, exprs: &[Expr]) -> Self::Output;
    fn visit_or(&mut self, exprs: &[Expr]) -> Self::Output;
    fn visit_not(&mut self, expr: &Expr) -> Self::Output;
    fn visit_exists(&mut self, field: &str, should_exist: bool) -> Self::Output;
    fn visit_field(&mut self, field: &str, op: &FieldOp, value: &Bson) -> Self::Output;

    fn visit_expr(&mut self, expr: &Expr) -> Self::Output {
        match expr {
            Expr::And(exprs) => self.visit_and(exprs),
            Expr::Or(exprs) => self.visit_or(exprs),
            Expr::Not(expr) => self.visit_not(expr),
            Expr::Exists(field, should_exist) => self.visit_exists(field, *should_exist),
            Expr::Field { field, op, value } => self.visit_field(field, op, value),
        }
    }
}

/// Translates filter expressions into query documents.
struct FilterTranslator;

impl QueryVisitor for FilterTranslator {
    type Output = Document;

    fn visit_and(&mut self, exprs: &[Expr]) -> Document {
        doc! { "$and": exprs.iter().map(|expr| self.visit_expr(expr)).collect::<Vec<_>>() }
    }

    fn visit_or(&mut self, exprs: &[Expr]) -> Document {
        doc! { "$or": exprs.iter().map(|expr| self.visit_expr(expr)).collect::<Vec<_>>() }
    }

    // `$not` only applies to a field's operator, so a whole-expression negation is a one-element `$nor`.
    fn visit_not(&mut self, expr: &Expr) -> Document {
        doc! { "$nor": [self.visit_expr(expr)] }
    }

    fn visit_exists(&mut self, field: &str, should_exist: bool) -> Document {
        doc! { field: { "$exists": should_exist } }
    }

    fn visit_field(&mut self, field: &str, op: &FieldOp, value: &Bson) -> Document {
        doc! { field: { op.operator(): value.clone() } }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn caller_filter_overrides_default_key_by_key() {
        let default_filter = doc! { "deleted": false, "tenant": "a" };
        let merged = merge_filter(&default_filter, doc! { "tenant": "b", "place": 1 });

        assert_eq!(merged, doc! { "deleted": false, "tenant": "b", "place": 1 });
        assert_eq!(default_filter, doc! { "deleted": false, "tenant": "a" });
    }

    #[test]
    fn empty_filter_yields_default() {
        let default_filter = doc! { "deleted": false };
        assert_eq!(merge_filter(&default_filter, doc! {}), default_filter);
        assert_eq!(merge_filter(&doc! {}, doc! { "a": 1 }), doc! { "a": 1 });
    }

    #[test]
    fn expressions_translate_to_query_documents() {
        let expr = Filter::eq("status", "active").and(Filter::gt("age", 18));
        assert_eq!(
            Document::from(expr),
            doc! { "$and": [
                { "status": { "$eq": "active" } },
                { "age": { "$gt": 18 } },
            ] }
        );

        assert_eq!(
            Filter::any_of("place", [1, 2]).not().to_document(),
            doc! { "$nor": [{ "place": { "$in": [1, 2] } }] }
        );
        assert_eq!(
            Filter::not_exists("deleted_at").to_document(),
            doc! { "deleted_at": { "$exists": false } }
        );
    }

    #[test]
    fn sort_document_keeps_key_order() {
        let options = FindOptions::builder()
            .sort("place", SortDirection::Desc)
            .sort("_id", SortDirection::Asc)
            .build();
        assert_eq!(options.sort_document(), Some(doc! { "place": -1, "_id": 1 }));
        assert_eq!(FindOptions::default().sort_document(), None);
    }

    #[test]
    fn reserved_options_are_stripped_or_rejected() {
        let mut options = FindOptions::builder()
            .projection(doc! { "place": 1 })
            .extra("fields", "x")
            .extra("comment", "kept")
            .build();
        strip_projection(&mut options, "load");
        assert!(options.projection.is_none());
        assert_eq!(options.extra, doc! { "comment": "kept" });

        let options = FindOptions::builder().extra("cursor", true).build();
        assert!(matches!(reject_cursor(&options, "load"), Err(ShardocError::State(_))));
    }
}
