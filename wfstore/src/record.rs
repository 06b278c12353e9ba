//! The generic persisted-record abstraction.
//!
//! Every domain type the scheduler keeps durable (task proxies, job
//! records, broadcast entries, timers, ...) implements [`Record`] and is
//! stored in one SQLite table per [`Record::collection_name`], with a
//! side index table for fields the store is asked to filter on.

use serde::{Serialize, de::DeserializeOwned};

/// A value a collection can be indexed and filtered on.
#[derive(Debug, Clone, PartialEq)]
pub enum IndexValue {
    Text(String),
    Int(i64),
    Bool(bool),
}

impl IndexValue {
    pub(crate) fn to_sql_text(&self) -> String {
        match self {
            IndexValue::Text(s) => s.clone(),
            IndexValue::Int(i) => i.to_string(),
            IndexValue::Bool(b) => b.to_string(),
        }
    }
}

/// Comparison operator for a [`Filter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl FilterOp {
    pub(crate) fn as_sql(self) -> &'static str {
        match self {
            FilterOp::Eq => "=",
            FilterOp::Ne => "!=",
            FilterOp::Lt => "<",
            FilterOp::Le => "<=",
            FilterOp::Gt => ">",
            FilterOp::Ge => ">=",
        }
    }
}

/// A single equality/comparison constraint evaluated against an indexed
/// field of a collection.
#[derive(Debug, Clone)]
pub struct Filter {
    pub field: &'static str,
    pub op: FilterOp,
    pub value: IndexValue,
}

impl Filter {
    pub fn eq(field: &'static str, value: impl Into<IndexValue>) -> Self {
        Self { field, op: FilterOp::Eq, value: value.into() }
    }
}

impl From<&str> for IndexValue {
    fn from(s: &str) -> Self {
        IndexValue::Text(s.to_string())
    }
}

impl From<String> for IndexValue {
    fn from(s: String) -> Self {
        IndexValue::Text(s)
    }
}

impl From<i64> for IndexValue {
    fn from(i: i64) -> Self {
        IndexValue::Int(i)
    }
}

impl From<bool> for IndexValue {
    fn from(b: bool) -> Self {
        IndexValue::Bool(b)
    }
}

/// Implemented by every type persisted through [`crate::Store`].
///
/// `indexed_fields` is consulted on every insert/update to keep the
/// side index table current, and by `rebuild_indexes` after a bulk load
/// or a schema migration.
pub trait Record: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Unique id within this record's collection.
    fn id(&self) -> &str;

    /// Unix-epoch milliseconds of the last mutation, used for
    /// `updated_at`-ordered reads and for checkpoint comparisons.
    fn updated_at(&self) -> i64;

    /// The table name this record type is stored under.
    fn collection_name() -> &'static str;

    /// Fields to maintain in the side index table, recomputed on every
    /// write.
    fn indexed_fields(&self) -> Vec<(&'static str, IndexValue)> {
        Vec::new()
    }
}
