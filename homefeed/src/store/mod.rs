//! Narrow read/write contract over the persistent document store.
//!
//! Documents are `{ id, fields }` pairs grouped in slash-separated collection
//! paths (`posts`, `users/{viewer}/postVotes`). The feed core only needs bounded
//! queries, a live query that re-emits the matching set on every change, and the
//! three writes the mutation service performs.

use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::mpsc;

use crate::error::StoreError;

pub mod sqlite;

pub use sqlite::SqliteStore;

/// A stored document: identifier plus opaque JSON fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    #[serde(default)]
    pub fields: Map<String, Value>,
}

impl Document {
    pub fn new(id: impl Into<String>, fields: Map<String, Value>) -> Self {
        Self {
            id: id.into(),
            fields,
        }
    }

    /// Build a document from a JSON object literal. Non-object values yield no fields.
    pub fn from_json(id: impl Into<String>, value: Value) -> Self {
        let fields = match value {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self::new(id, fields)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FilterOp {
    Eq(Value),
    In(Vec<Value>),
}

/// Field predicate applied by the store.
#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    pub field: String,
    pub op: FilterOp,
}

impl Filter {
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            op: FilterOp::Eq(value.into()),
        }
    }

    pub fn one_of(field: impl Into<String>, values: Vec<Value>) -> Self {
        Self {
            field: field.into(),
            op: FilterOp::In(values),
        }
    }

    /// Evaluate the predicate in process, for stores without a query engine.
    pub fn matches(&self, document: &Document) -> bool {
        let Some(actual) = document.fields.get(&self.field) else {
            return false;
        };
        match &self.op {
            FilterOp::Eq(expected) => actual == expected,
            FilterOp::In(values) => values.contains(actual),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Ascending,
    Descending,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderBy {
    pub field: String,
    pub direction: Direction,
}

impl OrderBy {
    pub fn descending(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: Direction::Descending,
        }
    }
}

/// Bounded query: filters are AND-ed; without `order_by` results come back in
/// store-native order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    pub filters: Vec<Filter>,
    pub order_by: Option<OrderBy>,
    pub limit: Option<usize>,
}

impl Query {
    pub fn filtered(filters: Vec<Filter>) -> Self {
        Self {
            filters,
            ..Self::default()
        }
    }

    pub fn order_by(mut self, order: OrderBy) -> Self {
        self.order_by = Some(order);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Result of opening a live query: the current matching set, then a stream of
/// full replacement sets, one per change. Dropping `changes` releases the query.
pub struct LiveQuery {
    pub snapshot: Vec<Document>,
    pub changes: BoxStream<'static, Vec<Document>>,
}

/// Adapt the receiving end of a snapshot channel into a live-query change stream.
pub fn change_stream(rx: mpsc::UnboundedReceiver<Vec<Document>>) -> BoxStream<'static, Vec<Document>> {
    stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|docs| (docs, rx)) }).boxed()
}

/// Store read/write contract
#[async_trait::async_trait]
pub trait DocumentStore: Send + Sync {
    async fn query(&self, collection: &str, query: &Query) -> Result<Vec<Document>, StoreError>;

    async fn live_query(&self, collection: &str, filters: &[Filter]) -> Result<LiveQuery, StoreError>;

    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>, StoreError>;

    /// Insert or replace a document.
    async fn set(&self, collection: &str, document: Document) -> Result<(), StoreError>;

    async fn delete(&self, collection: &str, id: &str) -> Result<(), StoreError>;
}
