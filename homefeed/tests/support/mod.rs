#![allow(dead_code)]

use homefeed::actions::{PostActions, VoteOutcome};
use homefeed::error::StoreError;
use homefeed::executor::GLOBAL_SOURCE;
use homefeed::model::{ContentItem, VoteRecord, RANK_FIELD, SOURCE_FIELD};
use homefeed::store::{
    change_stream, Document, DocumentStore, Filter, FilterOp, LiveQuery, Query, SqliteStore,
};
use serde_json::{json, Value};
use sqlx::sqlite::SqlitePoolOptions;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;

pub fn post(id: &str, source: &str, votes: i64) -> Document {
    Document::from_json(
        id,
        json!({
            "communityId": source,
            "voteStatus": votes,
            "creatorId": "creator",
            "title": format!("post {}", id),
        }),
    )
}

pub fn vote(id: &str, item_id: &str, value: i32) -> Document {
    Document::from_json(id, json!({ "postId": item_id, "voteValue": value }))
}

pub fn ids(items: &[ContentItem]) -> Vec<String> {
    items.iter().map(|item| item.id.clone()).collect()
}

/// Poll `condition` until it holds, failing the test after two seconds.
pub async fn eventually<F: FnMut() -> bool>(mut condition: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !condition() {
        assert!(tokio::time::Instant::now() < deadline, "condition not reached in time");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// In-memory SQLite store; a single connection keeps the database alive.
pub async fn sqlite_store() -> SqliteStore {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("Failed to create in-memory sqlite pool");
    let store = SqliteStore::new(pool, 64);
    store.ensure_schema().await.expect("create schema");
    store
}

struct LiveScope {
    collection: String,
    filters: Vec<Filter>,
    tx: mpsc::UnboundedSender<Vec<Document>>,
}

/// Store double with per-source latency and failures, and hand-driven live queries.
#[derive(Default)]
pub struct ScriptedStore {
    posts: Mutex<Vec<Document>>,
    delays: Mutex<HashMap<String, Duration>>,
    failing: Mutex<HashSet<String>>,
    queries: Mutex<Vec<String>>,
    votes: Mutex<HashMap<String, Vec<Document>>>,
    live: Mutex<Vec<LiveScope>>,
}

impl ScriptedStore {
    pub fn with_posts(posts: Vec<Document>) -> Self {
        let store = Self::default();
        *store.posts.lock().unwrap() = posts;
        store
    }

    pub fn set_posts(&self, posts: Vec<Document>) {
        *self.posts.lock().unwrap() = posts;
    }

    pub fn delay(&self, source: &str, delay: Duration) {
        self.delays.lock().unwrap().insert(source.to_string(), delay);
    }

    pub fn set_failing(&self, source: &str, failing: bool) {
        let mut set = self.failing.lock().unwrap();
        if failing {
            set.insert(source.to_string());
        } else {
            set.remove(source);
        }
    }

    /// Source labels of the queries issued so far, `*` for the fallback query.
    pub fn queries(&self) -> Vec<String> {
        self.queries.lock().unwrap().clone()
    }

    pub fn clear_queries(&self) {
        self.queries.lock().unwrap().clear();
    }

    /// Replace a vote collection and push the new set to every open live query on it.
    /// Returns how many live queries received it.
    pub fn push_votes(&self, collection: &str, documents: Vec<Document>) -> usize {
        self.votes
            .lock()
            .unwrap()
            .insert(collection.to_string(), documents.clone());

        let live = self.live.lock().unwrap();
        live.iter()
            .filter(|scope| scope.collection == collection && !scope.tx.is_closed())
            .filter(|scope| scope.tx.send(matching(&documents, &scope.filters)).is_ok())
            .count()
    }

    pub fn open_live_queries(&self, collection: &str) -> usize {
        self.live
            .lock()
            .unwrap()
            .iter()
            .filter(|scope| scope.collection == collection && !scope.tx.is_closed())
            .count()
    }

    pub fn live_queries_opened(&self) -> usize {
        self.live.lock().unwrap().len()
    }
}

fn matching(documents: &[Document], filters: &[Filter]) -> Vec<Document> {
    documents
        .iter()
        .filter(|doc| filters.iter().all(|filter| filter.matches(doc)))
        .cloned()
        .collect()
}

fn source_label(query: &Query) -> String {
    query
        .filters
        .iter()
        .find_map(|filter| match &filter.op {
            FilterOp::Eq(Value::String(source)) if filter.field == SOURCE_FIELD => Some(source.clone()),
            _ => None,
        })
        .unwrap_or_else(|| GLOBAL_SOURCE.to_string())
}

#[async_trait::async_trait]
impl DocumentStore for ScriptedStore {
    async fn query(&self, _collection: &str, query: &Query) -> Result<Vec<Document>, StoreError> {
        let label = source_label(query);
        self.queries.lock().unwrap().push(label.clone());

        let delay = self.delays.lock().unwrap().get(&label).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing.lock().unwrap().contains(&label) {
            return Err(StoreError::Unavailable(format!("{} is down", label)));
        }

        let mut documents = matching(&self.posts.lock().unwrap(), &query.filters);
        if query.order_by.is_some() {
            documents.sort_by_key(|doc| {
                std::cmp::Reverse(doc.fields.get(RANK_FIELD).and_then(Value::as_i64).unwrap_or(0))
            });
        }
        if let Some(limit) = query.limit {
            documents.truncate(limit);
        }
        Ok(documents)
    }

    async fn live_query(&self, collection: &str, filters: &[Filter]) -> Result<LiveQuery, StoreError> {
        let current = self
            .votes
            .lock()
            .unwrap()
            .get(collection)
            .cloned()
            .unwrap_or_default();
        let (tx, rx) = mpsc::unbounded_channel();
        self.live.lock().unwrap().push(LiveScope {
            collection: collection.to_string(),
            filters: filters.to_vec(),
            tx,
        });
        Ok(LiveQuery {
            snapshot: matching(&current, filters),
            changes: change_stream(rx),
        })
    }

    async fn get(&self, _collection: &str, _id: &str) -> Result<Option<Document>, StoreError> {
        Err(StoreError::Unavailable("scripted store is read-only".into()))
    }

    async fn set(&self, _collection: &str, _document: Document) -> Result<(), StoreError> {
        Err(StoreError::Unavailable("scripted store is read-only".into()))
    }

    async fn delete(&self, _collection: &str, _id: &str) -> Result<(), StoreError> {
        Err(StoreError::Unavailable("scripted store is read-only".into()))
    }
}

/// Mutation service double recording what it was asked to do.
#[derive(Default)]
pub struct RecordingActions {
    pub calls: Mutex<Vec<String>>,
    pub fail: Mutex<bool>,
}

impl RecordingActions {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn check(&self) -> Result<(), StoreError> {
        if *self.fail.lock().unwrap() {
            Err(StoreError::Unavailable("mutation service down".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait::async_trait]
impl PostActions for RecordingActions {
    async fn vote(&self, viewer_id: &str, item: &ContentItem, delta: i32) -> Result<VoteOutcome, StoreError> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("vote {} {} {}", viewer_id, item.id, delta));
        self.check()?;
        Ok(VoteOutcome {
            vote_status_delta: i64::from(delta),
            record: Some(VoteRecord {
                id: format!("{}-{}", viewer_id, item.id),
                item_id: item.id.clone(),
                vote_value: delta,
                source_id: item.source_id.clone(),
            }),
        })
    }

    async fn delete_post(&self, item: &ContentItem) -> Result<(), StoreError> {
        self.calls.lock().unwrap().push(format!("delete {}", item.id));
        self.check()
    }

    async fn select_post(&self, item: &ContentItem) -> Result<(), StoreError> {
        self.calls.lock().unwrap().push(format!("select {}", item.id));
        self.check()
    }
}
