use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use tracing::warn;

use crate::error::StoreError;
use crate::store::Document;

/// Field carrying an item's source (community) key
pub const SOURCE_FIELD: &str = "communityId";
/// Field carrying an item's ranking signal
pub const RANK_FIELD: &str = "voteStatus";
/// Field of a vote record naming the voted item
pub const VOTE_ITEM_FIELD: &str = "postId";

/// Per-viewer vote collection path.
pub fn votes_collection(viewer_id: &str) -> String {
    format!("users/{}/postVotes", viewer_id)
}

/// A content item as read from the posts collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentItem {
    pub id: String,
    #[serde(rename = "communityId", default)]
    pub source_id: String,
    /// Monotonic vote score
    #[serde(rename = "voteStatus", default)]
    pub vote_status: i64,
    #[serde(rename = "creatorId", default)]
    pub creator_id: String,
    /// Remaining fields, opaque to the feed core
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

impl ContentItem {
    pub fn from_document(collection: &str, document: &Document) -> Result<Self, StoreError> {
        decode(collection, document)
    }
}

/// One viewer's vote on one item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteRecord {
    pub id: String,
    #[serde(rename = "postId")]
    pub item_id: String,
    #[serde(rename = "voteValue")]
    pub vote_value: i32,
    #[serde(rename = "communityId", default)]
    pub source_id: String,
}

impl VoteRecord {
    pub fn from_document(collection: &str, document: &Document) -> Result<Self, StoreError> {
        decode(collection, document)
    }

    pub fn to_document(&self) -> Document {
        let mut fields = Map::new();
        fields.insert(VOTE_ITEM_FIELD.to_string(), Value::from(self.item_id.clone()));
        fields.insert("voteValue".to_string(), Value::from(self.vote_value));
        fields.insert(SOURCE_FIELD.to_string(), Value::from(self.source_id.clone()));
        Document::new(self.id.clone(), fields)
    }
}

/// Item id → the viewer's vote on it
pub type VoteMap = BTreeMap<String, VoteRecord>;

/// Build a vote mapping from documents in emission order; a later record for the
/// same item replaces an earlier one. Malformed records are skipped.
pub fn vote_map(collection: &str, documents: &[Document]) -> VoteMap {
    let mut votes = VoteMap::new();
    for document in documents {
        match VoteRecord::from_document(collection, document) {
            Ok(record) => {
                votes.insert(record.item_id.clone(), record);
            }
            Err(e) => warn!(error = %e, "skipping unreadable vote record"),
        }
    }
    votes
}

/// Identifier set of a feed.
pub fn item_ids(items: &[ContentItem]) -> BTreeSet<String> {
    items.iter().map(|item| item.id.clone()).collect()
}

fn decode<T: serde::de::DeserializeOwned>(collection: &str, document: &Document) -> Result<T, StoreError> {
    let mut fields = document.fields.clone();
    fields.insert("id".to_string(), Value::from(document.id.clone()));
    serde_json::from_value(Value::Object(fields)).map_err(|e| StoreError::Malformed {
        collection: collection.to_string(),
        id: document.id.clone(),
        reason: e.to_string(),
    })
}
