use serde_json::Value;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::error::StoreError;
use crate::model::{votes_collection, ContentItem, VoteRecord, RANK_FIELD, VOTE_ITEM_FIELD};
use crate::store::{DocumentStore, Filter, Query};

/// What a vote did to the item and to the viewer's record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoteOutcome {
    /// Change applied to the item's ranking signal
    pub vote_status_delta: i64,
    /// Viewer's record after the vote; `None` when the vote was withdrawn
    pub record: Option<VoteRecord>,
}

/// Mutation service the presentation hooks are forwarded to.
#[async_trait::async_trait]
pub trait PostActions: Send + Sync {
    async fn vote(&self, viewer_id: &str, item: &ContentItem, delta: i32) -> Result<VoteOutcome, StoreError>;

    async fn delete_post(&self, item: &ContentItem) -> Result<(), StoreError>;

    /// Selection has no persistent effect by default.
    async fn select_post(&self, _item: &ContentItem) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Mutation service writing straight to the document store.
pub struct StorePostActions {
    store: Arc<dyn DocumentStore>,
    posts_collection: String,
}

impl StorePostActions {
    pub fn new(store: Arc<dyn DocumentStore>, posts_collection: impl Into<String>) -> Self {
        Self {
            store,
            posts_collection: posts_collection.into(),
        }
    }

    async fn adjust_rank(&self, item_id: &str, delta: i64) -> Result<(), StoreError> {
        if delta == 0 {
            return Ok(());
        }
        let Some(mut post) = self.store.get(&self.posts_collection, item_id).await? else {
            return Ok(());
        };
        let current = post.fields.get(RANK_FIELD).and_then(Value::as_i64).unwrap_or(0);
        post.fields.insert(RANK_FIELD.to_string(), Value::from(current + delta));
        self.store.set(&self.posts_collection, post).await
    }
}

#[async_trait::async_trait]
impl PostActions for StorePostActions {
    /// New vote adds it, repeating a vote withdraws it, the opposite vote flips it.
    async fn vote(&self, viewer_id: &str, item: &ContentItem, delta: i32) -> Result<VoteOutcome, StoreError> {
        let collection = votes_collection(viewer_id);
        let existing = self
            .store
            .query(
                &collection,
                &Query::filtered(vec![Filter::eq(VOTE_ITEM_FIELD, item.id.as_str())]).limit(1),
            )
            .await?
            .first()
            .map(|doc| VoteRecord::from_document(&collection, doc))
            .transpose()?;

        let outcome = match existing {
            None => {
                let record = VoteRecord {
                    id: Uuid::new_v4().to_string(),
                    item_id: item.id.clone(),
                    vote_value: delta,
                    source_id: item.source_id.clone(),
                };
                self.store.set(&collection, record.to_document()).await?;
                VoteOutcome {
                    vote_status_delta: i64::from(delta),
                    record: Some(record),
                }
            }
            Some(record) if record.vote_value == delta => {
                self.store.delete(&collection, &record.id).await?;
                VoteOutcome {
                    vote_status_delta: -i64::from(delta),
                    record: None,
                }
            }
            Some(mut record) => {
                let change = i64::from(delta) - i64::from(record.vote_value);
                record.vote_value = delta;
                self.store.set(&collection, record.to_document()).await?;
                VoteOutcome {
                    vote_status_delta: change,
                    record: Some(record),
                }
            }
        };

        self.adjust_rank(&item.id, outcome.vote_status_delta).await?;
        info!(
            viewer = viewer_id,
            item = %item.id,
            delta = outcome.vote_status_delta,
            "vote applied"
        );
        Ok(outcome)
    }

    async fn delete_post(&self, item: &ContentItem) -> Result<(), StoreError> {
        self.store.delete(&self.posts_collection, &item.id).await?;
        info!(item = %item.id, "post deleted");
        Ok(())
    }
}
