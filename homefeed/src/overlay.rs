//! Live vote overlay.
//!
//! One live query per subscription over the viewer's vote collection, scoped to
//! the displayed item ids. Each emitted record set becomes a full `VoteMap` handed
//! to the caller's callback.

use futures::StreamExt;
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::error::{FeedError, Result};
use crate::model::{vote_map, votes_collection, VoteMap, VOTE_ITEM_FIELD};
use crate::store::{DocumentStore, Filter, LiveQuery};

#[derive(Clone)]
pub struct VoteOverlaySubscriber {
    store: Arc<dyn DocumentStore>,
}

impl VoteOverlaySubscriber {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    /// Open a live subscription delivering the viewer's votes on `item_ids`.
    ///
    /// The current mapping is delivered before this returns; later mappings are
    /// delivered from a background task until the handle is cancelled.
    pub async fn subscribe<F>(
        &self,
        viewer_id: &str,
        item_ids: &BTreeSet<String>,
        on_update: F,
    ) -> Result<SubscriptionHandle>
    where
        F: Fn(VoteMap) + Send + Sync + 'static,
    {
        if viewer_id.is_empty() {
            return Err(FeedError::InvalidSubscriptionRequest("viewer id is absent"));
        }
        if item_ids.is_empty() {
            return Err(FeedError::InvalidSubscriptionRequest("item id set is empty"));
        }

        let collection = votes_collection(viewer_id);
        let scope = Filter::one_of(
            VOTE_ITEM_FIELD,
            item_ids.iter().cloned().map(Value::from).collect(),
        );
        let LiveQuery { snapshot, mut changes } = self
            .store
            .live_query(&collection, &[scope])
            .await
            .map_err(FeedError::OverlayUnavailable)?;

        info!(viewer = viewer_id, items = item_ids.len(), "vote overlay opened");
        on_update(vote_map(&collection, &snapshot));

        let cancelled = Arc::new(AtomicBool::new(false));
        let stopped = cancelled.clone();
        let task = tokio::spawn(async move {
            while let Some(documents) = changes.next().await {
                if stopped.load(Ordering::Acquire) {
                    break;
                }
                on_update(vote_map(&collection, &documents));
            }
            debug!(%collection, "vote overlay stream ended");
        });

        Ok(SubscriptionHandle {
            cancelled,
            task: Some(task),
        })
    }
}

/// Owner of a live overlay subscription. Cancelling (or dropping) it stops
/// deliveries immediately and releases the live query.
#[derive(Debug)]
pub struct SubscriptionHandle {
    cancelled: Arc<AtomicBool>,
    task: Option<JoinHandle<()>>,
}

impl SubscriptionHandle {
    /// Idempotent.
    pub fn cancel(&mut self) {
        self.cancelled.store(true, Ordering::Release);
        if let Some(task) = self.task.take() {
            // Aborting drops the change stream, which closes the live query.
            task.abort();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}
