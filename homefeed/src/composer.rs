//! Feed composition.
//!
//! A viewer with joined sources gets the concatenation of per-source batches for
//! the first few distinct sources; everyone else gets the global rank-ordered
//! fallback feed. Batches are fetched concurrently but always concatenated in
//! selection order, never in completion order.

use common::FeedConfig;
use futures::future::join_all;
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::{FeedError, Result};
use crate::executor::{SourceQuery, SourceQueryExecutor};
use crate::membership::PersonalizationContext;
use crate::model::ContentItem;
use crate::store::DocumentStore;

/// Ordered feed, rebuilt wholesale on every composition
pub type Feed = Vec<ContentItem>;

#[derive(Clone)]
pub struct FeedComposer {
    executor: SourceQueryExecutor,
    settings: FeedConfig,
}

impl FeedComposer {
    pub fn new(store: Arc<dyn DocumentStore>, settings: FeedConfig) -> Self {
        let executor = SourceQueryExecutor::new(store, settings.posts_collection.clone());
        Self { executor, settings }
    }

    /// First `fan_out_cap` distinct, non-empty source ids, in context order.
    pub fn select_sources<'a>(&self, context: &'a PersonalizationContext) -> Vec<&'a str> {
        let mut selected: Vec<&str> = Vec::with_capacity(self.settings.fan_out_cap);
        for source in &context.subscribed_source_ids {
            if selected.len() == self.settings.fan_out_cap {
                break;
            }
            if !source.is_empty() && !selected.contains(&source.as_str()) {
                selected.push(source.as_str());
            }
        }
        selected
    }

    /// Build the feed for one viewer. Fails as a whole if any source query fails.
    pub async fn compose(&self, context: &PersonalizationContext, viewer_present: bool) -> Result<Feed> {
        let sources = if viewer_present {
            self.select_sources(context)
        } else {
            Vec::new()
        };

        if sources.is_empty() {
            info!(viewer_present, "composing fallback feed");
            return self
                .executor
                .fetch(&SourceQuery::fallback(self.settings.fallback_limit))
                .await
                .map_err(|e| {
                    warn!(error = %e, "fallback query failed");
                    FeedError::CompositionFailed(e)
                });
        }

        info!(?sources, "composing personalized feed");
        let queries: Vec<SourceQuery> = sources
            .iter()
            .map(|source| SourceQuery::scoped(*source, self.settings.scoped_limit))
            .collect();

        // join_all yields results in input order whatever order they complete in
        let batches = join_all(queries.iter().map(|query| self.executor.fetch(query))).await;

        let mut feed = Feed::new();
        for batch in batches {
            let items = batch.map_err(|e| {
                warn!(error = %e, "source query failed; dropping composition");
                FeedError::CompositionFailed(e)
            })?;
            feed.extend(items);
        }

        info!(items = feed.len(), sources = queries.len(), "personalized feed composed");
        Ok(feed)
    }
}
