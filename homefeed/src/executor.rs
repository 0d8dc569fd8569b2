use std::sync::Arc;
use tracing::debug;

use crate::error::SourceUnavailable;
use crate::model::{ContentItem, RANK_FIELD, SOURCE_FIELD};
use crate::store::{DocumentStore, Filter, OrderBy, Query};

/// Label used for the global (unscoped) query in logs and errors
pub const GLOBAL_SOURCE: &str = "*";

/// One bounded query against the posts collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceQuery {
    pub source_key: Option<String>,
    pub order: Option<OrderBy>,
    pub limit: usize,
}

impl SourceQuery {
    /// Global feed ordered by ranking signal, highest first.
    pub fn fallback(limit: usize) -> Self {
        Self {
            source_key: None,
            order: Some(OrderBy::descending(RANK_FIELD)),
            limit,
        }
    }

    /// Items of one source in store-native order.
    pub fn scoped(source_key: impl Into<String>, limit: usize) -> Self {
        Self {
            source_key: Some(source_key.into()),
            order: None,
            limit,
        }
    }

    pub fn label(&self) -> &str {
        self.source_key.as_deref().unwrap_or(GLOBAL_SOURCE)
    }

    fn to_query(&self) -> Query {
        let filters = self
            .source_key
            .iter()
            .map(|key| Filter::eq(SOURCE_FIELD, key.as_str()))
            .collect();
        Query {
            filters,
            order_by: self.order.clone(),
            limit: Some(self.limit),
        }
    }
}

/// Stateless wrapper issuing source queries against the store.
#[derive(Clone)]
pub struct SourceQueryExecutor {
    store: Arc<dyn DocumentStore>,
    collection: String,
}

impl SourceQueryExecutor {
    pub fn new(store: Arc<dyn DocumentStore>, collection: impl Into<String>) -> Self {
        Self {
            store,
            collection: collection.into(),
        }
    }

    /// Run one source query. An empty result is a valid empty vector.
    pub async fn fetch(&self, request: &SourceQuery) -> Result<Vec<ContentItem>, SourceUnavailable> {
        let unavailable = |cause| SourceUnavailable {
            source_key: request.label().to_string(),
            cause,
        };

        let documents = self
            .store
            .query(&self.collection, &request.to_query())
            .await
            .map_err(unavailable)?;

        let items = documents
            .iter()
            .map(|doc| ContentItem::from_document(&self.collection, doc))
            .collect::<Result<Vec<_>, _>>()
            .map_err(unavailable)?;

        debug!(source = request.label(), items = items.len(), "source query complete");
        Ok(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Direction, FilterOp};

    #[test]
    fn fallback_query_orders_by_rank_descending() {
        let query = SourceQuery::fallback(10).to_query();
        assert!(query.filters.is_empty());
        assert_eq!(query.limit, Some(10));
        let order = query.order_by.expect("ordered");
        assert_eq!(order.field, RANK_FIELD);
        assert_eq!(order.direction, Direction::Descending);
    }

    #[test]
    fn scoped_query_filters_by_source_without_ordering() {
        let request = SourceQuery::scoped("rust", 10);
        assert_eq!(request.label(), "rust");

        let query = request.to_query();
        assert_eq!(query.order_by, None);
        assert_eq!(query.filters.len(), 1);
        assert_eq!(query.filters[0].field, SOURCE_FIELD);
        assert_eq!(query.filters[0].op, FilterOp::Eq("rust".into()));
    }
}
