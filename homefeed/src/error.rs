use thiserror::Error;

/// Failure of the document store behind a single call.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Transport-level failure reported by a non-SQL backend.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("malformed document {collection}/{id}: {reason}")]
    Malformed {
        collection: String,
        id: String,
        reason: String,
    },
}

/// A single source query could not be served.
#[derive(Debug, Error)]
#[error("source `{source_key}` unavailable: {cause}")]
pub struct SourceUnavailable {
    /// Source key of the failed query, `*` for the global fallback query.
    pub source_key: String,
    #[source]
    pub cause: StoreError,
}

#[derive(Debug, Error)]
pub enum FeedError {
    /// Aggregate failure of one composition pass; eligible for a retry.
    #[error("feed composition failed: {0}")]
    CompositionFailed(#[source] SourceUnavailable),

    /// Contract violation by the caller of the overlay subscriber.
    #[error("invalid subscription request: {0}")]
    InvalidSubscriptionRequest(&'static str),

    #[error("vote overlay unavailable: {0}")]
    OverlayUnavailable(#[source] StoreError),

    #[error("sign-in required to {0}")]
    SignInRequired(&'static str),

    #[error("item `{0}` is not in the current feed")]
    UnknownItem(String),

    #[error("mutation failed: {0}")]
    Mutation(#[source] StoreError),
}

pub type Result<T, E = FeedError> = std::result::Result<T, E>;
