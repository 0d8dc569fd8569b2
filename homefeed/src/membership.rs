use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::StoreError;
use crate::model::SOURCE_FIELD;
use crate::store::{DocumentStore, Query};

/// Viewer's joined sources, as published by the membership collaborator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersonalizationContext {
    /// Joined source ids in membership order
    pub subscribed_source_ids: Vec<String>,
    /// Membership data finished loading
    pub ready: bool,
}

impl PersonalizationContext {
    pub fn ready<I, S>(source_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            subscribed_source_ids: source_ids.into_iter().map(Into::into).collect(),
            ready: true,
        }
    }
}

/// Identity collaborator output.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Identity {
    pub viewer_id: Option<String>,
    /// Identity lookup has finished
    pub resolved: bool,
}

impl Identity {
    pub fn resolving() -> Self {
        Self::default()
    }

    pub fn signed_in(viewer_id: impl Into<String>) -> Self {
        Self {
            viewer_id: Some(viewer_id.into()),
            resolved: true,
        }
    }

    pub fn signed_out() -> Self {
        Self {
            viewer_id: None,
            resolved: true,
        }
    }
}

pub fn snippets_collection(viewer_id: &str) -> String {
    format!("users/{}/communitySnippets", viewer_id)
}

/// Read a viewer's community snippets into a ready context. A snippet without a
/// `communityId` field is keyed by its document id.
pub async fn load_context(
    store: &dyn DocumentStore,
    viewer_id: &str,
) -> Result<PersonalizationContext, StoreError> {
    let snippets = store
        .query(&snippets_collection(viewer_id), &Query::default())
        .await?;

    let source_ids: Vec<String> = snippets
        .into_iter()
        .map(|doc| match doc.fields.get(SOURCE_FIELD).and_then(Value::as_str) {
            Some(source) => source.to_string(),
            None => doc.id,
        })
        .collect();

    debug!(viewer = viewer_id, sources = source_ids.len(), "membership loaded");
    Ok(PersonalizationContext::ready(source_ids))
}
