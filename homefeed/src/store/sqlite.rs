use chrono::Utc;
use serde_json::{Map, Value};
use sqlx::SqlitePool;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

use super::{change_stream, Direction, Document, DocumentStore, Filter, FilterOp, LiveQuery, Query};
use crate::error::StoreError;

/// Document store backed by a single SQLite table of JSON documents.
///
/// Every write publishes the touched collection path on a broadcast channel;
/// live queries listen to it and re-read their matching set.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
    changes: broadcast::Sender<String>,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool, notify_capacity: usize) -> Self {
        let (changes, _) = broadcast::channel(notify_capacity.max(1));
        Self { pool, changes }
    }

    /// Create the documents table if it does not exist yet.
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS documents (
                collection TEXT NOT NULL,
                id TEXT NOT NULL,
                data TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (collection, id)
            );
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    fn notify(&self, collection: &str) {
        // No receivers simply means no live query is open.
        let _ = self.changes.send(collection.to_string());
    }
}

#[async_trait::async_trait]
impl DocumentStore for SqliteStore {
    async fn query(&self, collection: &str, query: &Query) -> Result<Vec<Document>, StoreError> {
        fetch_documents(&self.pool, collection, query).await
    }

    async fn live_query(&self, collection: &str, filters: &[Filter]) -> Result<LiveQuery, StoreError> {
        // Subscribe before the initial read so no change falls between the two.
        let mut notices = self.changes.subscribe();
        let query = Query::filtered(filters.to_vec());
        let snapshot = fetch_documents(&self.pool, collection, &query).await?;

        let (tx, rx) = mpsc::unbounded_channel();
        let pool = self.pool.clone();
        let collection = collection.to_string();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tx.closed() => break,
                    notice = notices.recv() => match notice {
                        Ok(changed) if changed != collection => continue,
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            debug!(%collection, skipped, "live query lagged behind change notices");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }

                match fetch_documents(&pool, &collection, &query).await {
                    Ok(documents) => {
                        if tx.send(documents).is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(%collection, error = %e, "live query refresh failed"),
                }
            }
            debug!(%collection, "live query released");
        });

        Ok(LiveQuery {
            snapshot,
            changes: change_stream(rx),
        })
    }

    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>, StoreError> {
        let row = sqlx::query_as::<_, DocumentRow>(
            "SELECT id, data FROM documents WHERE collection = ? AND id = ?",
        )
        .bind(collection)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| row.into_document(collection)).transpose()
    }

    async fn set(&self, collection: &str, document: Document) -> Result<(), StoreError> {
        let data = serde_json::to_string(&document.fields).map_err(|e| StoreError::Malformed {
            collection: collection.to_string(),
            id: document.id.clone(),
            reason: e.to_string(),
        })?;

        sqlx::query(
            r#"
            INSERT INTO documents (collection, id, data, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT (collection, id) DO UPDATE SET
                data = excluded.data,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(collection)
        .bind(&document.id)
        .bind(data)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        self.notify(collection);
        Ok(())
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM documents WHERE collection = ? AND id = ?")
            .bind(collection)
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() > 0 {
            self.notify(collection);
        }
        Ok(())
    }
}

// Internal row type for SQLx mapping
#[derive(sqlx::FromRow)]
struct DocumentRow {
    id: String,
    data: String,
}

impl DocumentRow {
    fn into_document(self, collection: &str) -> Result<Document, StoreError> {
        let fields: Map<String, Value> =
            serde_json::from_str(&self.data).map_err(|e| StoreError::Malformed {
                collection: collection.to_string(),
                id: self.id.clone(),
                reason: e.to_string(),
            })?;
        Ok(Document::new(self.id, fields))
    }
}

/// SQL parameter in the order it appears in the generated statement.
enum Param {
    Text(String),
    Int(i64),
    Real(f64),
    Null,
}

impl From<&Value> for Param {
    fn from(value: &Value) -> Self {
        match value {
            Value::String(s) => Param::Text(s.clone()),
            Value::Number(n) => match n.as_i64() {
                Some(i) => Param::Int(i),
                None => n.as_f64().map(Param::Real).unwrap_or(Param::Null),
            },
            // json_extract yields 0/1 for JSON booleans
            Value::Bool(b) => Param::Int(i64::from(*b)),
            Value::Null => Param::Null,
            other => Param::Text(other.to_string()),
        }
    }
}

fn json_path(field: &str) -> Param {
    Param::Text(format!("$.\"{}\"", field))
}

async fn fetch_documents(
    pool: &SqlitePool,
    collection: &str,
    query: &Query,
) -> Result<Vec<Document>, StoreError> {
    let mut sql = String::from("SELECT id, data FROM documents WHERE collection = ?");
    let mut params = vec![Param::Text(collection.to_string())];

    for filter in &query.filters {
        match &filter.op {
            FilterOp::Eq(value) => {
                sql.push_str(" AND json_extract(data, ?) = ?");
                params.push(json_path(&filter.field));
                params.push(value.into());
            }
            FilterOp::In(values) if values.is_empty() => sql.push_str(" AND 0"),
            FilterOp::In(values) => {
                let placeholders = vec!["?"; values.len()].join(", ");
                sql.push_str(&format!(" AND json_extract(data, ?) IN ({})", placeholders));
                params.push(json_path(&filter.field));
                params.extend(values.iter().map(Param::from));
            }
        }
    }

    match &query.order_by {
        Some(order) => {
            let direction = match order.direction {
                Direction::Ascending => "ASC",
                Direction::Descending => "DESC",
            };
            sql.push_str(&format!(" ORDER BY json_extract(data, ?) {}, rowid", direction));
            params.push(json_path(&order.field));
        }
        None => sql.push_str(" ORDER BY rowid"),
    }

    if let Some(limit) = query.limit {
        sql.push_str(" LIMIT ?");
        params.push(Param::Int(i64::try_from(limit).unwrap_or(i64::MAX)));
    }

    let mut statement = sqlx::query_as::<_, DocumentRow>(&sql);
    for param in params {
        statement = match param {
            Param::Text(s) => statement.bind(s),
            Param::Int(i) => statement.bind(i),
            Param::Real(r) => statement.bind(r),
            Param::Null => statement.bind(None::<String>),
        };
    }

    let rows = statement.fetch_all(pool).await?;
    rows.into_iter()
        .map(|row| row.into_document(collection))
        .collect()
}
