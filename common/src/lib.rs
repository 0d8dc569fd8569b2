/*!
common/src/lib.rs

Shared configuration types and DB helper functions for homefeed.

This file provides:
- Config data structures (deserialized from TOML)
- An async loader merging a default config file with an override file
- A helper to initialize the SQLite pool backing the document store
*/

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;
use std::str::FromStr;

/// Database configuration section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the sqlite database file (e.g. "data/homefeed.db")
    pub path: String,
    /// Pool size; SQLite serializes writers anyway so this stays small.
    pub max_connections: Option<u32>,
}

/// Feed composition settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    /// Collection holding content items
    pub posts_collection: String,
    /// Cap of the global, rank-ordered fallback query
    pub fallback_limit: usize,
    /// Cap of each per-source query
    pub scoped_limit: usize,
    /// Maximum number of sources queried per composition
    pub fan_out_cap: usize,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            posts_collection: "posts".to_string(),
            fallback_limit: 10,
            scoped_limit: 10,
            fan_out_cap: 3,
        }
    }
}

/// Live overlay settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OverlayConfig {
    /// Capacity of the store change notifier feeding live queries
    pub channel_capacity: usize,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 256,
        }
    }
}

/// Top-level application configuration (deserialized from config.toml)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    #[serde(default)]
    pub feed: FeedConfig,
    #[serde(default)]
    pub overlay: OverlayConfig,
}

impl Config {
    /// Load configuration from a TOML file asynchronously.
    ///
    /// Example:
    ///   let cfg = Config::from_file("config.toml").await?;
    pub async fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let data = tokio::fs::read_to_string(path.as_ref())
            .await
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;
        let cfg: Config = toml::from_str(&data).context("Failed to parse TOML configuration")?;
        Ok(cfg)
    }

    /// Load configuration with an optional default file and an optional override file.
    /// If both are present, they are merged (override takes precedence).
    pub async fn load_with_defaults(default_path: Option<&Path>, override_path: Option<&Path>) -> Result<Self> {
        let mut config_value = toml::Value::Table(toml::map::Map::new());

        for path in [default_path, override_path].into_iter().flatten() {
            if !path.exists() {
                continue;
            }
            let data = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("Failed to read config: {}", path.display()))?;
            let val: toml::Value = toml::from_str(&data)
                .with_context(|| format!("Failed to parse configuration: {}", path.display()))?;
            merge_toml(&mut config_value, val);
        }

        let cfg: Config = config_value.try_into().context("Failed to parse merged configuration")?;
        Ok(cfg)
    }
}

fn merge_toml(a: &mut toml::Value, b: toml::Value) {
    match (a, b) {
        (toml::Value::Table(a_map), toml::Value::Table(b_map)) => {
            for (k, v) in b_map {
                if let Some(a_val) = a_map.get_mut(&k) {
                    merge_toml(a_val, v);
                } else {
                    a_map.insert(k, v);
                }
            }
        }
        (a_val, b_val) => *a_val = b_val,
    }
}

/// Initialize an SQLite connection pool.
///
/// Creates the parent directory if necessary and returns a WAL-mode pool. The
/// schema is owned by the document store and created by it.
///
/// Example:
///   let pool = init_db_pool("data/homefeed.db", 5).await?;
pub async fn init_db_pool(path: &str, max_connections: u32) -> Result<SqlitePool> {
    if let Some(parent) = Path::new(path).parent() {
        tokio::fs::create_dir_all(parent).await.with_context(|| {
            format!("Failed to create DB parent directory: {}", parent.display())
        })?;
    }

    let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", path))?
        .create_if_missing(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections.max(1))
        .connect_with(options)
        .await
        .with_context(|| format!("Failed to connect to sqlite database at path: {}", path))?;

    Ok(pool)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_sections_fall_back_to_defaults() {
        let toml = r#"
            [database]
            path = "data/test.db"
        "#;

        let cfg: Config = toml::from_str(toml).expect("parse config");
        assert_eq!(cfg.database.path, "data/test.db");
        assert_eq!(cfg.feed.posts_collection, "posts");
        assert_eq!(cfg.feed.fallback_limit, 10);
        assert_eq!(cfg.feed.fan_out_cap, 3);
        assert_eq!(cfg.overlay.channel_capacity, 256);
    }

    #[tokio::test]
    async fn override_file_wins_over_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let default_path = dir.path().join("config.default.toml");
        let override_path = dir.path().join("config.toml");

        tokio::fs::write(
            &default_path,
            "[database]\npath = \"data/default.db\"\n\n[feed]\nfallback_limit = 10\nfan_out_cap = 3\n",
        )
        .await
        .expect("write default");
        tokio::fs::write(&override_path, "[feed]\nfan_out_cap = 5\n")
            .await
            .expect("write override");

        let cfg = Config::load_with_defaults(Some(&default_path), Some(&override_path))
            .await
            .expect("load config");

        assert_eq!(cfg.database.path, "data/default.db");
        assert_eq!(cfg.feed.fan_out_cap, 5);
        assert_eq!(cfg.feed.fallback_limit, 10);
        assert_eq!(cfg.feed.scoped_limit, 10);
    }

    #[tokio::test]
    async fn missing_override_is_ignored() {
        let dir = tempfile::tempdir().expect("tempdir");
        let default_path = dir.path().join("config.default.toml");
        tokio::fs::write(&default_path, "[database]\npath = \"a.db\"\n")
            .await
            .expect("write default");

        let cfg = Config::load_with_defaults(Some(&default_path), Some(&dir.path().join("nope.toml")))
            .await
            .expect("load config");
        assert_eq!(cfg.database.path, "a.db");
    }

    #[tokio::test]
    async fn db_pool_creates_parent_directory() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db_path = dir.path().join("nested").join("homefeed.db");
        let db_path_str = db_path.to_string_lossy().to_string();

        let pool = init_db_pool(&db_path_str, 2).await.expect("init pool");
        let conn = pool.acquire().await.expect("acquire conn");
        drop(conn);
        assert!(db_path.exists());
    }
}
