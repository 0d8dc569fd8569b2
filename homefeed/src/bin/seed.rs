use anyhow::{Context, Result};
use clap::Parser;
use common::{init_db_pool, Config};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use homefeed::store::{Document, DocumentStore, SqliteStore};

/// Load fixture documents into the store.
///
/// The fixture is a JSON object mapping collection paths to arrays of documents;
/// each document carries its `id` next to its fields.
#[derive(Parser, Debug)]
#[command(name = "seed", about = "Load fixture documents into the homefeed store")]
struct Args {
    /// Path to config.toml
    #[arg(long, value_name = "FILE", default_value = "config.default.toml")]
    config: PathBuf,

    /// JSON fixture file
    fixture: PathBuf,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    fmt().with_env_filter(EnvFilter::new("info")).init();
    let args = Args::parse();

    let config = Config::from_file(&args.config).await?;
    let pool = init_db_pool(&config.database.path, 1).await?;
    let store = SqliteStore::new(pool, config.overlay.channel_capacity);
    store.ensure_schema().await?;

    let raw = tokio::fs::read_to_string(&args.fixture)
        .await
        .with_context(|| format!("failed to read fixture {}", args.fixture.display()))?;
    let collections: BTreeMap<String, Vec<Map<String, Value>>> =
        serde_json::from_str(&raw).context("fixture must map collection paths to document arrays")?;

    let mut written = 0;
    for (collection, documents) in collections {
        for mut fields in documents {
            let id = match fields.remove("id") {
                Some(Value::String(id)) => id,
                other => anyhow::bail!("document in {} has no string id: {:?}", collection, other),
            };
            store.set(&collection, Document::new(id, fields)).await?;
            written += 1;
        }
        info!(%collection, "collection seeded");
    }

    info!(documents = written, "fixture loaded");
    Ok(())
}
