/*
homefeed - session runner
Composes one viewer's home feed against the SQLite document store and prints the view state.
With --watch the session stays live: vote overlay updates are printed as they arrive and
post actions are read from stdin.
*/

use anyhow::{Context, Result};
use clap::Parser;
use common::{init_db_pool, Config};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use homefeed::actions::StorePostActions;
use homefeed::composer::FeedComposer;
use homefeed::controller::{ControllerEvent, FeedController, ViewState};
use homefeed::membership::{self, Identity};
use homefeed::overlay::VoteOverlaySubscriber;
use homefeed::store::{DocumentStore, SqliteStore};

#[derive(Parser, Debug)]
#[command(name = "homefeed", about = "Compose a viewer's home feed with live vote overlay")]
struct Args {
    /// Path to config.toml
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Viewer id; omit to compose the anonymous feed
    #[arg(long)]
    viewer: Option<String>,

    /// Keep the session open and read commands from stdin
    #[arg(long)]
    watch: bool,

    /// Override log level (info, debug, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Logs go to stderr so stdout stays a clean stream of view states
    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).with_writer(std::io::stderr).init();

    let config = load_config(args.config.clone()).await?;

    let db_path = &config.database.path;
    let pool = match init_db_pool(db_path, config.database.max_connections.unwrap_or(5)).await {
        Ok(p) => p,
        Err(e) => {
            error!(%e, db_path = %db_path, "failed to initialize database pool");
            return Err(e);
        }
    };
    let sqlite = SqliteStore::new(pool, config.overlay.channel_capacity);
    sqlite.ensure_schema().await.context("failed to create document schema")?;
    let store: Arc<dyn DocumentStore> = Arc::new(sqlite);

    let mut controller = FeedController::new(
        FeedComposer::new(store.clone(), config.feed.clone()),
        VoteOverlaySubscriber::new(store.clone()),
        Arc::new(StorePostActions::new(store.clone(), config.feed.posts_collection.clone())),
    );

    // Identity and membership collaborators are resolved up front for a CLI session
    match &args.viewer {
        Some(viewer) => {
            controller.handle(ControllerEvent::IdentityChanged(Identity::signed_in(viewer.as_str())));
            let context = membership::load_context(store.as_ref(), viewer)
                .await
                .with_context(|| format!("failed to load memberships for {}", viewer))?;
            info!(viewer = %viewer, sources = context.subscribed_source_ids.len(), "memberships loaded");
            controller.handle(ControllerEvent::MembershipChanged(context));
        }
        None => controller.handle(ControllerEvent::IdentityChanged(Identity::signed_out())),
    }

    controller.settle().await;
    print_view(controller.view())?;

    if !args.watch {
        return Ok(());
    }

    let mut view = controller.subscribe_view();
    let (events_tx, events_rx) = mpsc::channel(32);
    let session = tokio::spawn(controller.run(events_rx));
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    info!("watching; commands: vote <id> <delta> | delete <id> | select <id> | retry");
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("ctrl-c received, closing session");
                break;
            }
            changed = view.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = view.borrow_and_update().clone();
                print_view(&snapshot)?;
            }
            line = lines.next_line() => match line.context("failed to read stdin")? {
                Some(line) if line.trim().is_empty() => {}
                Some(line) => match parse_command(&line) {
                    Ok(event) => {
                        if events_tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(%e, "ignoring command"),
                },
                None => break,
            },
        }
    }

    drop(events_tx);
    if let Err(join_err) = session.await {
        error!(%join_err, "session task panicked");
    }
    info!("Shutdown complete");
    Ok(())
}

/// Merge config.default.toml with config.toml or the file given on the command line.
async fn load_config(explicit: Option<PathBuf>) -> Result<Config> {
    let default_path = PathBuf::from("config.default.toml");

    let override_path = match explicit {
        Some(p) if !p.exists() => {
            error!(path = ?p, "specified config file not found");
            anyhow::bail!("Config file not found: {}", p.display());
        }
        Some(p) => Some(p),
        None => Some(PathBuf::from("config.toml")).filter(|p| p.exists()),
    };

    let config = Config::load_with_defaults(
        Some(&default_path).filter(|p| p.exists()).map(PathBuf::as_path),
        override_path.as_deref(),
    )
    .await
    .context("failed to load configuration")?;
    info!(default = ?default_path, override = ?override_path, "configuration loaded");
    Ok(config)
}

fn print_view(state: &ViewState) -> Result<()> {
    println!("{}", serde_json::to_string(state).context("failed to serialize view state")?);
    Ok(())
}

fn parse_command(line: &str) -> Result<ControllerEvent> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    let event = match parts.as_slice() {
        ["vote", item_id, delta] => ControllerEvent::Vote {
            item_id: item_id.to_string(),
            delta: delta.parse().with_context(|| format!("invalid vote delta: {}", delta))?,
        },
        ["delete", item_id] => ControllerEvent::DeletePost {
            item_id: item_id.to_string(),
        },
        ["select", item_id] => ControllerEvent::SelectPost {
            item_id: item_id.to_string(),
        },
        ["retry"] => ControllerEvent::Retry,
        _ => anyhow::bail!("unknown command: {}", line.trim()),
    };
    Ok(event)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_session_commands() {
        assert!(matches!(
            parse_command("vote p1 -1").unwrap(),
            ControllerEvent::Vote { ref item_id, delta: -1 } if item_id == "p1"
        ));
        assert!(matches!(
            parse_command("  delete p2 ").unwrap(),
            ControllerEvent::DeletePost { ref item_id } if item_id == "p2"
        ));
        assert!(matches!(parse_command("retry").unwrap(), ControllerEvent::Retry));
        assert!(parse_command("vote p1 up").is_err());
        assert!(parse_command("shout").is_err());
    }
}
