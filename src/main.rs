use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use irohmap::bridge::{parse_event, JsonLinesSurface};
use irohmap::config::{Config, DEFAULT_COLLECTION};
use irohmap::store::{default_storage_path, Store};
use irohmap::sync::{self, SyncCommand, SyncConfig, SyncEvent, SyncHandle, SyncMode};
use irohmap::{EditPublisher, FeatureWatcher};

/// Collaborative map feature editing over iroh.
///
/// Reads drawing gestures as JSON lines on stdin and writes surface
/// mutations as JSON lines on stdout.
#[derive(Parser, Debug)]
#[command(name = "irohmap")]
#[command(version, about, long_about = None)]
struct Args {
    /// Join an existing session using a ticket
    #[arg(long, value_name = "TICKET", conflicts_with = "offline")]
    join: Option<String>,

    /// Disable sync (offline mode)
    #[arg(long)]
    offline: bool,

    /// Collection holding the features
    #[arg(long, value_name = "NAME", default_value = DEFAULT_COLLECTION)]
    collection: String,

    /// Where the document is persisted
    #[arg(long, value_name = "PATH")]
    storage: Option<PathBuf>,

    /// Keep the document in memory only
    #[arg(long, conflicts_with = "storage")]
    no_persist: bool,

    /// Seconds between autosaves
    #[arg(long, value_name = "N", default_value_t = 5)]
    autosave_secs: u64,
}

impl Args {
    fn into_config(self) -> Config {
        let storage_path = if self.no_persist {
            None
        } else {
            Some(self.storage.unwrap_or_else(default_storage_path))
        };
        let mode = if self.offline {
            SyncMode::Disabled
        } else {
            SyncMode::Active {
                join_ticket: self.join,
            }
        };
        Config {
            collection: self.collection,
            storage_path,
            autosave: Duration::from_secs(self.autosave_secs.max(1)),
            sync: SyncConfig { mode },
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();

    // stdout carries the surface protocol, so logs go to stderr
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = args.into_config();
    let store = Store::new(config.open_document()?);
    let collection = store.collection(config.collection.clone());

    let surface = Arc::new(Mutex::new(JsonLinesSurface::new(std::io::stdout())));
    let subscription = collection.subscribe().await?;
    let cancel = subscription.cancel_handle();
    let watcher = FeatureWatcher::new(collection.clone(), Arc::clone(&surface));
    let watch_task = tokio::spawn(watcher.run(subscription));

    let publisher = EditPublisher::new(collection);

    let mut sync_handle = sync::start_sync(config.sync.clone());
    if let Some(handle) = &sync_handle {
        handle.send_command(SyncCommand::SyncDoc {
            doc: store.snapshot().await,
        })?;
    }

    let mut local_changes = store.local_changes();
    let mut autosave = tokio::time::interval(config.autosave);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut input_open = true;

    loop {
        tokio::select! {
            line = lines.next_line(), if input_open => match line? {
                Some(line) if line.trim().is_empty() => {}
                Some(line) => match parse_event(&line) {
                    Ok(event) => {
                        surface.lock().await.record_gesture(&event);
                        let written = publisher.handle(&event).await;
                        debug!(event = event.name(), written, "gesture published");
                    }
                    Err(err) => warn!(%err, "ignoring gesture line"),
                },
                None if config.outlives_input() && sync_handle.is_some() => {
                    info!("input closed; still syncing until interrupted");
                    input_open = false;
                }
                None => {
                    info!("input closed");
                    break;
                }
            },
            event = next_sync_event(&mut sync_handle) => match event {
                Some(SyncEvent::Ready { ticket }) => {
                    info!("join this session with: irohmap --join {ticket}");
                }
                Some(SyncEvent::RemoteChanges { mut doc }) => {
                    if let Err(err) = store.merge_remote(&mut doc).await {
                        warn!(%err, "failed to merge remote changes");
                    }
                }
                Some(SyncEvent::Error(msg)) => warn!(%msg, "sync error"),
                None => {
                    warn!("sync stopped");
                    sync_handle = None;
                    if !input_open {
                        break;
                    }
                }
            },
            Ok(()) = local_changes.changed() => {
                if let Some(handle) = &sync_handle {
                    let doc = store.snapshot().await;
                    if let Err(err) = handle.send_command(SyncCommand::SyncDoc { doc }) {
                        warn!(%err, "could not hand document to sync");
                    }
                }
            }
            _ = autosave.tick() => {
                if let Err(err) = store.save_if_dirty().await {
                    warn!(%err, "autosave failed");
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                break;
            }
        }
    }

    cancel.cancel();
    let report = watch_task.await?;
    info!(
        applied = report.applied,
        removed = report.removed,
        skipped = report.skipped,
        "feature watcher finished"
    );

    store.save_if_dirty().await?;
    if let Some(handle) = sync_handle {
        handle.shutdown().await;
    }
    Ok(())
}

/// Next sync event, or never when sync is off
async fn next_sync_event(handle: &mut Option<SyncHandle>) -> Option<SyncEvent> {
    match handle {
        Some(handle) => handle.next_event().await,
        None => std::future::pending().await,
    }
}
