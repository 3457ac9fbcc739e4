//! Runtime configuration for the `irohmap` binary.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use tracing::{info, warn};

use crate::store::{default_storage_path, Document};
use crate::sync::{SyncConfig, SyncMode};

/// Collection used when none is given on the command line
pub const DEFAULT_COLLECTION: &str = "map-features";

/// Default autosave period
pub const DEFAULT_AUTOSAVE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct Config {
    /// Collection the watcher and publisher operate on
    pub collection: String,
    /// Where the document is persisted; `None` keeps it in memory only
    pub storage_path: Option<PathBuf>,
    /// Period between saves of a dirty document
    pub autosave: Duration,
    pub sync: SyncConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            collection: DEFAULT_COLLECTION.to_string(),
            storage_path: Some(default_storage_path()),
            autosave: DEFAULT_AUTOSAVE,
            sync: SyncConfig::default(),
        }
    }
}

impl Config {
    /// Load the persisted document, or start a fresh one.
    ///
    /// A document that fails to load is logged and replaced by a fresh one
    /// that will overwrite it on the next save.
    pub fn open_document(&self) -> Result<Document> {
        let Some(path) = &self.storage_path else {
            return Document::new(&[&self.collection]);
        };

        if path.exists() {
            match Document::load(path) {
                Ok(mut doc) => {
                    info!(path = %path.display(), "loaded previous session");
                    for added in doc.ensure_collections(&[&self.collection])? {
                        info!(collection = %added, "added collection to saved document");
                    }
                    return Ok(doc);
                }
                Err(err) => warn!(path = %path.display(), %err, "could not load saved document"),
            }
        }

        let mut doc = Document::new(&[&self.collection])?;
        doc.set_storage_path(path.clone());
        Ok(doc)
    }

    /// Whether the process has work left once gesture input ends.
    ///
    /// A syncing peer keeps mirroring remote edits onto the surface; an
    /// offline one has nothing more to do.
    pub fn outlives_input(&self) -> bool {
        self.sync.mode != SyncMode::Disabled
    }
}
