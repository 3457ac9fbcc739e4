//! Reconciles collection changes into the drawing surface.
//!
//! Every change removes the feature from the surface first, then (unless it
//! is a tombstone) decodes the entry and adds it back. Removing first makes
//! duplicate and local-echo deliveries harmless, and turns an update into
//! delete + recreate. Decodes run concurrently; each finishes with its own
//! remove + add under the surface lock.
//!
//! There is no cancellation of in-flight decodes: a decode superseded by a
//! newer change still applies, and the newer change applies after it.

use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::codec::{self, CodecError};
use crate::feature::FeatureId;
use crate::store::{Change, Collection, NodeHandle, Subscription};
use crate::surface::DrawingSurface;

/// Summary of a finished watch loop
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WatchReport {
    /// Features decoded and added to the surface
    pub applied: usize,
    /// Tombstones applied
    pub removed: usize,
    /// Entries that failed to decode
    pub skipped: usize,
}

/// Watches one collection and mirrors it into a drawing surface
pub struct FeatureWatcher<S> {
    collection: Collection,
    surface: Arc<Mutex<S>>,
}

impl<S> Clone for FeatureWatcher<S> {
    fn clone(&self) -> Self {
        Self {
            collection: self.collection.clone(),
            surface: Arc::clone(&self.surface),
        }
    }
}

impl<S: DrawingSurface> FeatureWatcher<S> {
    pub fn new(collection: Collection, surface: Arc<Mutex<S>>) -> Self {
        Self {
            collection,
            surface,
        }
    }

    pub fn surface(&self) -> &Arc<Mutex<S>> {
        &self.surface
    }

    /// Apply one change inline: remove, then decode and add.
    pub async fn apply(&self, change: Change) -> Result<(), CodecError> {
        let id = FeatureId::from(change.key.as_str());
        self.surface.lock().await.delete_by_id(&id);
        if change.is_tombstone() {
            return Ok(());
        }
        let node = self.collection.get(&change.key);
        decode_and_add(node, id, Arc::clone(&self.surface)).await
    }

    /// Consume the subscription until it is cancelled, then wait for the
    /// decodes still in flight.
    pub async fn run(self, mut subscription: Subscription) -> WatchReport {
        let mut report = WatchReport::default();
        let mut pending = JoinSet::new();

        while let Some(change) = subscription.next().await {
            debug!(key = %change.key, tombstone = change.is_tombstone(), "map feature changed");
            let id = FeatureId::from(change.key.as_str());

            self.surface.lock().await.delete_by_id(&id);
            if change.is_tombstone() {
                report.removed += 1;
            } else {
                let node = self.collection.get(&change.key);
                pending.spawn(decode_and_add(node, id, Arc::clone(&self.surface)));
            }

            while let Some(finished) = pending.try_join_next() {
                tally(&mut report, finished);
            }
        }

        while let Some(finished) = pending.join_next().await {
            tally(&mut report, finished);
        }
        debug!(?report, "feature watcher stopped");
        report
    }
}

async fn decode_and_add<H: NodeHandle, S: DrawingSurface>(
    node: H,
    id: FeatureId,
    surface: Arc<Mutex<S>>,
) -> Result<(), CodecError> {
    let feature = codec::decode(&id, &node).await?;
    let mut surface = surface.lock().await;
    surface.delete_by_id(&id);
    surface.add(feature);
    Ok(())
}

fn tally(report: &mut WatchReport, finished: Result<Result<(), CodecError>, tokio::task::JoinError>) {
    match finished {
        Ok(Ok(())) => report.applied += 1,
        Ok(Err(err)) => {
            warn!(%err, "skipping feature that failed to decode");
            report.skipped += 1;
        }
        Err(err) => {
            warn!(%err, "feature decode task failed");
            report.skipped += 1;
        }
    }
}
