//! Shared store handle, collection handles and change subscriptions.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, Weak};

use anyhow::Result;
use async_trait::async_trait;
use automerge::Automerge;
use serde_json::Value as JsonValue;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::debug;

use super::{Change, Document, NodeHandle, Scalar, Shallow, StoreError};

/// Handle to the replicated document. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct Store {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").finish()
    }
}

struct Inner {
    doc: Mutex<Document>,
    subscribers: std::sync::Mutex<HashMap<u64, Subscriber>>,
    next_subscriber: AtomicU64,
    /// Bumped on every local write so the sync loop can ship the document
    local_change_tx: watch::Sender<u64>,
}

struct Subscriber {
    collection: String,
    tx: mpsc::UnboundedSender<Change>,
}

impl Inner {
    fn subscribers(&self) -> std::sync::MutexGuard<'_, HashMap<u64, Subscriber>> {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn unsubscribe(&self, id: u64) {
        if self.subscribers().remove(&id).is_some() {
            debug!(subscriber = id, "subscription cancelled");
        }
    }

    /// Fan a change out to every subscriber of `collection`
    fn notify(&self, collection: &str, change: Change) {
        self.subscribers().retain(|_, sub| {
            if sub.collection != collection {
                return true;
            }
            sub.tx.send(change.clone()).is_ok()
        });
    }

    fn watched_collections(&self) -> BTreeSet<String> {
        self.subscribers()
            .values()
            .map(|sub| sub.collection.clone())
            .collect()
    }
}

impl Store {
    pub fn new(document: Document) -> Self {
        let (local_change_tx, _) = watch::channel(0u64);
        Self {
            inner: Arc::new(Inner {
                doc: Mutex::new(document),
                subscribers: std::sync::Mutex::new(HashMap::new()),
                next_subscriber: AtomicU64::new(0),
                local_change_tx,
            }),
        }
    }

    /// Handle to a named collection of entries
    pub fn collection(&self, name: impl Into<String>) -> Collection {
        Collection {
            store: self.clone(),
            name: name.into(),
        }
    }

    /// Receiver that changes whenever a local write lands
    pub fn local_changes(&self) -> watch::Receiver<u64> {
        self.inner.local_change_tx.subscribe()
    }

    /// Clone the automerge document (for sync)
    pub async fn snapshot(&self) -> Automerge {
        self.inner.doc.lock().await.clone_automerge()
    }

    /// Merge a peer's document and notify subscribers of every entry that
    /// changed. Returns the number of changed entries.
    pub async fn merge_remote(&self, remote: &mut Automerge) -> Result<usize, StoreError> {
        let mut doc = self.inner.doc.lock().await;
        let watched = self.inner.watched_collections();

        let mut before = HashMap::new();
        for name in &watched {
            before.insert(name.clone(), doc.materialize(name)?);
        }

        doc.merge(remote)?;

        let mut changed = 0;
        for name in &watched {
            let mut old = before.remove(name).unwrap_or_default();
            for (key, value) in doc.materialize(name)? {
                if old.remove(&key).as_ref() == Some(&value) {
                    continue;
                }
                let path = [name.clone(), key.clone()];
                let current = doc
                    .read(&path)?
                    .unwrap_or(Shallow::Scalar(Scalar::Null));
                self.inner.notify(name, Change { key, value: current });
                changed += 1;
            }
            // Keys that vanished outright read as deletions
            for key in old.into_keys() {
                self.inner.notify(
                    name,
                    Change {
                        key,
                        value: Shallow::Scalar(Scalar::Null),
                    },
                );
                changed += 1;
            }
        }

        if changed > 0 {
            debug!(changed, "merged remote document");
        }
        Ok(changed)
    }

    /// Persist the document if it has unsaved changes
    pub async fn save_if_dirty(&self) -> Result<bool> {
        let mut doc = self.inner.doc.lock().await;
        if !doc.is_dirty() || doc.storage_path().is_none() {
            return Ok(false);
        }
        doc.save()?;
        Ok(true)
    }

    async fn read(&self, path: &[String]) -> Result<Option<Shallow>, StoreError> {
        self.inner.doc.lock().await.read(path)
    }

    async fn write(&self, path: &[String], value: &JsonValue) -> Result<(), StoreError> {
        let mut doc = self.inner.doc.lock().await;
        doc.put(path, value)?;

        // Writes at or below a collection entry notify that entry
        if let [collection, key, ..] = path {
            let entry_path = [collection.clone(), key.clone()];
            if let Some(current) = doc.read(&entry_path)? {
                self.inner.notify(
                    collection,
                    Change {
                        key: key.clone(),
                        value: current,
                    },
                );
            }
        }
        drop(doc);

        self.inner.local_change_tx.send_modify(|v| *v += 1);
        Ok(())
    }
}

/// A named map of entries at the document root
#[derive(Debug, Clone)]
pub struct Collection {
    store: Store,
    name: String,
}

impl Collection {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Handle to the entry stored under `key`
    pub fn get(&self, key: &str) -> Node {
        Node {
            store: self.store.clone(),
            path: vec![self.name.clone(), key.to_string()],
        }
    }

    /// Subscribe to per-entry changes.
    ///
    /// The subscription first yields every existing entry, then every change
    /// after that, in write order.
    pub async fn subscribe(&self) -> Result<Subscription, StoreError> {
        let doc = self.store.inner.doc.lock().await;
        let (tx, rx) = mpsc::unbounded_channel();

        for key in doc.keys(&self.name)? {
            let path = [self.name.clone(), key.clone()];
            if let Some(value) = doc.read(&path)? {
                let _ = tx.send(Change { key, value });
            }
        }

        let id = self
            .store
            .inner
            .next_subscriber
            .fetch_add(1, Ordering::Relaxed);
        self.store.inner.subscribers().insert(
            id,
            Subscriber {
                collection: self.name.clone(),
                tx,
            },
        );
        drop(doc);

        debug!(collection = %self.name, subscriber = id, "subscribed");
        Ok(Subscription {
            id,
            rx,
            store: Arc::downgrade(&self.store.inner),
        })
    }
}

/// Handle to one node of the tree
#[derive(Debug, Clone)]
pub struct Node {
    store: Store,
    path: Vec<String>,
}

impl Node {
    pub fn path(&self) -> &[String] {
        &self.path
    }
}

#[async_trait]
impl NodeHandle for Node {
    fn get(&self, field: &str) -> Self {
        let mut path = self.path.clone();
        path.push(field.to_string());
        Self {
            store: self.store.clone(),
            path,
        }
    }

    async fn once(&self) -> Result<Option<Shallow>, StoreError> {
        self.store.read(&self.path).await
    }

    async fn put(&self, value: JsonValue) -> Result<(), StoreError> {
        self.store.write(&self.path, &value).await
    }
}

/// Unbounded, non-restartable stream of changes to one collection.
///
/// Dropping the subscription (or cancelling it through a `CancelHandle`)
/// detaches it from the store; changes already queued are still delivered.
pub struct Subscription {
    id: u64,
    rx: mpsc::UnboundedReceiver<Change>,
    store: Weak<Inner>,
}

impl Subscription {
    /// Next change, or `None` once cancelled and drained
    pub async fn next(&mut self) -> Option<Change> {
        self.rx.recv().await
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            id: self.id,
            store: self.store.clone(),
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.store.upgrade() {
            inner.unsubscribe(self.id);
        }
    }
}

/// Detaches a subscription from outside the task that consumes it
#[derive(Clone)]
pub struct CancelHandle {
    id: u64,
    store: Weak<Inner>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        if let Some(inner) = self.store.upgrade() {
            inner.unsubscribe(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store() -> Store {
        Store::new(Document::new(&["features"]).unwrap())
    }

    #[tokio::test]
    async fn subscribe_replays_existing_entries() {
        let store = store();
        let features = store.collection("features");
        features.get("a").put(json!({"v": 1})).await.unwrap();
        features.get("b").put(JsonValue::Null).await.unwrap();

        let mut sub = features.subscribe().await.unwrap();
        let first = sub.next().await.unwrap();
        let second = sub.next().await.unwrap();
        let mut keys = vec![first.key.clone(), second.key.clone()];
        keys.sort();
        assert_eq!(keys, vec!["a", "b"]);
        assert!(first.is_tombstone() || second.is_tombstone());
    }

    #[tokio::test]
    async fn writes_notify_live_subscribers() {
        let store = store();
        let features = store.collection("features");
        let mut sub = features.subscribe().await.unwrap();

        features.get("a").put(json!({"v": 1})).await.unwrap();
        features.get("a").put(JsonValue::Null).await.unwrap();

        let created = sub.next().await.unwrap();
        assert_eq!(created.key, "a");
        assert!(!created.is_tombstone());
        let deleted = sub.next().await.unwrap();
        assert!(deleted.is_tombstone());
    }

    #[tokio::test]
    async fn cancelling_one_subscription_leaves_others() {
        let store = store();
        let features = store.collection("features");
        let mut kept = features.subscribe().await.unwrap();
        let mut cancelled = features.subscribe().await.unwrap();

        cancelled.cancel_handle().cancel();
        features.get("a").put(json!({"v": 1})).await.unwrap();

        assert_eq!(cancelled.next().await, None);
        assert_eq!(kept.next().await.unwrap().key, "a");
    }

    #[tokio::test]
    async fn other_collections_are_not_delivered() {
        let store = store();
        let mut sub = store.collection("features").subscribe().await.unwrap();
        store.collection("notes").get("n").put(json!({"t": "x"})).await.unwrap();
        sub.cancel_handle().cancel();
        assert_eq!(sub.next().await, None);
    }

    #[tokio::test]
    async fn merge_remote_notifies_changed_keys_only() {
        let local = store();
        local.collection("features").get("same").put(json!({"v": 1})).await.unwrap();

        let remote = Store::new(Document::new(&["features"]).unwrap());
        let mut seed = local.snapshot().await;
        remote.merge_remote(&mut seed).await.unwrap();
        remote.collection("features").get("new").put(json!({"v": 2})).await.unwrap();

        let mut sub = local.collection("features").subscribe().await.unwrap();
        assert_eq!(sub.next().await.unwrap().key, "same");

        let mut incoming = remote.snapshot().await;
        let changed = local.merge_remote(&mut incoming).await.unwrap();
        assert_eq!(changed, 1);
        assert_eq!(sub.next().await.unwrap().key, "new");
    }

    #[tokio::test]
    async fn local_writes_bump_the_change_counter() {
        let store = store();
        let mut changes = store.local_changes();
        store.collection("features").get("a").put(json!({})).await.unwrap();
        assert!(changes.has_changed().unwrap());
        assert_eq!(*changes.borrow_and_update(), 1);
    }
}
