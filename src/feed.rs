//! Document store and its change feed.
//!
//! Documents are JSON values addressed by `(collection, id)`. A subscription first replays every matching document as an `added`
//! event, then delivers live changes in the order they were published. Each
//! subscription is served by exactly one task, so events for a subscriber
//! never arrive concurrently.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::warn;

/// Events buffered per subscriber before the feed task waits.
pub const SUBSCRIPTION_BUFFER: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Added,
    Modified,
    Removed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub collection: String,
    pub id: String,
    /// Document body; `null` for removals.
    #[serde(default)]
    pub data: Value,
}

impl ChangeEvent {
    /// `prefix` matches a collection exactly or any collection below it,
    /// so `monitoring` matches `monitoring/rmh01/data` but not `monitoringx`.
    /// The empty prefix matches every collection.
    pub fn matches(&self, prefix: &str) -> bool {
        collection_matches(&self.collection, prefix)
    }
}

pub(crate) fn collection_matches(collection: &str, prefix: &str) -> bool {
    if prefix.is_empty() {
        return true;
    }
    match collection.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || prefix.ends_with('/') || rest.starts_with('/'),
        None => false,
    }
}

// ---------------------------------------------------------------------------
// Subscription
// ---------------------------------------------------------------------------

/// Handle to one live subscription. Dropping it stops delivery.
pub struct Subscription {
    rx: mpsc::Receiver<ChangeEvent>,
    task: JoinHandle<()>,
}

impl Subscription {
    pub fn new(rx: mpsc::Receiver<ChangeEvent>, task: JoinHandle<()>) -> Self {
        Self { rx, task }
    }

    /// Next change, or `None` once the feed has stopped.
    pub async fn next(&mut self) -> Option<ChangeEvent> {
        self.rx.recv().await
    }

    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[async_trait]
pub trait DocumentFeed: Send + Sync {
    async fn subscribe(&self, prefix: &str) -> anyhow::Result<Subscription>;
}

// ---------------------------------------------------------------------------
// DocumentStore
// ---------------------------------------------------------------------------

/// Reads and writes of single documents. Every write is also announced on
/// the store's change feed.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn load(&self, collection: &str, id: &str) -> anyhow::Result<Option<Value>>;

    /// Every document of exactly `collection`, ordered by id.
    async fn list(&self, collection: &str) -> anyhow::Result<Vec<(String, Value)>>;

    async fn save(&self, collection: &str, id: &str, doc: Value) -> anyhow::Result<()>;

    /// Removing a missing document is not an error.
    async fn delete(&self, collection: &str, id: &str) -> anyhow::Result<()>;
}

// ---------------------------------------------------------------------------
// ChannelFeed
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Documents {
    // (collection, id) -> data
    docs: BTreeMap<(String, String), Value>,
}

/// In-process document store with a change feed. Used when no database is
/// configured.
#[derive(Clone)]
pub struct ChannelFeed {
    docs: Arc<Mutex<Documents>>,
    tx: broadcast::Sender<ChangeEvent>,
}

impl Default for ChannelFeed {
    fn default() -> Self {
        let (tx, _) = broadcast::channel(256);
        Self { docs: Arc::default(), tx }
    }
}

impl ChannelFeed {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write a document (or remove it) and notify subscribers. The kind of
    /// a write is derived from whether the document already existed.
    pub async fn publish(&self, collection: &str, id: &str, data: Option<Value>) {
        let mut guard = self.docs.lock().await;
        let key = (collection.to_owned(), id.to_owned());
        let event = match data {
            Some(data) => {
                let kind = match guard.docs.insert(key, data.clone()) {
                    Some(_) => ChangeKind::Modified,
                    None => ChangeKind::Added,
                };
                ChangeEvent { kind, collection: collection.to_owned(), id: id.to_owned(), data }
            }
            None => {
                if guard.docs.remove(&key).is_none() {
                    return;
                }
                ChangeEvent {
                    kind: ChangeKind::Removed,
                    collection: collection.to_owned(),
                    id: id.to_owned(),
                    data: Value::Null,
                }
            }
        };
        // No receivers is fine: nobody is subscribed yet.
        let _ = self.tx.send(event);
    }
}

#[async_trait]
impl DocumentFeed for ChannelFeed {
    async fn subscribe(&self, prefix: &str) -> anyhow::Result<Subscription> {
        // Snapshot and live receiver are taken under the same lock so no
        // write falls between them.
        let (snapshot, mut live) = {
            let guard = self.docs.lock().await;
            let snapshot: Vec<ChangeEvent> = guard
                .docs
                .iter()
                .filter(|((collection, _), _)| collection_matches(collection, prefix))
                .map(|((collection, id), data)| ChangeEvent {
                    kind: ChangeKind::Added,
                    collection: collection.clone(),
                    id: id.clone(),
                    data: data.clone(),
                })
                .collect();
            (snapshot, self.tx.subscribe())
        };

        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let prefix = prefix.to_owned();
        let task = tokio::spawn(async move {
            for event in snapshot {
                if tx.send(event).await.is_err() {
                    return;
                }
            }
            loop {
                match live.recv().await {
                    Ok(event) if event.matches(&prefix) => {
                        if tx.send(event).await.is_err() {
                            return;
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(prefix = %prefix, skipped, "document feed subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        });

        Ok(Subscription::new(rx, task))
    }
}

#[async_trait]
impl DocumentStore for ChannelFeed {
    async fn load(&self, collection: &str, id: &str) -> anyhow::Result<Option<Value>> {
        let key = (collection.to_owned(), id.to_owned());
        Ok(self.docs.lock().await.docs.get(&key).cloned())
    }

    async fn list(&self, collection: &str) -> anyhow::Result<Vec<(String, Value)>> {
        Ok(self
            .docs
            .lock()
            .await
            .docs
            .iter()
            .filter(|((c, _), _)| c == collection)
            .map(|((_, id), data)| (id.clone(), data.clone()))
            .collect())
    }

    async fn save(&self, collection: &str, id: &str, doc: Value) -> anyhow::Result<()> {
        self.publish(collection, id, Some(doc)).await;
        Ok(())
    }

    async fn delete(&self, collection: &str, id: &str) -> anyhow::Result<()> {
        self.publish(collection, id, None).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn prefix_matching_respects_path_segments() {
        assert!(collection_matches("houses", "houses"));
        assert!(collection_matches("monitoring/rmh01/data", "monitoring"));
        assert!(collection_matches("monitoring/rmh01/data", "monitoring/"));
        assert!(!collection_matches("monitoringx", "monitoring"));
        assert!(!collection_matches("houses", "monitoring"));
        assert!(collection_matches("settings", ""));
    }

    #[test]
    fn change_event_decodes_from_json() {
        let event: ChangeEvent = serde_json::from_value(json!({
            "kind": "removed", "collection": "houses", "id": "rumah1"
        }))
        .unwrap();
        assert_eq!(event.kind, ChangeKind::Removed);
        assert_eq!(event.data, Value::Null);
    }

    #[tokio::test]
    async fn subscription_replays_snapshot_then_live_changes() {
        let feed = ChannelFeed::new();
        feed.publish("houses", "rumah1", Some(json!({ "name": "Rumah 1" }))).await;
        feed.publish("settings", "global", Some(json!({}))).await;

        let mut sub = feed.subscribe("houses").await.unwrap();

        let first = sub.next().await.unwrap();
        assert_eq!(first.kind, ChangeKind::Added);
        assert_eq!(first.id, "rumah1");

        feed.publish("settings", "rmh01", Some(json!({}))).await;
        feed.publish("houses", "rumah1", Some(json!({ "name": "Rumah Satu" }))).await;
        feed.publish("houses", "rumah1", None).await;

        let modified = sub.next().await.unwrap();
        assert_eq!(modified.kind, ChangeKind::Modified);
        assert_eq!(modified.data["name"], "Rumah Satu");
        let removed = sub.next().await.unwrap();
        assert_eq!(removed.kind, ChangeKind::Removed);
    }

    #[tokio::test]
    async fn snapshot_is_ordered_by_collection() {
        let feed = ChannelFeed::new();
        feed.publish("monitoring/rumah1/data", "r1", Some(json!({}))).await;
        feed.publish("houses", "rumah1", Some(json!({}))).await;

        let mut sub = feed.subscribe("").await.unwrap();

        assert_eq!(sub.next().await.unwrap().collection, "houses");
        assert_eq!(sub.next().await.unwrap().collection, "monitoring/rumah1/data");
    }

    #[tokio::test]
    async fn removing_unknown_document_is_silent() {
        let feed = ChannelFeed::new();
        let mut sub = feed.subscribe("houses").await.unwrap();
        feed.publish("houses", "ghost", None).await;
        feed.publish("houses", "rumah2", Some(json!({}))).await;

        let event = sub.next().await.unwrap();
        assert_eq!((event.kind, event.id.as_str()), (ChangeKind::Added, "rumah2"));
    }

    #[tokio::test]
    async fn store_writes_are_visible_and_announced() {
        let feed = ChannelFeed::new();
        let mut sub = feed.subscribe("houses").await.unwrap();

        feed.save("houses", "rmh02", json!({ "name": "B" })).await.unwrap();
        feed.save("houses", "rmh01", json!({ "name": "A" })).await.unwrap();
        feed.save("history", "h1", json!({})).await.unwrap();

        assert_eq!(feed.load("houses", "rmh01").await.unwrap(), Some(json!({ "name": "A" })));
        let ids: Vec<String> =
            feed.list("houses").await.unwrap().into_iter().map(|(id, _)| id).collect();
        assert_eq!(ids, vec!["rmh01", "rmh02"]);

        feed.delete("houses", "rmh02").await.unwrap();
        feed.delete("houses", "missing").await.unwrap();
        assert!(feed.load("houses", "rmh02").await.unwrap().is_none());

        let kinds: Vec<ChangeKind> = [
            sub.next().await.unwrap(),
            sub.next().await.unwrap(),
            sub.next().await.unwrap(),
        ]
        .into_iter()
        .map(|e| e.kind)
        .collect();
        assert_eq!(kinds, vec![ChangeKind::Added, ChangeKind::Added, ChangeKind::Removed]);
    }

    #[tokio::test]
    async fn unsubscribe_stops_the_feed_task() {
        let feed = ChannelFeed::new();
        let sub = feed.subscribe("houses").await.unwrap();
        assert_eq!(feed.tx.receiver_count(), 1);

        sub.unsubscribe();
        tokio::task::yield_now().await;

        feed.publish("houses", "rumah1", Some(json!({}))).await;
        // The aborted task released its broadcast receiver.
        for _ in 0..10 {
            if feed.tx.receiver_count() == 0 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(feed.tx.receiver_count(), 0);
    }
}
