use std::{collections::VecDeque, sync::Arc};

use chrono::{DateTime, Days, NaiveDate, NaiveTime, Utc};
use tokio::sync::RwLock;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    classifier::Classification,
    db::models::{BinKind, HistoryEntry, House, SensorReading, Status},
    feed::DocumentStore,
};

pub const DEFAULT_HISTORY_LIMIT: usize = 50;

/// Collection holding one document per history entry, keyed by entry id.
pub const HISTORY_COLLECTION: &str = "history";

/// Entries shown on a house dashboard.
pub const RECENT_LIMIT: usize = 10;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct HistoryFilter {
    pub house_id: Option<String>,
    pub status: Option<Status>,
    /// Inclusive, from the start of the day (UTC).
    pub from: Option<NaiveDate>,
    /// Inclusive, up to the end of the day (UTC).
    pub to: Option<NaiveDate>,
}

impl HistoryFilter {
    fn matches(&self, entry: &HistoryEntry) -> bool {
        if self.house_id.as_deref().is_some_and(|id| id != entry.house_id) {
            return false;
        }
        if self.status.is_some_and(|s| s != entry.status) {
            return false;
        }
        if let Some(from) = self.from.map(start_of_day) {
            if entry.recorded_at < from {
                return false;
            }
        }
        if let Some(end) = self.to.and_then(|d| d.checked_add_days(Days::new(1))) {
            if entry.recorded_at >= start_of_day(end) {
                return false;
            }
        }
        true
    }
}

fn start_of_day(date: NaiveDate) -> DateTime<Utc> {
    date.and_time(NaiveTime::MIN).and_utc()
}

/// Bounded, newest-last log of classified bin observations, mirrored into
/// the document store.
#[derive(Clone)]
pub struct HistoryLog {
    entries: Arc<RwLock<VecDeque<HistoryEntry>>>,
    limit: usize,
    store: Arc<dyn DocumentStore>,
}

impl HistoryLog {
    /// An empty log backed by `store`.
    pub fn new(store: Arc<dyn DocumentStore>, limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            entries: Arc::new(RwLock::new(VecDeque::with_capacity(limit))),
            limit,
            store,
        }
    }

    /// A log holding the newest `limit` entries already in `store`. Older
    /// and unreadable documents are deleted.
    pub async fn load(store: Arc<dyn DocumentStore>, limit: usize) -> anyhow::Result<Self> {
        let log = Self::new(store, limit);
        let mut restored = Vec::new();
        let mut stale = Vec::new();
        for (id, doc) in log.store.list(HISTORY_COLLECTION).await? {
            match serde_json::from_value::<HistoryEntry>(doc) {
                Ok(entry) => restored.push(entry),
                Err(e) => {
                    warn!(id = %id, error = %e, "dropping unreadable history entry");
                    stale.push(id);
                }
            }
        }
        restored.sort_by_key(|e| (e.recorded_at, e.kind));
        let excess = restored.len().saturating_sub(log.limit);
        stale.extend(restored.drain(..excess).map(|e| e.id.to_string()));

        for id in &stale {
            log.store.delete(HISTORY_COLLECTION, id).await?;
        }
        debug!(count = restored.len(), dropped = stale.len(), "history restored");
        *log.entries.write().await = restored.into();
        Ok(log)
    }

    /// Append one compost and one trash entry for a classified reading,
    /// evicting the oldest entries beyond the limit. Storage failures are
    /// logged; the in-memory log is always updated.
    pub async fn append(
        &self,
        house: &House,
        reading: &SensorReading,
        classification: &Classification,
    ) {
        let compost = HistoryEntry {
            id: Uuid::new_v4(),
            house_id: house.id.clone(),
            house_name: house.name.clone(),
            kind: BinKind::Compost,
            temperature: Some(reading.temperature),
            volume: reading.compost_fill,
            status: classification.compost,
            recorded_at: reading.observed_at,
        };
        let trash = HistoryEntry {
            id: Uuid::new_v4(),
            kind: BinKind::Trash,
            temperature: None,
            volume: reading.trash_fill,
            status: classification.trash,
            ..compost.clone()
        };

        let mut entries = self.entries.write().await;
        for entry in [compost, trash] {
            self.persist(&entry).await;
            entries.push_back(entry);
        }
        while entries.len() > self.limit {
            if let Some(evicted) = entries.pop_front() {
                let id = evicted.id.to_string();
                if let Err(e) = self.store.delete(HISTORY_COLLECTION, &id).await {
                    warn!(id = %id, error = %e, "failed to delete evicted history entry");
                }
            }
        }
    }

    async fn persist(&self, entry: &HistoryEntry) {
        let id = entry.id.to_string();
        let saved = match serde_json::to_value(entry) {
            Ok(doc) => self.store.save(HISTORY_COLLECTION, &id, doc).await,
            Err(e) => Err(e.into()),
        };
        if let Err(e) = saved {
            warn!(id = %id, error = %e, "failed to persist history entry");
        }
    }

    /// Matching entries, newest first.
    pub async fn filter(&self, filter: &HistoryFilter) -> Vec<HistoryEntry> {
        self.entries
            .read()
            .await
            .iter()
            .rev()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect()
    }

    /// The newest `limit` entries of one house, newest first.
    pub async fn recent(&self, house_id: &str, limit: usize) -> Vec<HistoryEntry> {
        self.entries
            .read()
            .await
            .iter()
            .rev()
            .filter(|e| e.house_id == house_id)
            .take(limit)
            .cloned()
            .collect()
    }

    pub async fn clear(&self) -> anyhow::Result<()> {
        let mut entries = self.entries.write().await;
        for (id, _) in self.store.list(HISTORY_COLLECTION).await? {
            self.store.delete(HISTORY_COLLECTION, &id).await?;
        }
        entries.clear();
        Ok(())
    }

    pub async fn count(&self) -> usize {
        self.entries.read().await.len()
    }
}
