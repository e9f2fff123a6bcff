use std::{collections::BTreeMap, sync::Arc};

use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;

use crate::{
    classifier::Classification,
    db::models::{CompostLevels, House, SensorReading, TrashLevels},
    feed::DocumentStore,
};

pub const MAX_NAME_LEN: usize = 50;

/// Collection holding one document per house.
pub const HOUSES_COLLECTION: &str = "houses";

const GENERATED_ID_PREFIX: &str = "rmh";

// Ids used by the sensor firmware; the name defaults to the rest.
const FIRMWARE_ID_PREFIX: &str = "rumah";

#[derive(Debug, Error)]
pub enum HouseError {
    #[error("house name must not be empty")]
    EmptyName,
    #[error("house name must be at most {MAX_NAME_LEN} characters")]
    NameTooLong,
    #[error("a house named {0:?} already exists")]
    DuplicateName(String),
    #[error("house {0:?} not found")]
    NotFound(String),
    #[error("house store failed: {0}")]
    Storage(#[source] anyhow::Error),
}

#[derive(Default)]
struct Registry {
    houses: BTreeMap<String, House>,
    // Highest number handed out or seen; ids are never reused.
    last_id: u32,
}

impl Registry {
    fn name_taken(&self, name: &str, except_id: Option<&str>) -> bool {
        self.houses
            .values()
            .any(|h| Some(h.id.as_str()) != except_id && same_name(&h.name, name))
    }

    fn next_id(&mut self) -> String {
        loop {
            self.last_id += 1;
            let id = format!("{GENERATED_ID_PREFIX}{:02}", self.last_id);
            if !self.houses.contains_key(&id) {
                return id;
            }
        }
    }

    fn insert(&mut self, house: House) {
        if let Some(n) = generated_number(&house.id) {
            self.last_id = self.last_id.max(n);
        }
        self.houses.insert(house.id.clone(), house);
    }
}

/// Owned registry of monitored houses.
///
/// Cheap to clone; every clone shares the same houses. Reads hand out
/// snapshots. `add`, `rename` and `remove` write through to the document
/// store before changing the registry; `upsert` and `forget` apply changes
/// that already happened in the store.
#[derive(Clone)]
pub struct HouseStore {
    inner: Arc<RwLock<Registry>>,
    store: Arc<dyn DocumentStore>,
}

impl HouseStore {
    /// An empty registry backed by `store`.
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { inner: Arc::default(), store }
    }

    /// A registry holding every house already in `store`.
    pub async fn load(store: Arc<dyn DocumentStore>) -> anyhow::Result<Self> {
        let docs = store.list(HOUSES_COLLECTION).await?;
        let houses = Self::new(store);
        {
            let mut registry = houses.inner.write().await;
            for (id, doc) in docs {
                let name = name_from_document(&id, &doc);
                registry.insert(House::new(id, name));
            }
            debug!(count = registry.houses.len(), last_id = registry.last_id, "houses restored");
        }
        Ok(houses)
    }

    /// All houses ordered by id.
    pub async fn list(&self) -> Vec<House> {
        self.inner.read().await.houses.values().cloned().collect()
    }

    pub async fn get(&self, id: &str) -> Option<House> {
        self.inner.read().await.houses.get(id).cloned()
    }

    /// Case-insensitive lookup, as used for bus messages.
    pub async fn find_by_name(&self, name: &str) -> Option<House> {
        let name = name.trim();
        self.inner
            .read()
            .await
            .houses
            .values()
            .find(|h| same_name(&h.name, name))
            .cloned()
    }

    pub async fn add(&self, name: &str) -> Result<House, HouseError> {
        let name = validate_name(name)?;
        let mut registry = self.inner.write().await;
        if registry.name_taken(name, None) {
            return Err(HouseError::DuplicateName(name.to_owned()));
        }
        let house = House::new(registry.next_id(), name);
        self.save(&house).await?;
        registry.insert(house.clone());
        Ok(house)
    }

    pub async fn rename(&self, id: &str, name: &str) -> Result<House, HouseError> {
        let name = validate_name(name)?;
        let mut registry = self.inner.write().await;
        if registry.name_taken(name, Some(id)) {
            return Err(HouseError::DuplicateName(name.to_owned()));
        }
        let house = registry
            .houses
            .get_mut(id)
            .ok_or_else(|| HouseError::NotFound(id.to_owned()))?;
        let renamed = House { name: name.to_owned(), ..house.clone() };
        self.save(&renamed).await?;
        house.name = renamed.name.clone();
        Ok(renamed)
    }

    pub async fn remove(&self, id: &str) -> Result<House, HouseError> {
        let mut registry = self.inner.write().await;
        if !registry.houses.contains_key(id) {
            return Err(HouseError::NotFound(id.to_owned()));
        }
        self.store
            .delete(HOUSES_COLLECTION, id)
            .await
            .map_err(HouseError::Storage)?;
        registry
            .houses
            .remove(id)
            .ok_or_else(|| HouseError::NotFound(id.to_owned()))
    }

    async fn save(&self, house: &House) -> Result<(), HouseError> {
        self.store
            .save(HOUSES_COLLECTION, &house.id, json!({ "name": house.name }))
            .await
            .map_err(HouseError::Storage)
    }

    /// Insert or rename a house announced by the document store. Cached
    /// readings of an existing house are kept.
    pub async fn upsert(&self, id: &str, name: &str) -> House {
        let mut registry = self.inner.write().await;
        if let Some(house) = registry.houses.get_mut(id) {
            house.name = name.to_owned();
            return house.clone();
        }
        let house = House::new(id, name);
        registry.insert(house.clone());
        house
    }

    /// Drop a house the document store no longer holds.
    pub async fn forget(&self, id: &str) -> Option<House> {
        self.inner.write().await.houses.remove(id)
    }

    /// Cache the latest reading and its classification on the house.
    pub async fn record(
        &self,
        reading: &SensorReading,
        classification: &Classification,
    ) -> Result<House, HouseError> {
        let mut registry = self.inner.write().await;
        let house = registry
            .houses
            .get_mut(&reading.house_id)
            .ok_or_else(|| HouseError::NotFound(reading.house_id.clone()))?;
        house.compost = CompostLevels {
            temperature: reading.temperature,
            volume: reading.compost_fill,
        };
        house.trash = TrashLevels { volume: reading.trash_fill };
        house.compost_status = classification.compost;
        house.trash_status = classification.trash;
        house.updated_at = Some(reading.observed_at);
        Ok(house.clone())
    }
}

/// Display name of a house document: its `name`, or the id without the
/// firmware prefix (`rumah3` -> `3`).
pub fn name_from_document(id: &str, doc: &Value) -> String {
    doc.get("name")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .map(str::to_owned)
        .unwrap_or_else(|| id.strip_prefix(FIRMWARE_ID_PREFIX).unwrap_or(id).to_owned())
}

fn same_name(a: &str, b: &str) -> bool {
    a.to_lowercase() == b.to_lowercase()
}

fn generated_number(id: &str) -> Option<u32> {
    id.strip_prefix(GENERATED_ID_PREFIX)?.parse().ok()
}

fn validate_name(name: &str) -> Result<&str, HouseError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(HouseError::EmptyName);
    }
    if name.chars().count() > MAX_NAME_LEN {
        return Err(HouseError::NameTooLong);
    }
    Ok(name)
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::{db::models::Status, feed::ChannelFeed};

    fn houses() -> (ChannelFeed, HouseStore) {
        let feed = ChannelFeed::new();
        let store = HouseStore::new(Arc::new(feed.clone()));
        (feed, store)
    }

    #[tokio::test]
    async fn add_assigns_sequential_ids() {
        let (_, store) = houses();
        let a = store.add("Rumah A").await.unwrap();
        let b = store.add("  Rumah B  ").await.unwrap();
        assert_eq!(a.id, "rmh01");
        assert_eq!(b.id, "rmh02");
        assert_eq!(b.name, "Rumah B");
        assert_eq!(store.list().await.len(), 2);
    }

    #[tokio::test]
    async fn ids_are_not_reused_after_removal() {
        let (_, store) = houses();
        store.add("Rumah A").await.unwrap();
        let b = store.add("Rumah B").await.unwrap();
        store.remove(&b.id).await.unwrap();
        let c = store.add("Rumah C").await.unwrap();
        assert_eq!(c.id, "rmh03");
    }

    #[tokio::test]
    async fn generated_ids_skip_ids_taken_by_the_feed() {
        let (_, store) = houses();
        store.upsert("rmh01", "Dari Feed").await;
        let added = store.add("Rumah Baru").await.unwrap();
        assert_eq!(added.id, "rmh02");
    }

    #[tokio::test]
    async fn name_rules_are_enforced() {
        let (_, store) = houses();
        assert!(matches!(store.add("   ").await, Err(HouseError::EmptyName)));
        assert!(matches!(store.add(&"x".repeat(51)).await, Err(HouseError::NameTooLong)));
        assert!(store.add(&"x".repeat(50)).await.is_ok());

        store.add("Rumah A").await.unwrap();
        assert!(matches!(
            store.add("rumah a").await,
            Err(HouseError::DuplicateName(name)) if name == "rumah a"
        ));
    }

    #[tokio::test]
    async fn names_compare_case_insensitively_beyond_ascii() {
        let (_, store) = houses();
        let a = store.add("Rumah Ä").await.unwrap();
        assert!(matches!(store.add("rumah ä").await, Err(HouseError::DuplicateName(_))));
        assert_eq!(store.find_by_name("RUMAH Ä").await.map(|h| h.id), Some(a.id));
    }

    #[tokio::test]
    async fn rename_allows_own_name_and_rejects_others() {
        let (_, store) = houses();
        let a = store.add("Rumah A").await.unwrap();
        store.add("Rumah B").await.unwrap();

        let renamed = store.rename(&a.id, "RUMAH A").await.unwrap();
        assert_eq!(renamed.name, "RUMAH A");
        assert!(matches!(
            store.rename(&a.id, "rumah b").await,
            Err(HouseError::DuplicateName(_))
        ));
        assert!(matches!(
            store.rename("rmh99", "Rumah Z").await,
            Err(HouseError::NotFound(id)) if id == "rmh99"
        ));
    }

    #[tokio::test]
    async fn find_by_name_ignores_case_and_padding() {
        let (_, store) = houses();
        let a = store.add("Rumah A").await.unwrap();
        assert_eq!(store.find_by_name(" rumah a ").await.map(|h| h.id), Some(a.id));
        assert!(store.find_by_name("Rumah Z").await.is_none());
    }

    #[tokio::test]
    async fn writes_reach_the_document_store() {
        let (feed, store) = houses();
        let a = store.add("Rumah A").await.unwrap();
        store.rename(&a.id, "Rumah Utama").await.unwrap();
        assert_eq!(
            feed.load(HOUSES_COLLECTION, &a.id).await.unwrap(),
            Some(json!({ "name": "Rumah Utama" }))
        );

        store.remove(&a.id).await.unwrap();
        assert!(feed.load(HOUSES_COLLECTION, &a.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn removing_a_feed_house_deletes_its_document() {
        let (feed, store) = houses();
        feed.publish(HOUSES_COLLECTION, "rumah1", Some(json!({ "name": "Rumah 1" })))
            .await;
        store.upsert("rumah1", "Rumah 1").await;

        store.remove("rumah1").await.unwrap();

        assert!(feed.list(HOUSES_COLLECTION).await.unwrap().is_empty());
        let reloaded = HouseStore::load(Arc::new(feed)).await.unwrap();
        assert!(reloaded.get("rumah1").await.is_none());
    }

    #[tokio::test]
    async fn houses_and_id_counter_survive_a_restart() {
        let (feed, store) = houses();
        store.add("Rumah A").await.unwrap();
        let b = store.add("Rumah B").await.unwrap();
        feed.publish(HOUSES_COLLECTION, "rumah7", Some(json!({}))).await;

        let restored = HouseStore::load(Arc::new(feed)).await.unwrap();

        let ids: Vec<String> = restored.list().await.into_iter().map(|h| h.id).collect();
        assert_eq!(ids, vec!["rmh01", "rmh02", "rumah7"]);
        assert_eq!(restored.get("rumah7").await.unwrap().name, "7");
        assert_eq!(restored.get(&b.id).await.unwrap().name, "Rumah B");
        assert_eq!(restored.add("Rumah C").await.unwrap().id, "rmh03");
    }

    #[tokio::test]
    async fn upsert_keeps_cached_readings() {
        let (_, store) = houses();
        let house = store.upsert("rumah1", "1").await;
        let reading = SensorReading {
            house_id: house.id.clone(),
            temperature: 35.0,
            compost_fill: 80.0,
            trash_fill: 20.0,
            observed_at: Utc::now(),
        };
        let classification = Classification {
            compost_temperature: Status::NeedsCheck,
            compost_volume: Status::NeedsCheck,
            compost: Status::NeedsCheck,
            trash: Status::Normal,
        };
        store.record(&reading, &classification).await.unwrap();

        let renamed = store.upsert("rumah1", "Rumah Satu").await;

        assert_eq!(renamed.name, "Rumah Satu");
        assert_eq!(renamed.compost.volume, 80.0);
        assert_eq!(renamed.compost_status, Status::NeedsCheck);
        assert_eq!(renamed.updated_at, Some(reading.observed_at));
    }

    #[tokio::test]
    async fn record_for_unknown_house_fails() {
        let (_, store) = houses();
        let reading = SensorReading {
            house_id: "ghost".into(),
            temperature: 0.0,
            compost_fill: 0.0,
            trash_fill: 0.0,
            observed_at: Utc::now(),
        };
        let classification = Classification {
            compost_temperature: Status::Normal,
            compost_volume: Status::Normal,
            compost: Status::Normal,
            trash: Status::Normal,
        };
        assert!(matches!(
            store.record(&reading, &classification).await,
            Err(HouseError::NotFound(id)) if id == "ghost"
        ));
    }

    #[test]
    fn document_names_fall_back_to_the_id() {
        assert_eq!(name_from_document("rumah3", &json!({ "name": " Tiga " })), "Tiga");
        assert_eq!(name_from_document("rumah3", &json!({ "name": "" })), "3");
        assert_eq!(name_from_document("rmh04", &Value::Null), "rmh04");
    }
}
