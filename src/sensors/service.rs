use chrono::{DateTime, Utc};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::{
    classifier::{self, Classification},
    db::models::{House, SensorReading},
    feed::{ChangeEvent, ChangeKind, Subscription},
    history::{HistoryLog, HISTORY_COLLECTION},
    house_store::{name_from_document, HouseError, HouseStore, HOUSES_COLLECTION},
    mqtt::message::BusReading,
    settings::{Thresholds, CONNECTION_COLLECTION, SETTINGS_COLLECTION},
    value::{field, finite_number},
};

/// Parent of the per-house `monitoring/{houseId}/data` collections.
pub const MONITORING_COLLECTION: &str = "monitoring";

/// Feed prefix covering every collection. Snapshots arrive ordered by
/// collection, so `houses` is applied before `monitoring/...`.
pub const ALL_COLLECTIONS: &str = "";

const VALUE_MIN: f64 = 0.0;
const VALUE_MAX: f64 = 100.0;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("no house named {0:?}")]
    UnknownHouse(String),

    #[error("{field} value {value} is outside 0..=100")]
    OutOfRange { field: &'static str, value: f64 },

    #[error("unexpected collection {0:?}")]
    UnknownCollection(String),

    #[error(transparent)]
    House(#[from] HouseError),
}

/// Turns incoming sensor data into classified house state and history.
///
/// Both ingestion paths (bus messages and monitoring documents) end in
/// [`IngestService::ingest`].
#[derive(Clone)]
pub struct IngestService {
    houses: HouseStore,
    history: HistoryLog,
    thresholds: Thresholds,
}

impl IngestService {
    pub fn new(houses: HouseStore, history: HistoryLog, thresholds: Thresholds) -> Self {
        Self { houses, history, thresholds }
    }

    /// Classify `reading`, cache the result on its house and log it.
    pub async fn ingest(
        &self,
        reading: SensorReading,
    ) -> Result<(House, Classification), IngestError> {
        let config = self.thresholds.resolve(&reading.house_id).await;
        let classification = classifier::classify(&reading, &config);
        let house = self.houses.record(&reading, &classification).await?;
        self.history.append(&house, &reading, &classification).await;

        debug!(
            house_id = %house.id,
            compost = %classification.compost,
            trash = %classification.trash,
            "reading classified"
        );
        Ok((house, classification))
    }

    /// Bus messages identify the house by name.
    pub async fn ingest_bus(
        &self,
        reading: BusReading,
    ) -> Result<(House, Classification), IngestError> {
        let house = self
            .houses
            .find_by_name(&reading.house_name)
            .await
            .ok_or_else(|| IngestError::UnknownHouse(reading.house_name.clone()))?;

        self.ingest(SensorReading {
            house_id: house.id,
            temperature: reading.temperature,
            compost_fill: reading.compost_volume,
            trash_fill: reading.trash_volume,
            observed_at: Utc::now(),
        })
        .await
    }

    /// Apply one document-store change.
    pub async fn apply_change(&self, event: ChangeEvent) -> Result<(), IngestError> {
        if event.collection == HOUSES_COLLECTION {
            return self.apply_house_change(event).await;
        }
        // Written by this service; thresholds are read on every reading.
        if [SETTINGS_COLLECTION, HISTORY_COLLECTION, CONNECTION_COLLECTION]
            .contains(&event.collection.as_str())
        {
            return Ok(());
        }

        let Some(house_id) = monitoring_house_id(&event.collection) else {
            return Err(IngestError::UnknownCollection(event.collection.clone()));
        };
        if event.kind == ChangeKind::Removed {
            return Ok(());
        }
        let reading = reading_from_document(house_id, &event.data)?;
        self.ingest(reading).await?;
        Ok(())
    }

    async fn apply_house_change(&self, event: ChangeEvent) -> Result<(), IngestError> {
        match event.kind {
            ChangeKind::Removed => match self.houses.forget(&event.id).await {
                Some(house) => info!(house_id = %house.id, "house removed by document store"),
                None => debug!(house_id = %event.id, "removed house was unknown"),
            },
            ChangeKind::Added | ChangeKind::Modified => {
                let name = name_from_document(&event.id, &event.data);
                let house = self.houses.upsert(&event.id, &name).await;
                debug!(house_id = %house.id, name = %house.name, "house synced from document store");
            }
        }
        Ok(())
    }

    /// Consume validated bus readings until the channel closes.
    pub async fn run_bus(self, mut readings: mpsc::Receiver<BusReading>) {
        info!("bus ingestion started");
        while let Some(reading) = readings.recv().await {
            if let Err(e) = self.ingest_bus(reading).await {
                warn!(error = %e, "dropping bus reading");
            }
        }
        info!("bus ingestion stopped");
    }

    /// Consume document changes until the subscription ends.
    pub async fn run_feed(self, mut subscription: Subscription) {
        while let Some(event) = subscription.next().await {
            let (collection, id) = (event.collection.clone(), event.id.clone());
            if let Err(e) = self.apply_change(event).await {
                warn!(collection = %collection, id = %id, error = %e, "rejected document change");
            }
        }
        info!("document feed ended");
    }
}

/// `monitoring/{houseId}/data` -> `houseId`.
fn monitoring_house_id(collection: &str) -> Option<&str> {
    let mut parts = collection.split('/');
    match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(MONITORING_COLLECTION), Some(id), Some("data"), None) if !id.is_empty() => Some(id),
        _ => None,
    }
}

/// Parse a monitoring document. Missing or non-numeric values read as `0`;
/// values outside `0..=100` reject the whole document.
fn reading_from_document(house_id: &str, doc: &Value) -> Result<SensorReading, IngestError> {
    let number = |name: &'static str, keys: &[&str]| -> Result<f64, IngestError> {
        let value = field(doc, keys).and_then(finite_number).unwrap_or(0.0);
        if (VALUE_MIN..=VALUE_MAX).contains(&value) {
            Ok(value)
        } else {
            Err(IngestError::OutOfRange { field: name, value })
        }
    };

    Ok(SensorReading {
        house_id: house_id.to_owned(),
        temperature: number("temperature", &["temperature", "suhu"])?,
        compost_fill: number("compost fill", &["compostFill", "jarak1"])?,
        trash_fill: number("trash fill", &["trashFill", "jarak2"])?,
        observed_at: doc.get("timestamp").and_then(timestamp).unwrap_or_else(Utc::now),
    })
}

/// RFC 3339 strings or epoch milliseconds.
fn timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s).ok().map(|t| t.with_timezone(&Utc)),
        Value::Number(n) => n.as_i64().and_then(DateTime::from_timestamp_millis),
        _ => None,
    }
}
