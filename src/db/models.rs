use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Threshold tier of a bin.
///
/// Variants are declared in ascending severity so `Ord`/`max` pick the more
/// severe one. The serialized form is the label shown on the dashboard.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
    ToSchema,
)]
pub enum Status {
    #[default]
    #[serde(rename = "Normal", alias = "normal")]
    Normal,
    #[serde(rename = "Perlu Diperiksa", alias = "needs_check")]
    NeedsCheck,
    #[serde(rename = "Penuh", alias = "full")]
    Full,
}

impl Status {
    pub fn label(self) -> &'static str {
        match self {
            Status::Normal => "Normal",
            Status::NeedsCheck => "Perlu Diperiksa",
            Status::Full => "Penuh",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

// ---------------------------------------------------------------------------
// BinKind
// ---------------------------------------------------------------------------

/// The two bins every house carries. Compost orders first.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, ToSchema,
)]
pub enum BinKind {
    #[serde(rename = "Kompos", alias = "compost")]
    Compost,
    #[serde(rename = "Sampah", alias = "trash")]
    Trash,
}

impl fmt::Display for BinKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BinKind::Compost => "Kompos",
            BinKind::Trash => "Sampah",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// SensorReading
// ---------------------------------------------------------------------------

/// One timestamped observation for a house.
///
/// Temperature is in °C, fills are percentages. Constructed by the ingestion
/// paths only after the values passed range validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SensorReading {
    pub house_id: String,
    pub temperature: f64,
    pub compost_fill: f64,
    pub trash_fill: f64,
    pub observed_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// House
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct CompostLevels {
    pub temperature: f64,
    pub volume: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct TrashLevels {
    pub volume: f64,
}

/// A monitored site with one compost bin and one trash bin.
///
/// `compost_status` and `trash_status` cache the classification of the most
/// recent reading; they are recomputed on every ingest and never read back as
/// a source of truth.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct House {
    pub id: String,
    pub name: String,
    pub compost: CompostLevels,
    pub trash: TrashLevels,
    pub compost_status: Status,
    pub trash_status: Status,
    pub updated_at: Option<DateTime<Utc>>,
}

impl House {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            compost: CompostLevels::default(),
            trash: TrashLevels::default(),
            compost_status: Status::Normal,
            trash_status: Status::Normal,
            updated_at: None,
        }
    }
}

// ---------------------------------------------------------------------------
// HistoryEntry
// ---------------------------------------------------------------------------

/// One classified bin observation kept in the history log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub id: Uuid,
    pub house_id: String,
    pub house_name: String,
    pub kind: BinKind,
    /// Only compost entries carry a temperature.
    pub temperature: Option<f64>,
    pub volume: f64,
    pub status: Status,
    pub recorded_at: DateTime<Utc>,
}
