use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;
use utoipa::ToSchema;

use crate::{db::models::Status, value::finite_number};

/// Ratio applied to the full bound by two-value (legacy) settings documents.
pub const DEFAULT_CHECK_RATIO: f64 = 0.8;

/// Every threshold must fall inside the sensor domain.
const DOMAIN_MIN: f64 = 0.0;
const DOMAIN_MAX: f64 = 100.0;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, PartialEq)]
pub enum ThresholdError {
    #[error("{dimension}: {bound} bound must be a finite number")]
    NotFinite {
        dimension: &'static str,
        bound: &'static str,
    },

    #[error("{dimension}: {bound} bound {value} is outside 0..=100")]
    OutOfRange {
        dimension: &'static str,
        bound: &'static str,
        value: f64,
    },

    #[error(
        "{dimension}: bounds must satisfy normal < check < full (got {normal} / {check} / {full})"
    )]
    Ordering {
        dimension: &'static str,
        normal: f64,
        check: f64,
        full: f64,
    },
}

// ---------------------------------------------------------------------------
// Tier
// ---------------------------------------------------------------------------

/// Boundaries of one measured dimension.
///
/// Upper bounds are inclusive: a value equal to `full_max` is `Full`, a value
/// equal to `check_max` (and below `full_max`) is `NeedsCheck`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Tier {
    pub normal_max: f64,
    pub check_max: f64,
    pub full_max: f64,
}

impl Tier {
    pub const fn new(normal_max: f64, check_max: f64, full_max: f64) -> Self {
        Self { normal_max, check_max, full_max }
    }

    pub fn classify(&self, value: f64) -> Status {
        if value >= self.full_max {
            Status::Full
        } else if value >= self.check_max {
            Status::NeedsCheck
        } else {
            Status::Normal
        }
    }

    fn validate(&self, dimension: &'static str) -> Result<(), ThresholdError> {
        for (bound, value) in [
            ("normal", self.normal_max),
            ("check", self.check_max),
            ("full", self.full_max),
        ] {
            if !value.is_finite() {
                return Err(ThresholdError::NotFinite { dimension, bound });
            }
            if !(DOMAIN_MIN..=DOMAIN_MAX).contains(&value) {
                return Err(ThresholdError::OutOfRange { dimension, bound, value });
            }
        }

        if self.normal_max < self.check_max && self.check_max < self.full_max {
            Ok(())
        } else {
            Err(ThresholdError::Ordering {
                dimension,
                normal: self.normal_max,
                check: self.check_max,
                full: self.full_max,
            })
        }
    }

    /// Expand a single "full" bound the way two-value settings did:
    /// `check = full * ratio`, and `normal` one more ratio step below.
    fn from_full(full_max: f64, ratio: f64) -> Self {
        let check_max = full_max * ratio;
        Self::new(check_max * ratio, check_max, full_max)
    }
}

// ---------------------------------------------------------------------------
// ThresholdConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ThresholdConfig {
    pub compost_temperature: Tier,
    pub compost_volume: Tier,
    pub trash_volume: Tier,
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self {
            compost_temperature: Tier::new(25.0, 32.5, 40.0),
            compost_volume: Tier::new(50.0, 75.0, 100.0),
            trash_volume: Tier::new(50.0, 75.0, 100.0),
        }
    }
}

// Flat field names used by stored settings documents, one row per bound:
// (document key, dimension, bound).
const FLAT_FIELDS: [(&str, Dimension, Bound); 9] = [
    ("compostTempNormal", Dimension::CompostTemperature, Bound::Normal),
    ("compostTempCheck", Dimension::CompostTemperature, Bound::Check),
    ("compostTempFull", Dimension::CompostTemperature, Bound::Full),
    ("compostVolumeNormal", Dimension::CompostVolume, Bound::Normal),
    ("compostVolumeCheck", Dimension::CompostVolume, Bound::Check),
    ("compostVolumeFull", Dimension::CompostVolume, Bound::Full),
    ("trashVolumeNormal", Dimension::TrashVolume, Bound::Normal),
    ("trashVolumeCheck", Dimension::TrashVolume, Bound::Check),
    ("trashVolumeFull", Dimension::TrashVolume, Bound::Full),
];

// Two-value documents: (document key, dimension).
const LEGACY_FIELDS: [(&str, Dimension); 3] = [
    ("compostTemp", Dimension::CompostTemperature),
    ("compostVolume", Dimension::CompostVolume),
    ("trashVolume", Dimension::TrashVolume),
];

#[derive(Debug, Clone, Copy)]
enum Dimension {
    CompostTemperature,
    CompostVolume,
    TrashVolume,
}

#[derive(Debug, Clone, Copy)]
enum Bound {
    Normal,
    Check,
    Full,
}

impl ThresholdConfig {
    pub fn validate(&self) -> Result<(), ThresholdError> {
        self.compost_temperature.validate("compost temperature")?;
        self.compost_volume.validate("compost volume")?;
        self.trash_volume.validate("trash volume")?;
        Ok(())
    }

    /// Build a configuration from a stored settings document.
    ///
    /// Parsing is permissive: every bound that is missing or not a finite
    /// number keeps its default. Documents that carry none of the
    /// three-tier keys but some of the legacy two-value keys are migrated
    /// with `check = full * checkRatio`. The result is not validated.
    pub fn from_document(doc: &Value) -> Self {
        let has_flat = FLAT_FIELDS.iter().any(|(key, _, _)| doc.get(*key).is_some());
        let has_legacy = LEGACY_FIELDS.iter().any(|(key, _)| doc.get(*key).is_some());

        if !has_flat && has_legacy {
            return Self::from_legacy_document(doc);
        }

        let mut config = Self::default();
        for (key, dimension, bound) in FLAT_FIELDS {
            if let Some(value) = doc.get(key).and_then(finite_number) {
                *config.bound_mut(dimension, bound) = value;
            }
        }
        config
    }

    fn from_legacy_document(doc: &Value) -> Self {
        let ratio = doc
            .get("checkRatio")
            .and_then(finite_number)
            .filter(|r| *r > 0.0 && *r < 1.0)
            .unwrap_or(DEFAULT_CHECK_RATIO);

        let mut config = Self::default();
        for (key, dimension) in LEGACY_FIELDS {
            if let Some(full) = doc.get(key).and_then(finite_number) {
                *config.tier_mut(dimension) = Tier::from_full(full, ratio);
            }
        }
        config
    }

    /// Flat document form, as written to the settings store.
    pub fn to_document(&self) -> Value {
        let mut map = Map::new();
        for (key, dimension, bound) in FLAT_FIELDS {
            map.insert(key.to_owned(), json!(self.bound(dimension, bound)));
        }
        Value::Object(map)
    }

    fn tier(&self, dimension: Dimension) -> &Tier {
        match dimension {
            Dimension::CompostTemperature => &self.compost_temperature,
            Dimension::CompostVolume => &self.compost_volume,
            Dimension::TrashVolume => &self.trash_volume,
        }
    }

    fn tier_mut(&mut self, dimension: Dimension) -> &mut Tier {
        match dimension {
            Dimension::CompostTemperature => &mut self.compost_temperature,
            Dimension::CompostVolume => &mut self.compost_volume,
            Dimension::TrashVolume => &mut self.trash_volume,
        }
    }

    fn bound(&self, dimension: Dimension, bound: Bound) -> f64 {
        let tier = self.tier(dimension);
        match bound {
            Bound::Normal => tier.normal_max,
            Bound::Check => tier.check_max,
            Bound::Full => tier.full_max,
        }
    }

    fn bound_mut(&mut self, dimension: Dimension, bound: Bound) -> &mut f64 {
        let tier = self.tier_mut(dimension);
        match bound {
            Bound::Normal => &mut tier.normal_max,
            Bound::Check => &mut tier.check_max,
            Bound::Full => &mut tier.full_max,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
