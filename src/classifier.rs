//! Status classification of a reading against a threshold configuration.
//!
//! Pure and total: no I/O, no errors. Non-finite inputs are read as `0`.

use serde::Serialize;
use utoipa::ToSchema;

use crate::{db::models::{SensorReading, Status}, thresholds::ThresholdConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Classification {
    pub compost_temperature: Status,
    pub compost_volume: Status,
    /// The more severe of `compost_temperature` and `compost_volume`.
    pub compost: Status,
    pub trash: Status,
}

pub fn classify(reading: &SensorReading, config: &ThresholdConfig) -> Classification {
    let compost_temperature = config
        .compost_temperature
        .classify(sanitize(reading.temperature));
    let compost_volume = config.compost_volume.classify(sanitize(reading.compost_fill));

    Classification {
        compost_temperature,
        compost_volume,
        compost: compost_temperature.max(compost_volume),
        trash: config.trash_volume.classify(sanitize(reading.trash_fill)),
    }
}

#[inline]
fn sanitize(v: f64) -> f64 {
    if v.is_finite() {
        v
    } else {
        0.0
    }
}
