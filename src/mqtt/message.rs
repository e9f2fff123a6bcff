//! Wire format of bus messages.
//!
//! ```json
//! { "houseName": "Rumah A",
//!   "compost": { "temperature": 31.2, "volume": 48 },
//!   "trash":   { "volume": 12 } }
//! ```
//!
//! Older firmware publishes the same shape with Indonesian keys
//! (`kompos.suhu`, `kompos.volume`, `sampah.volume`); both are accepted.
//! Every numeric value must be a finite number in `0..=100`, otherwise the
//! whole message is rejected.

use serde_json::Value;
use thiserror::Error;

use crate::value::{field, finite_number};

const VALUE_MIN: f64 = 0.0;
const VALUE_MAX: f64 = 100.0;

#[derive(Debug, Error)]
pub enum MessageError {
    #[error("payload is not valid UTF-8")]
    NotUtf8(#[from] std::str::Utf8Error),

    #[error("payload is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("payload is not a JSON object")]
    NotAnObject,

    #[error("houseName is missing or empty")]
    MissingHouseName,

    #[error("{0} is missing")]
    MissingField(&'static str),

    #[error("{0} is not a number")]
    NotNumeric(&'static str),

    #[error("{field} = {value} is outside 0..=100")]
    OutOfRange { field: &'static str, value: f64 },
}

/// A validated bus reading, still keyed by house name.
#[derive(Debug, Clone, PartialEq)]
pub struct BusReading {
    pub house_name: String,
    pub temperature: f64,
    pub compost_volume: f64,
    pub trash_volume: f64,
}

pub fn parse(payload: &[u8]) -> Result<BusReading, MessageError> {
    let text = std::str::from_utf8(payload)?;
    let doc: Value = serde_json::from_str(text.trim_end())?;
    if !doc.is_object() {
        return Err(MessageError::NotAnObject);
    }

    let house_name = doc
        .get("houseName")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or(MessageError::MissingHouseName)?
        .to_owned();

    let compost = field(&doc, &["compost", "kompos"])
        .filter(|v| v.is_object())
        .ok_or(MessageError::MissingField("compost"))?;
    let trash = field(&doc, &["trash", "sampah"])
        .filter(|v| v.is_object())
        .ok_or(MessageError::MissingField("trash"))?;

    Ok(BusReading {
        house_name,
        temperature: bounded(compost, &["temperature", "suhu"], "compost.temperature")?,
        compost_volume: bounded(compost, &["volume"], "compost.volume")?,
        trash_volume: bounded(trash, &["volume"], "trash.volume")?,
    })
}

fn bounded(obj: &Value, keys: &[&str], name: &'static str) -> Result<f64, MessageError> {
    let raw = field(obj, keys).ok_or(MessageError::MissingField(name))?;
    let value = finite_number(raw).ok_or(MessageError::NotNumeric(name))?;
    if (VALUE_MIN..=VALUE_MAX).contains(&value) {
        Ok(value)
    } else {
        Err(MessageError::OutOfRange { field: name, value })
    }
}
