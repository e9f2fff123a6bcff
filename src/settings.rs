//! Persisted settings: status thresholds and the broker endpoint.

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, warn};

use crate::config::SettingsScope;
use crate::connection::BrokerEndpoint;
use crate::feed::DocumentStore;
use crate::thresholds::{ThresholdConfig, ThresholdError};

/// Settings key used when one configuration applies to every house.
pub const GLOBAL_KEY: &str = "global";

/// Collection holding threshold documents, keyed by house id or [`GLOBAL_KEY`].
pub const SETTINGS_COLLECTION: &str = "settings";

/// Collection holding bus connection settings.
pub const CONNECTION_COLLECTION: &str = "connection";

const BROKER_ID: &str = "broker";

// ---------------------------------------------------------------------------
// Thresholds
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error(transparent)]
    Invalid(#[from] ThresholdError),

    #[error("settings store failed: {0}")]
    Storage(#[source] anyhow::Error),
}

#[derive(Clone)]
pub struct Thresholds {
    store: Arc<dyn DocumentStore>,
    scope: SettingsScope,
}

impl Thresholds {
    pub fn new(store: Arc<dyn DocumentStore>, scope: SettingsScope) -> Self {
        Self { store, scope }
    }

    fn key<'a>(&self, house_id: &'a str) -> &'a str {
        match self.scope {
            SettingsScope::House => house_id,
            SettingsScope::Global => GLOBAL_KEY,
        }
    }

    /// Configuration that applies to `house_id`. Absent, unreadable or
    /// inconsistent settings resolve to the defaults.
    pub async fn resolve(&self, house_id: &str) -> ThresholdConfig {
        let key = self.key(house_id);
        let doc = match self.store.load(SETTINGS_COLLECTION, key).await {
            Ok(Some(doc)) => doc,
            Ok(None) => {
                debug!(key, "no threshold settings stored, using defaults");
                return ThresholdConfig::default();
            }
            Err(e) => {
                warn!(key, error = %e, "failed to load threshold settings, using defaults");
                return ThresholdConfig::default();
            }
        };

        let config = ThresholdConfig::from_document(&doc);
        match config.validate() {
            Ok(()) => config,
            Err(e) => {
                warn!(key, error = %e, "stored threshold settings are invalid, using defaults");
                ThresholdConfig::default()
            }
        }
    }

    pub async fn update(
        &self,
        house_id: &str,
        config: ThresholdConfig,
    ) -> Result<ThresholdConfig, SettingsError> {
        config.validate()?;
        let key = self.key(house_id);
        self.store
            .save(SETTINGS_COLLECTION, key, config.to_document())
            .await
            .map_err(SettingsError::Storage)?;
        debug!(key, "threshold settings updated");
        Ok(config)
    }

    pub async fn reset(&self, house_id: &str) -> Result<ThresholdConfig, SettingsError> {
        self.update(house_id, ThresholdConfig::default()).await
    }

    /// Drop the settings of a removed house so a later house cannot pick
    /// them up. Shared settings are left alone.
    pub async fn forget(&self, house_id: &str) -> Result<(), SettingsError> {
        if self.scope == SettingsScope::Global {
            return Ok(());
        }
        self.store
            .delete(SETTINGS_COLLECTION, house_id)
            .await
            .map_err(SettingsError::Storage)
    }
}

// ---------------------------------------------------------------------------
// BrokerSettings
// ---------------------------------------------------------------------------

/// Last broker endpoint chosen through the API.
#[derive(Clone)]
pub struct BrokerSettings {
    store: Arc<dyn DocumentStore>,
}

impl BrokerSettings {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    /// The saved endpoint, if any. Unreadable or invalid documents are
    /// ignored with a warning.
    pub async fn load(&self) -> Option<BrokerEndpoint> {
        let doc = match self.store.load(CONNECTION_COLLECTION, BROKER_ID).await {
            Ok(doc) => doc?,
            Err(e) => {
                warn!(error = %e, "failed to load saved broker endpoint");
                return None;
            }
        };
        let host = doc.get("host").and_then(|v| v.as_str()).unwrap_or_default();
        let port = doc.get("port").and_then(|v| v.as_u64()).unwrap_or_default();
        let port = u32::try_from(port).unwrap_or(0);
        match BrokerEndpoint::new(host, port) {
            Ok(endpoint) => Some(endpoint),
            Err(e) => {
                warn!(error = %e, "saved broker endpoint is invalid, ignoring it");
                None
            }
        }
    }

    pub async fn save(&self, endpoint: &BrokerEndpoint) -> anyhow::Result<()> {
        let doc = serde_json::to_value(endpoint)?;
        self.store.save(CONNECTION_COLLECTION, BROKER_ID, doc).await
    }
}
