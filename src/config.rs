use std::str::FromStr;

use anyhow::{Context, Result};

use crate::connection::{BrokerEndpoint, DEFAULT_MAX_RETRIES};

// ---------------------------------------------------------------------------
// TransportKind
// ---------------------------------------------------------------------------

/// How the MQTT client reaches the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Tcp,
    Ws,
    Wss,
}

impl FromStr for TransportKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "tcp" => Ok(Self::Tcp),
            "ws" => Ok(Self::Ws),
            "wss" => Ok(Self::Wss),
            other => Err(anyhow::anyhow!("unknown MQTT transport: {other:?}")),
        }
    }
}

// ---------------------------------------------------------------------------
// SettingsScope
// ---------------------------------------------------------------------------

/// Whether threshold settings are kept per house or shared by all houses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingsScope {
    House,
    Global,
}

impl FromStr for SettingsScope {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "house" => Ok(Self::House),
            "global" => Ok(Self::Global),
            other => Err(anyhow::anyhow!("unknown threshold scope: {other:?}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct MqttConfig {
    pub endpoint: BrokerEndpoint,
    pub transport: TransportKind,
    /// Path of the WebSocket endpoint, e.g. `/mqtt`.
    pub ws_path: String,
    pub topic: String,
    /// A millisecond timestamp is appended to form the client id.
    pub client_prefix: String,
    pub keep_alive_secs: u64,
    pub connect_timeout_secs: u64,
    pub max_retries: u32,
    /// Connect as soon as the service starts.
    pub autoconnect: bool,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub server_host: String,
    pub server_port: u16,
    /// Postgres document store. Without it settings live in memory and no
    /// document feed is consumed.
    pub database_url: Option<String>,
    pub mqtt: MqttConfig,
    /// Number of history entries kept.
    pub history_limit: usize,
    pub threshold_scope: SettingsScope,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let host = optional("MQTT_BROKER_HOST", "broker.emqx.io");
        let port: u32 = optional("MQTT_BROKER_PORT", "8084")
            .parse()
            .context("MQTT_BROKER_PORT must be a valid port number")?;
        let endpoint = BrokerEndpoint::new(&host, port).context("invalid MQTT broker")?;

        Ok(Self {
            server_host: optional("SERVER_HOST", "0.0.0.0"),
            server_port: optional("SERVER_PORT", "8080")
                .parse()
                .context("SERVER_PORT must be a valid port number")?,
            database_url: std::env::var("DATABASE_URL").ok().filter(|s| !s.is_empty()),
            mqtt: MqttConfig {
                endpoint,
                transport: optional("MQTT_TRANSPORT", "wss").parse()?,
                ws_path: optional("MQTT_WS_PATH", "/mqtt"),
                topic: optional("MQTT_TOPIC", "iot/monitoring"),
                client_prefix: optional("MQTT_CLIENT_PREFIX", "kompos_monitor"),
                keep_alive_secs: optional("MQTT_KEEP_ALIVE_SECS", "20")
                    .parse()
                    .context("MQTT_KEEP_ALIVE_SECS must be a positive integer")?,
                connect_timeout_secs: optional("MQTT_CONNECT_TIMEOUT_SECS", "10")
                    .parse()
                    .context("MQTT_CONNECT_TIMEOUT_SECS must be a positive integer")?,
                max_retries: optional("MQTT_MAX_RETRIES", &DEFAULT_MAX_RETRIES.to_string())
                    .parse()
                    .context("MQTT_MAX_RETRIES must be a non-negative integer")?,
                autoconnect: parse_bool(&optional("MQTT_AUTOCONNECT", "true"))
                    .context("MQTT_AUTOCONNECT must be true or false")?,
            },
            history_limit: optional("HISTORY_LIMIT", "50")
                .parse()
                .context("HISTORY_LIMIT must be a positive integer")?,
            threshold_scope: optional("THRESHOLD_SCOPE", "house").parse()?,
        })
    }
}

fn parse_bool(raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(anyhow::anyhow!("not a boolean: {other:?}")),
    }
}

fn optional(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_kind_from_str() {
        assert_eq!("tcp".parse::<TransportKind>().unwrap(), TransportKind::Tcp);
        assert_eq!("ws".parse::<TransportKind>().unwrap(), TransportKind::Ws);
        assert_eq!("wss".parse::<TransportKind>().unwrap(), TransportKind::Wss);
    }

    #[test]
    fn transport_kind_unknown_errors() {
        let err = "quic".parse::<TransportKind>().unwrap_err();
        assert!(err.to_string().contains("unknown MQTT transport"));
    }

    #[test]
    fn settings_scope_from_str() {
        assert_eq!("house".parse::<SettingsScope>().unwrap(), SettingsScope::House);
        assert_eq!("global".parse::<SettingsScope>().unwrap(), SettingsScope::Global);
        let err = "street".parse::<SettingsScope>().unwrap_err();
        assert!(err.to_string().contains("unknown threshold scope"));
    }

    #[test]
    fn parse_bool_accepts_common_spellings() {
        assert!(parse_bool("TRUE").unwrap());
        assert!(parse_bool(" yes ").unwrap());
        assert!(!parse_bool("0").unwrap());
        assert!(!parse_bool("off").unwrap());
        assert!(parse_bool("maybe").is_err());
    }
}
