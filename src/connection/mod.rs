//! Supervision of the message-bus link.
//!
//! `machine` holds the connect/disconnect/reconnect rules as a pure state
//! machine that emits [`machine::Action`]s. `manager` runs it on a single
//! tokio task that owns the transport link and the reconnect timer, and
//! exposes the state through a [`manager::ConnectionHandle`].

pub mod machine;
pub mod manager;
pub mod transport;

use std::time::Duration;

use serde::Serialize;
use utoipa::ToSchema;

pub use machine::{Action, ConnectionMachine};
pub use manager::{ConnectionHandle, ConnectionManager, ManagerStopped};
pub use transport::{BrokerEndpoint, Connector, EndpointError, Link, LinkEvent, TransportEvent};

pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// Upper bound of the exponential backoff.
pub const MAX_BACKOFF: Duration = Duration::from_secs(32);

pub const MAX_RETRIES_MESSAGE: &str =
    "Maximum reconnect attempts reached, reconnect manually";

/// Delay before reconnect attempt `retry_count + 1`: `min(2^retry_count, 32)` seconds.
pub fn backoff_delay(retry_count: u32) -> Duration {
    let secs = 2u64.saturating_pow(retry_count);
    Duration::from_secs(secs).min(MAX_BACKOFF)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ScheduledRetry {
    pub attempt: u32,
    pub delay: Duration,
}

/// Observable state of the bus link. One instance per process, written only
/// by the connection manager task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionState {
    pub status: ConnectionStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    pub last_error: Option<String>,
    pub next_retry: Option<ScheduledRetry>,
}

impl ConnectionState {
    pub fn new(max_retries: u32) -> Self {
        Self {
            status: ConnectionStatus::Disconnected,
            retry_count: 0,
            max_retries,
            last_error: None,
            next_retry: None,
        }
    }

    /// Short human-readable description for the display layer.
    pub fn status_text(&self) -> String {
        match self.status {
            ConnectionStatus::Connected => match &self.last_error {
                Some(err) => format!("Connected ({err})"),
                None => "Connected".to_owned(),
            },
            ConnectionStatus::Connecting if self.retry_count > 0 => format!(
                "Reconnecting (attempt {} of {})",
                self.retry_count, self.max_retries
            ),
            ConnectionStatus::Connecting => "Connecting".to_owned(),
            ConnectionStatus::Disconnected => match (&self.next_retry, &self.last_error) {
                (Some(retry), _) => format!(
                    "Reconnecting attempt {} in {}s",
                    retry.attempt,
                    retry.delay.as_secs()
                ),
                (None, Some(err)) => err.clone(),
                (None, None) => "Disconnected".to_owned(),
            },
        }
    }
}
