use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use utoipa::ToSchema;

// ---------------------------------------------------------------------------
// Events reported by a link
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    /// The broker accepted the connection.
    Connected,
    /// The broker rejected the subscription.
    SubscribeFailed(String),
    /// The connection could not be established.
    Failed(String),
    /// An established connection went away.
    Closed(String),
    Message { topic: String, payload: Vec<u8> },
}

/// A [`LinkEvent`] tagged with the id of the link that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportEvent {
    pub link: u64,
    pub event: LinkEvent,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("no open link")]
    NotOpen,
    #[error("subscribe request could not be queued: {0}")]
    Subscribe(String),
}

// ---------------------------------------------------------------------------
// Connector / Link
//
// A `Connector` creates links; the connection manager owns the single live
// `Link` and is the only code that talks to it. Links report progress
// asynchronously through the events channel handed to `open`.
// ---------------------------------------------------------------------------

pub trait Connector: Send + 'static {
    /// Start connecting. Must not block; the outcome arrives as
    /// `LinkEvent::Connected` or `LinkEvent::Failed` tagged with `link`.
    fn open(&mut self, link: u64, events: mpsc::Sender<TransportEvent>) -> Box<dyn Link>;

    /// Broker used by the next `open`.
    fn set_endpoint(&mut self, endpoint: BrokerEndpoint);
}

pub trait Link: Send {
    fn subscribe(&mut self, topic: &str) -> Result<(), TransportError>;

    /// Close the link. Events it reports afterwards are ignored.
    fn close(&mut self);
}

// ---------------------------------------------------------------------------
// BrokerEndpoint
// ---------------------------------------------------------------------------

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EndpointError {
    #[error("broker host must not be empty")]
    EmptyHost,
    #[error("broker host may only contain letters, digits, '.' and '-'")]
    InvalidHost,
    #[error("broker port must be between 1 and 65535")]
    InvalidPort,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct BrokerEndpoint {
    pub host: String,
    pub port: u16,
}

impl BrokerEndpoint {
    pub fn new(host: &str, port: u32) -> Result<Self, EndpointError> {
        let host = host.trim();
        if host.is_empty() {
            return Err(EndpointError::EmptyHost);
        }
        if !host
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-')
        {
            return Err(EndpointError::InvalidHost);
        }
        let port = u16::try_from(port)
            .ok()
            .filter(|p| *p != 0)
            .ok_or(EndpointError::InvalidPort)?;
        Ok(Self { host: host.to_owned(), port })
    }
}

impl fmt::Display for BrokerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

// ---------------------------------------------------------------------------
// In-process connector for tests
// ---------------------------------------------------------------------------
