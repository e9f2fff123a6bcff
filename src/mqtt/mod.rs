//! MQTT transport for the connection manager, built on `rumqttc`.

pub mod message;

use std::time::Duration;

use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Packet, QoS,
    SubscribeReasonCode, Transport,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, warn};

use crate::config::{MqttConfig, TransportKind};
use crate::connection::transport::TransportError;
use crate::connection::{BrokerEndpoint, Connector, Link, LinkEvent, TransportEvent};

/// Requests buffered between the client handle and its event loop.
const REQUEST_CAPACITY: usize = 16;

/// Time the event loop gets to flush a DISCONNECT before it is aborted.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

// ---------------------------------------------------------------------------
// MqttConnector
// ---------------------------------------------------------------------------

pub struct MqttConnector {
    endpoint: BrokerEndpoint,
    transport: TransportKind,
    ws_path: String,
    client_prefix: String,
    keep_alive: Duration,
    connect_timeout: Duration,
}

impl MqttConnector {
    pub fn new(config: &MqttConfig) -> Self {
        Self {
            endpoint: config.endpoint.clone(),
            transport: config.transport,
            ws_path: config.ws_path.clone(),
            client_prefix: config.client_prefix.clone(),
            keep_alive: Duration::from_secs(config.keep_alive_secs.max(5)),
            connect_timeout: Duration::from_secs(config.connect_timeout_secs.max(1)),
        }
    }

    /// Host argument for `MqttOptions`: the bare host for TCP, the full URL
    /// for WebSocket transports.
    fn broker_address(&self) -> String {
        let BrokerEndpoint { host, port } = &self.endpoint;
        match self.transport {
            TransportKind::Tcp => host.clone(),
            TransportKind::Ws => format!("ws://{host}:{port}{}", self.ws_path),
            TransportKind::Wss => format!("wss://{host}:{port}{}", self.ws_path),
        }
    }

    fn options(&self) -> MqttOptions {
        let client_id = format!(
            "{}_{}",
            self.client_prefix,
            chrono::Utc::now().timestamp_millis()
        );
        let mut opts = MqttOptions::new(client_id, self.broker_address(), self.endpoint.port);
        opts.set_keep_alive(self.keep_alive);
        opts.set_clean_session(true);
        match self.transport {
            TransportKind::Tcp => {}
            TransportKind::Ws => {
                opts.set_transport(Transport::Ws);
            }
            TransportKind::Wss => {
                opts.set_transport(Transport::wss_with_default_config());
            }
        }
        opts
    }
}

impl Connector for MqttConnector {
    fn open(&mut self, link: u64, events: mpsc::Sender<TransportEvent>) -> Box<dyn Link> {
        let opts = self.options();
        debug!(link, broker = %self.endpoint, "opening MQTT link");
        let (client, eventloop) = AsyncClient::new(opts, REQUEST_CAPACITY);
        let task = tokio::spawn(drive(link, eventloop, events, self.connect_timeout));
        Box::new(MqttLink { client, task })
    }

    fn set_endpoint(&mut self, endpoint: BrokerEndpoint) {
        self.endpoint = endpoint;
    }
}

/// Polls the event loop and translates what happens into [`LinkEvent`]s.
/// Returns after the first connection error; reconnecting is the manager's
/// job, never rumqttc's.
async fn drive(
    link: u64,
    mut eventloop: EventLoop,
    events: mpsc::Sender<TransportEvent>,
    connect_timeout: Duration,
) {
    let mut connected = false;

    loop {
        let polled = if connected {
            eventloop.poll().await
        } else {
            match time::timeout(connect_timeout, eventloop.poll()).await {
                Ok(polled) => polled,
                Err(_) => {
                    let event = LinkEvent::Failed("connect timed out".into());
                    let _ = events.send(TransportEvent { link, event }).await;
                    return;
                }
            }
        };

        let event = match polled {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                if ack.code == ConnectReturnCode::Success {
                    connected = true;
                    LinkEvent::Connected
                } else {
                    LinkEvent::Failed(format!("broker refused connection: {:?}", ack.code))
                }
            }
            Ok(Event::Incoming(Packet::SubAck(ack))) => {
                if ack
                    .return_codes
                    .iter()
                    .any(|code| matches!(code, SubscribeReasonCode::Failure))
                {
                    LinkEvent::SubscribeFailed("broker rejected subscription".into())
                } else {
                    continue;
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => LinkEvent::Message {
                topic: publish.topic,
                payload: publish.payload.to_vec(),
            },
            Ok(_) => continue,
            Err(e) => {
                let event = if connected {
                    LinkEvent::Closed(e.to_string())
                } else {
                    LinkEvent::Failed(e.to_string())
                };
                let _ = events.send(TransportEvent { link, event }).await;
                return;
            }
        };

        let terminal = matches!(event, LinkEvent::Failed(_));
        if events.send(TransportEvent { link, event }).await.is_err() || terminal {
            return;
        }
    }
}

// ---------------------------------------------------------------------------
// MqttLink
// ---------------------------------------------------------------------------

struct MqttLink {
    client: AsyncClient,
    task: JoinHandle<()>,
}

impl Link for MqttLink {
    fn subscribe(&mut self, topic: &str) -> Result<(), TransportError> {
        if self.task.is_finished() {
            return Err(TransportError::NotOpen);
        }
        self.client
            .try_subscribe(topic, QoS::AtMostOnce)
            .map_err(|e| TransportError::Subscribe(e.to_string()))
    }

    fn close(&mut self) {
        if let Err(e) = self.client.try_disconnect() {
            debug!(error = %e, "disconnect request not queued");
        }
        let task = self.task.abort_handle();
        tokio::spawn(async move {
            time::sleep(CLOSE_GRACE).await;
            if !task.is_finished() {
                warn!("MQTT event loop still running after close; aborting");
                task.abort();
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(transport: TransportKind) -> MqttConfig {
        MqttConfig {
            endpoint: BrokerEndpoint::new("broker.emqx.io", 8084).unwrap(),
            transport,
            ws_path: "/mqtt".into(),
            topic: "iot/monitoring".into(),
            client_prefix: "kompos_monitor".into(),
            keep_alive_secs: 20,
            connect_timeout_secs: 10,
            max_retries: 5,
            autoconnect: false,
        }
    }

    #[test]
    fn websocket_transports_use_full_url() {
        assert_eq!(
            MqttConnector::new(&config(TransportKind::Wss)).broker_address(),
            "wss://broker.emqx.io:8084/mqtt"
        );
        assert_eq!(
            MqttConnector::new(&config(TransportKind::Ws)).broker_address(),
            "ws://broker.emqx.io:8084/mqtt"
        );
    }

    #[test]
    fn tcp_uses_bare_host() {
        let connector = MqttConnector::new(&config(TransportKind::Tcp));
        assert_eq!(connector.broker_address(), "broker.emqx.io");
    }

    #[test]
    fn endpoint_change_applies_to_next_address() {
        let mut connector = MqttConnector::new(&config(TransportKind::Wss));
        connector.set_endpoint(BrokerEndpoint::new("broker.hivemq.com", 8884).unwrap());
        assert_eq!(connector.broker_address(), "wss://broker.hivemq.com:8884/mqtt");
    }

    #[test]
    fn client_id_carries_prefix_and_keep_alive() {
        let opts = MqttConnector::new(&config(TransportKind::Tcp)).options();
        assert!(opts.client_id().starts_with("kompos_monitor_"));
        assert_eq!(opts.keep_alive(), Duration::from_secs(20));
        assert_eq!(opts.broker_address(), ("broker.emqx.io".to_owned(), 8084));
    }
}
