use std::time::Duration;

use thiserror::Error;
use tokio::{
    sync::{
        mpsc::{self, error::TrySendError},
        watch,
    },
    task::JoinHandle,
    time,
};
use tracing::{debug, error, info, warn};

use super::{
    machine::{Action, ConnectionMachine},
    transport::{BrokerEndpoint, Connector, Link, LinkEvent, TransportError, TransportEvent},
    ConnectionState, MAX_RETRIES_MESSAGE,
};
use crate::mqtt::message::{self, BusReading};

const CHANNEL_CAPACITY: usize = 64;

#[derive(Debug)]
enum Command {
    Connect,
    Disconnect,
    SetEndpoint(BrokerEndpoint),
    Shutdown,
}

#[derive(Debug, Error)]
#[error("connection manager is not running")]
pub struct ManagerStopped;

// ---------------------------------------------------------------------------
// ConnectionHandle
// ---------------------------------------------------------------------------

/// Cheaply cloneable front door to the connection manager task.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<ConnectionState>,
}

impl ConnectionHandle {
    pub async fn connect(&self) -> Result<(), ManagerStopped> {
        self.send(Command::Connect).await
    }

    pub async fn disconnect(&self) -> Result<(), ManagerStopped> {
        self.send(Command::Disconnect).await
    }

    pub async fn set_endpoint(&self, endpoint: BrokerEndpoint) -> Result<(), ManagerStopped> {
        self.send(Command::SetEndpoint(endpoint)).await
    }

    /// Disconnect voluntarily and stop the manager task.
    pub async fn shutdown(&self) -> Result<(), ManagerStopped> {
        self.send(Command::Shutdown).await
    }

    /// Snapshot of the current state.
    pub fn state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    /// Receiver that observes every state change.
    pub fn watch(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    async fn send(&self, command: Command) -> Result<(), ManagerStopped> {
        self.commands.send(command).await.map_err(|_| ManagerStopped)
    }
}

// ---------------------------------------------------------------------------
// ConnectionManager
// ---------------------------------------------------------------------------

struct RetryTimer {
    token: u64,
    handle: JoinHandle<()>,
}

/// Owns the bus link and the reconnect timer; applies every state
/// transition on one task, in the order events arrive.
///
/// Validated readings from the subscribed topic are forwarded on `readings`.
pub struct ConnectionManager<C: Connector> {
    machine: ConnectionMachine,
    connector: C,
    link: Option<Box<dyn Link>>,
    retry: Option<RetryTimer>,
    commands: mpsc::Receiver<Command>,
    events_tx: mpsc::Sender<TransportEvent>,
    events_rx: mpsc::Receiver<TransportEvent>,
    retries_tx: mpsc::Sender<u64>,
    retries_rx: mpsc::Receiver<u64>,
    readings: mpsc::Sender<BusReading>,
    state: watch::Sender<ConnectionState>,
}

impl<C: Connector> ConnectionManager<C> {
    pub fn new(
        connector: C,
        topic: impl Into<String>,
        max_retries: u32,
        readings: mpsc::Sender<BusReading>,
    ) -> (Self, ConnectionHandle) {
        let machine = ConnectionMachine::new(topic, max_retries);
        let (state_tx, state_rx) = watch::channel(machine.state().clone());
        let (commands_tx, commands_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (events_tx, events_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (retries_tx, retries_rx) = mpsc::channel(CHANNEL_CAPACITY);

        let manager = Self {
            machine,
            connector,
            link: None,
            retry: None,
            commands: commands_rx,
            events_tx,
            events_rx,
            retries_tx,
            retries_rx,
            readings,
            state: state_tx,
        };
        let handle = ConnectionHandle { commands: commands_tx, state: state_rx };
        (manager, handle)
    }

    /// Runs until `shutdown` is requested or every handle is dropped.
    /// Spawn this via `tokio::spawn`.
    pub async fn run(mut self) {
        info!(topic = %self.machine.topic(), "Connection manager started");

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Connect) => {
                        let actions = self.machine.connect();
                        self.apply(actions);
                    }
                    Some(Command::Disconnect) => {
                        info!("Disconnect requested");
                        let actions = self.machine.disconnect();
                        self.apply(actions);
                    }
                    Some(Command::SetEndpoint(endpoint)) => {
                        info!(endpoint = %endpoint, "Broker endpoint updated; used from the next connection attempt");
                        self.connector.set_endpoint(endpoint);
                    }
                    Some(Command::Shutdown) | None => {
                        let actions = self.machine.disconnect();
                        self.apply(actions);
                        self.publish_state();
                        break;
                    }
                },
                Some(event) = self.events_rx.recv() => self.on_transport_event(event),
                Some(token) = self.retries_rx.recv() => {
                    let actions = self.machine.retry_due(token);
                    if !actions.is_empty() {
                        info!(
                            attempt = self.machine.state().retry_count,
                            "Attempting to reconnect"
                        );
                    }
                    self.apply(actions);
                }
            }

            self.publish_state();
        }

        info!("Connection manager stopped");
    }

    fn on_transport_event(&mut self, TransportEvent { link, event }: TransportEvent) {
        match event {
            LinkEvent::Connected => {
                let actions = self.machine.on_connected(link);
                if !actions.is_empty() {
                    info!(link, "Connected to broker");
                }
                self.apply(actions);
            }
            LinkEvent::SubscribeFailed(reason) => {
                warn!(link, reason = %reason, "Broker rejected subscription");
                self.machine.on_subscribe_failed(link, &reason);
            }
            LinkEvent::Failed(reason) | LinkEvent::Closed(reason) => {
                let actions = self.machine.on_link_down(link, &reason);
                if actions.is_empty() {
                    debug!(link, reason = %reason, "Ignoring link-down event");
                    return;
                }
                warn!(link, reason = %reason, "Broker connection down");
                self.apply(actions);
                if self.machine.state().next_retry.is_none() {
                    error!(
                        retries = self.machine.state().retry_count,
                        "{}", MAX_RETRIES_MESSAGE
                    );
                }
            }
            LinkEvent::Message { topic, payload } => self.forward(link, &topic, &payload),
        }
    }

    /// Hand a valid reading to ingestion without waiting: a full queue drops
    /// the reading so the manager keeps serving commands and link events.
    fn forward(&self, link: u64, topic: &str, payload: &[u8]) {
        if !self.machine.accepts_messages(link) {
            debug!(link, "Message from inactive link ignored");
            return;
        }
        if topic != self.machine.topic() {
            debug!(topic = %topic, "Message on unexpected topic ignored");
            return;
        }

        match message::parse(payload) {
            Ok(reading) => match self.readings.try_send(reading) {
                Ok(()) => {}
                Err(TrySendError::Full(reading)) => warn!(
                    house = %reading.house_name,
                    "Reading queue full; message discarded"
                ),
                Err(TrySendError::Closed(_)) => {
                    warn!("Reading consumer has stopped; message discarded")
                }
            },
            Err(e) => warn!(error = %e, "Dropping malformed bus message"),
        }
    }

    fn apply(&mut self, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::Open { link } => {
                    if let Some(mut stale) = self.link.take() {
                        stale.close();
                    }
                    info!(link, "Opening broker connection");
                    self.link = Some(self.connector.open(link, self.events_tx.clone()));
                }
                Action::Subscribe { link, topic } => {
                    let result = match self.link.as_mut() {
                        Some(l) => l.subscribe(&topic),
                        None => Err(TransportError::NotOpen),
                    };
                    match result {
                        Ok(()) => info!(topic = %topic, "Subscribed"),
                        Err(e) => {
                            warn!(topic = %topic, error = %e, "Subscribe failed");
                            self.machine.on_subscribe_failed(link, &e.to_string());
                        }
                    }
                }
                Action::Close { link } => {
                    if let Some(mut l) = self.link.take() {
                        debug!(link, "Closing broker connection");
                        l.close();
                    }
                }
                Action::ScheduleRetry { token, attempt, delay } => {
                    info!(
                        attempt,
                        delay_secs = delay.as_secs(),
                        "Scheduling reconnect attempt"
                    );
                    self.cancel_timer();
                    self.retry = Some(self.start_timer(token, delay));
                }
                Action::CancelRetry { token } => {
                    debug!(token, "Cancelling pending reconnect");
                    self.cancel_timer();
                }
            }
        }
    }

    fn start_timer(&self, token: u64, delay: Duration) -> RetryTimer {
        let tx = self.retries_tx.clone();
        let handle = tokio::spawn(async move {
            time::sleep(delay).await;
            let _ = tx.send(token).await;
        });
        RetryTimer { token, handle }
    }

    fn cancel_timer(&mut self) {
        if let Some(timer) = self.retry.take() {
            debug!(token = timer.token, "Reconnect timer aborted");
            timer.handle.abort();
        }
    }

    fn publish_state(&self) {
        let current = self.machine.state();
        self.state.send_if_modified(|state| {
            if *state != *current {
                *state = current.clone();
                true
            } else {
                false
            }
        });
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
