use std::time::Duration;

use tracing::debug;

use super::{backoff_delay, ConnectionState, ConnectionStatus, ScheduledRetry, MAX_RETRIES_MESSAGE};

/// Side effects requested by the state machine. The caller performs them in
/// order; none of them feed back synchronously except `Subscribe`, whose
/// failure is reported through [`ConnectionMachine::on_subscribe_failed`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Open { link: u64 },
    Subscribe { link: u64, topic: String },
    Close { link: u64 },
    ScheduleRetry { token: u64, attempt: u32, delay: Duration },
    CancelRetry { token: u64 },
}

/// Connect/disconnect/reconnect rules for one bus link.
///
/// Every opened link gets a fresh id; events carrying any other id are stale
/// and ignored. At most one retry is pending at a time, identified by its
/// token, and a retry only fires while the state is still `Disconnected`.
#[derive(Debug)]
pub struct ConnectionMachine {
    state: ConnectionState,
    topic: String,
    link: u64,
    link_open: bool,
    pending_retry: Option<u64>,
    next_token: u64,
}

impl ConnectionMachine {
    pub fn new(topic: impl Into<String>, max_retries: u32) -> Self {
        Self {
            state: ConnectionState::new(max_retries),
            topic: topic.into(),
            link: 0,
            link_open: false,
            pending_retry: None,
            next_token: 0,
        }
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// `true` while `link` is the current, connected link.
    pub fn accepts_messages(&self, link: u64) -> bool {
        self.is_current(link) && self.state.status == ConnectionStatus::Connected
    }

    // -----------------------------------------------------------------------
    // Caller-initiated
    // -----------------------------------------------------------------------

    /// Manual connect. No-op while connecting or connected; otherwise
    /// starts a fresh retry budget.
    pub fn connect(&mut self) -> Vec<Action> {
        if self.state.status != ConnectionStatus::Disconnected {
            debug!(status = ?self.state.status, "Connect requested while not disconnected; ignoring");
            return Vec::new();
        }

        let mut actions = self.cancel_retry();
        self.state.retry_count = 0;
        self.state.last_error = None;
        actions.extend(self.begin_attempt());
        actions
    }

    /// Voluntary disconnect from any state. Never schedules a reconnect.
    pub fn disconnect(&mut self) -> Vec<Action> {
        let mut actions = self.cancel_retry();
        if self.link_open {
            self.link_open = false;
            actions.push(Action::Close { link: self.link });
        }
        self.state.status = ConnectionStatus::Disconnected;
        self.state.last_error = None;
        actions
    }

    /// The retry timer identified by `token` elapsed.
    pub fn retry_due(&mut self, token: u64) -> Vec<Action> {
        if self.pending_retry != Some(token) {
            debug!(token, "Stale reconnect timer fired; ignoring");
            return Vec::new();
        }
        self.pending_retry = None;
        self.state.next_retry = None;

        if self.state.status != ConnectionStatus::Disconnected {
            return Vec::new();
        }

        self.state.retry_count += 1;
        self.begin_attempt()
    }

    // -----------------------------------------------------------------------
    // Transport-initiated
    // -----------------------------------------------------------------------

    pub fn on_connected(&mut self, link: u64) -> Vec<Action> {
        if !self.is_current(link) || self.state.status != ConnectionStatus::Connecting {
            return Vec::new();
        }

        self.state.status = ConnectionStatus::Connected;
        self.state.retry_count = 0;
        self.state.last_error = None;
        vec![Action::Subscribe { link, topic: self.topic.clone() }]
    }

    /// Subscription failures are recorded but keep the link up.
    pub fn on_subscribe_failed(&mut self, link: u64, reason: &str) {
        if self.accepts_messages(link) {
            self.state.last_error = Some(format!("subscribe to {} failed: {reason}", self.topic));
        }
    }

    /// The link failed to connect or dropped after connecting.
    ///
    /// Ignored for stale links and while already disconnected, so a close
    /// that follows an error on the same link is handled once.
    pub fn on_link_down(&mut self, link: u64, reason: &str) -> Vec<Action> {
        if !self.is_current(link) {
            return Vec::new();
        }

        let error = match self.state.status {
            ConnectionStatus::Disconnected => return Vec::new(),
            ConnectionStatus::Connecting => format!("connection failed: {reason}"),
            ConnectionStatus::Connected => format!("connection lost: {reason}"),
        };

        self.state.status = ConnectionStatus::Disconnected;
        self.state.last_error = Some(error);
        self.link_open = false;

        let mut actions = vec![Action::Close { link }];
        actions.extend(self.schedule_retry());
        actions
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn is_current(&self, link: u64) -> bool {
        self.link_open && self.link == link
    }

    fn begin_attempt(&mut self) -> Vec<Action> {
        self.link += 1;
        self.link_open = true;
        self.state.status = ConnectionStatus::Connecting;
        vec![Action::Open { link: self.link }]
    }

    fn schedule_retry(&mut self) -> Vec<Action> {
        if self.state.retry_count >= self.state.max_retries {
            self.state.last_error = Some(MAX_RETRIES_MESSAGE.to_owned());
            self.state.next_retry = None;
            return Vec::new();
        }

        let delay = backoff_delay(self.state.retry_count);
        let attempt = self.state.retry_count + 1;
        self.next_token += 1;
        let token = self.next_token;

        self.pending_retry = Some(token);
        self.state.next_retry = Some(ScheduledRetry { attempt, delay });
        vec![Action::ScheduleRetry { token, attempt, delay }]
    }

    fn cancel_retry(&mut self) -> Vec<Action> {
        self.state.next_retry = None;
        self.pending_retry
            .take()
            .map(|token| Action::CancelRetry { token })
            .into_iter()
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
