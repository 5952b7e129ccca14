//! Connection state machine.
//!
//! [`SessionMachine`] holds no timers and performs no I/O. Each event returns
//! the list of [`Action`]s the session actor must execute, in order.
//!
//! Events produced by asynchronous work (transport connect, schema
//! resolution, session loss) carry the incarnation they belong to. Every new
//! transport attempt and every stop bumps the incarnation, so results from
//! superseded attempts are recognised and ignored. Retry timers carry a token
//! for the same purpose.

use std::fmt;
use std::time::Duration;

use log::{debug, info, warn};

use super::reconnect::ReconnectPolicy;

/// Lifecycle state of one device session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    NegotiatingSchema,
    Up,
    Failed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::NegotiatingSchema => "negotiating-schema",
            ConnectionState::Up => "up",
            ConnectionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Inputs to the machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Start,
    Stop,
    TransportUp { incarnation: u64 },
    TransportFailed { incarnation: u64, reason: String },
    SchemaReady { incarnation: u64 },
    SchemaFailed { incarnation: u64, reason: String },
    SessionDown { incarnation: u64, reason: String },
    RetryElapsed { token: u64 },
}

/// Side effects requested by the machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Transition(ConnectionState),
    /// Start a transport connect for this incarnation.
    OpenTransport { incarnation: u64 },
    /// A transport opened for a superseded incarnation; close it.
    DiscardTransport { incarnation: u64 },
    /// Build the schema context for this incarnation's capabilities.
    ResolveSchema { incarnation: u64 },
    /// Fail every outstanding request with a session-closed error.
    FailPending,
    CloseTransport,
    ScheduleRetry { token: u64, delay: Duration },
    CancelRetry,
    NotifyUp,
    NotifyDown,
    NotifyGivenUp { attempts: u32, reason: String },
}

/// The session lifecycle as a pure state machine.
#[derive(Debug)]
pub struct SessionMachine {
    device: String,
    policy: ReconnectPolicy,
    state: ConnectionState,
    incarnation: u64,
    retry_token: u64,
    retry_pending: bool,
    attempts: u32,
    given_up: Option<String>,
}

impl SessionMachine {
    pub fn new(device: impl Into<String>, policy: ReconnectPolicy) -> Self {
        Self {
            device: device.into(),
            policy,
            state: ConnectionState::Disconnected,
            incarnation: 0,
            retry_token: 0,
            retry_pending: false,
            attempts: 0,
            given_up: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn incarnation(&self) -> u64 {
        self.incarnation
    }

    /// Connection attempts made since the session was last up.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// The reason retries were abandoned, while in terminal `Failed`.
    pub fn given_up(&self) -> Option<&str> {
        self.given_up.as_deref()
    }

    pub fn handle(&mut self, event: Event) -> Vec<Action> {
        debug!("{}: {:?} in state {}", self.device, event, self.state);
        match event {
            Event::Start => self.on_start(),
            Event::Stop => self.on_stop(),
            Event::TransportUp { incarnation } => self.on_transport_up(incarnation),
            Event::TransportFailed {
                incarnation,
                reason,
            } => {
                if self.is_current(incarnation) && self.state == ConnectionState::Connecting {
                    self.fail(reason, false)
                } else {
                    Vec::new()
                }
            }
            Event::SchemaReady { incarnation } => {
                if self.is_current(incarnation)
                    && self.state == ConnectionState::NegotiatingSchema
                {
                    self.attempts = 0;
                    self.state = ConnectionState::Up;
                    vec![Action::Transition(ConnectionState::Up), Action::NotifyUp]
                } else {
                    Vec::new()
                }
            }
            Event::SchemaFailed {
                incarnation,
                reason,
            } => {
                if self.is_current(incarnation)
                    && self.state == ConnectionState::NegotiatingSchema
                {
                    self.fail(reason, true)
                } else {
                    Vec::new()
                }
            }
            Event::SessionDown {
                incarnation,
                reason,
            } => self.on_session_down(incarnation, reason),
            Event::RetryElapsed { token } => self.on_retry(token),
        }
    }

    fn is_current(&self, incarnation: u64) -> bool {
        incarnation == self.incarnation
    }

    fn on_start(&mut self) -> Vec<Action> {
        match self.state {
            ConnectionState::Disconnected => {
                self.attempts = 1;
                self.given_up = None;
                self.open(true)
            }
            // Already connecting or up; terminal failure stays put until stopped.
            _ => Vec::new(),
        }
    }

    fn on_stop(&mut self) -> Vec<Action> {
        if self.state == ConnectionState::Disconnected {
            return Vec::new();
        }
        let was_up = self.state == ConnectionState::Up;
        info!("{}: Stopping session in state {}", self.device, self.state);

        self.incarnation += 1;
        self.retry_token += 1;
        self.retry_pending = false;
        self.attempts = 0;
        self.given_up = None;
        self.state = ConnectionState::Disconnected;

        let mut actions = vec![Action::CancelRetry, Action::FailPending, Action::CloseTransport];
        if was_up {
            actions.push(Action::NotifyDown);
        }
        actions.push(Action::Transition(ConnectionState::Disconnected));
        actions
    }

    fn on_transport_up(&mut self, incarnation: u64) -> Vec<Action> {
        if !self.is_current(incarnation) || self.state != ConnectionState::Connecting {
            return vec![Action::DiscardTransport { incarnation }];
        }
        self.state = ConnectionState::NegotiatingSchema;
        vec![
            Action::Transition(ConnectionState::NegotiatingSchema),
            Action::ResolveSchema { incarnation },
        ]
    }

    fn on_session_down(&mut self, incarnation: u64, reason: String) -> Vec<Action> {
        if !self.is_current(incarnation) {
            return Vec::new();
        }
        match self.state {
            ConnectionState::Up => {
                warn!("{}: Session went down: {}", self.device, reason);
                self.incarnation += 1;
                self.state = ConnectionState::Connecting;
                let mut actions = vec![
                    Action::FailPending,
                    Action::CloseTransport,
                    Action::NotifyDown,
                    Action::Transition(ConnectionState::Connecting),
                ];
                actions.extend(self.schedule_retry(reason));
                actions
            }
            ConnectionState::NegotiatingSchema => self.fail(reason, true),
            _ => Vec::new(),
        }
    }

    fn on_retry(&mut self, token: u64) -> Vec<Action> {
        if token != self.retry_token || !self.retry_pending {
            return Vec::new();
        }
        self.retry_pending = false;
        match self.state {
            ConnectionState::Failed => self.open(true),
            ConnectionState::Connecting => self.open(false),
            _ => Vec::new(),
        }
    }

    fn open(&mut self, transition: bool) -> Vec<Action> {
        self.incarnation += 1;
        self.state = ConnectionState::Connecting;
        debug!(
            "{}: Connection attempt {} (incarnation {})",
            self.device, self.attempts, self.incarnation
        );
        let mut actions = Vec::with_capacity(2);
        if transition {
            actions.push(Action::Transition(ConnectionState::Connecting));
        }
        actions.push(Action::OpenTransport {
            incarnation: self.incarnation,
        });
        actions
    }

    fn fail(&mut self, reason: String, transport_open: bool) -> Vec<Action> {
        warn!(
            "{}: Connection attempt {} failed: {}",
            self.device, self.attempts, reason
        );
        self.incarnation += 1;
        self.state = ConnectionState::Failed;
        let mut actions = Vec::new();
        if transport_open {
            actions.push(Action::FailPending);
            actions.push(Action::CloseTransport);
        }
        actions.push(Action::Transition(ConnectionState::Failed));
        actions.extend(self.schedule_retry(reason));
        actions
    }

    fn schedule_retry(&mut self, reason: String) -> Vec<Action> {
        match self.policy.next_delay(self.attempts) {
            Some(delay) => {
                self.attempts = self.attempts.saturating_add(1);
                self.retry_token += 1;
                self.retry_pending = true;
                debug!(
                    "{}: Retrying connection attempt {} after {:?}",
                    self.device, self.attempts, delay
                );
                vec![Action::ScheduleRetry {
                    token: self.retry_token,
                    delay,
                }]
            }
            None => {
                info!(
                    "{}: Failed to connect after {} attempts, not attempting",
                    self.device, self.attempts
                );
                self.state = ConnectionState::Failed;
                self.given_up = Some(reason.clone());
                vec![Action::NotifyGivenUp {
                    attempts: self.attempts,
                    reason,
                }]
            }
        }
    }
}
