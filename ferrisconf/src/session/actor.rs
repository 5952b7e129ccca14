//! The per-device session task.
//!
//! All lifecycle mutation happens here, one command at a time. Slow work
//! (transport connect, schema resolution, retry sleeps) runs in spawned tasks
//! that report back through the mailbox tagged with their incarnation or
//! retry token.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::correlator::RequestCorrelator;
use super::preferences::{CapabilityOverrides, SessionPreferences};
use super::state::{Action, ConnectionState, Event, SessionMachine};
use super::SessionSnapshot;
use crate::communicator::DeviceHandler;
use crate::device::DeviceId;
use crate::error::{RpcError, SchemaResolutionError, SessionError, TransportError};
use crate::rpc::message::is_notification;
use crate::rpc::{Rpc, Target};
use crate::schema::{DeviceSourceRepository, ResolvedSchema, SchemaResolver};
use crate::transport::{Transport, TransportEvent, TransportSession};

pub(crate) type ConnectReply = oneshot::Sender<Result<Arc<SessionSnapshot>, SessionError>>;

pub(crate) enum SessionCommand {
    Connect(ConnectReply),
    Disconnect(oneshot::Sender<()>),
    TransportOpened {
        incarnation: u64,
        result: Result<Arc<dyn TransportSession>, TransportError>,
        events: mpsc::UnboundedReceiver<TransportEvent>,
    },
    TransportDown {
        incarnation: u64,
        reason: String,
    },
    SchemaResolved {
        incarnation: u64,
        result: Result<ResolvedSchema, SchemaResolutionError>,
    },
    RetryElapsed {
        token: u64,
    },
    KeepaliveFailed {
        incarnation: u64,
        reason: String,
    },
    Shutdown,
}

/// State the actor publishes for the communicator to read.
pub(crate) struct Shared {
    pub device: DeviceId,
    pub correlator: Arc<RequestCorrelator>,
    pub state: watch::Sender<ConnectionState>,
    snapshot: RwLock<Option<Arc<SessionSnapshot>>>,
}

impl Shared {
    pub fn new(device: DeviceId, correlator: RequestCorrelator) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            device,
            correlator: Arc::new(correlator),
            state,
            snapshot: RwLock::new(None),
        }
    }

    pub fn snapshot(&self) -> Option<Arc<SessionSnapshot>> {
        self.snapshot
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn set_snapshot(&self, snapshot: Option<Arc<SessionSnapshot>>) {
        *self.snapshot.write().unwrap_or_else(|e| e.into_inner()) = snapshot;
    }
}

pub(crate) struct SessionActor {
    shared: Arc<Shared>,
    machine: SessionMachine,
    transport: Arc<dyn Transport>,
    resolver: SchemaResolver,
    handler: Option<Arc<dyn DeviceHandler>>,
    overrides: CapabilityOverrides,
    keepalive_interval: Option<Duration>,
    mailbox: mpsc::UnboundedReceiver<SessionCommand>,
    sender: mpsc::UnboundedSender<SessionCommand>,
    session: Option<Arc<dyn TransportSession>>,
    preferences: Option<Arc<SessionPreferences>>,
    schema: Option<ResolvedSchema>,
    waiters: Vec<ConnectReply>,
    connecting: Option<JoinHandle<()>>,
    resolving: Option<JoinHandle<()>>,
    pump: Option<JoinHandle<()>>,
    retry: Option<JoinHandle<()>>,
    keepalive: Option<JoinHandle<()>>,
}

impl SessionActor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        shared: Arc<Shared>,
        machine: SessionMachine,
        transport: Arc<dyn Transport>,
        resolver: SchemaResolver,
        handler: Option<Arc<dyn DeviceHandler>>,
        overrides: CapabilityOverrides,
        keepalive_interval: Option<Duration>,
        mailbox: mpsc::UnboundedReceiver<SessionCommand>,
        sender: mpsc::UnboundedSender<SessionCommand>,
    ) -> Self {
        Self {
            shared,
            machine,
            transport,
            resolver,
            handler,
            overrides,
            keepalive_interval,
            mailbox,
            sender,
            session: None,
            preferences: None,
            schema: None,
            waiters: Vec::new(),
            connecting: None,
            resolving: None,
            pump: None,
            retry: None,
            keepalive: None,
        }
    }

    pub async fn run(mut self) {
        debug!("{}: Session task started", self.shared.device);
        while let Some(command) = self.mailbox.recv().await {
            match command {
                SessionCommand::Connect(reply) => self.on_connect(reply),
                SessionCommand::Disconnect(reply) => {
                    self.stop();
                    let _ = reply.send(());
                }
                SessionCommand::TransportOpened {
                    incarnation,
                    result,
                    events,
                } => self.on_transport_opened(incarnation, result, events),
                SessionCommand::TransportDown {
                    incarnation,
                    reason,
                } => self.apply(Event::SessionDown {
                    incarnation,
                    reason,
                }),
                SessionCommand::SchemaResolved {
                    incarnation,
                    result,
                } => self.on_schema_resolved(incarnation, result),
                SessionCommand::RetryElapsed { token } => self.apply(Event::RetryElapsed { token }),
                SessionCommand::KeepaliveFailed {
                    incarnation,
                    reason,
                } => {
                    warn!("{}: Keepalive failed: {}", self.shared.device, reason);
                    self.apply(Event::SessionDown {
                        incarnation,
                        reason: format!("keepalive failed: {}", reason),
                    });
                }
                SessionCommand::Shutdown => break,
            }
        }
        self.stop();
        debug!("{}: Session task finished", self.shared.device);
    }

    fn device_name(&self) -> String {
        self.shared.device.to_string()
    }

    fn on_connect(&mut self, reply: ConnectReply) {
        match self.machine.state() {
            ConnectionState::Up => {
                let snapshot = self
                    .shared
                    .snapshot()
                    .ok_or_else(|| SessionError::NotConnected {
                        device: self.device_name(),
                    });
                let _ = reply.send(snapshot);
            }
            ConnectionState::Failed if self.machine.given_up().is_some() => {
                let _ = reply.send(Err(self.given_up_error()));
            }
            _ => {
                self.waiters.push(reply);
                self.apply(Event::Start);
            }
        }
    }

    fn stop(&mut self) {
        self.apply(Event::Stop);
        // Abandon anything still in flight even if the machine was already idle.
        self.abort_tasks();
        let err = SessionError::Disconnected {
            device: self.device_name(),
        };
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(Err(err.clone()));
        }
    }

    fn on_transport_opened(
        &mut self,
        incarnation: u64,
        result: Result<Arc<dyn TransportSession>, TransportError>,
        events: mpsc::UnboundedReceiver<TransportEvent>,
    ) {
        if incarnation == self.machine.incarnation() {
            self.connecting = None;
        }
        match result {
            Ok(session) => {
                let actions = self.machine.handle(Event::TransportUp { incarnation });
                if actions.contains(&Action::DiscardTransport { incarnation }) {
                    debug!(
                        "{}: Closing transport of superseded incarnation {}",
                        self.shared.device, incarnation
                    );
                    session.close();
                    return;
                }
                self.shared.correlator.attach(incarnation, session.clone());
                self.session = Some(session);
                self.pump = Some(tokio::spawn(pump_events(
                    incarnation,
                    events,
                    self.shared.clone(),
                    self.handler.clone(),
                    self.sender.clone(),
                )));
                self.execute(actions);
            }
            Err(err) => self.apply(Event::TransportFailed {
                incarnation,
                reason: err.to_string(),
            }),
        }
    }

    fn on_schema_resolved(
        &mut self,
        incarnation: u64,
        result: Result<ResolvedSchema, SchemaResolutionError>,
    ) {
        if incarnation != self.machine.incarnation() {
            return;
        }
        self.resolving = None;
        match result {
            Ok(resolved) => {
                for unresolved in &resolved.unresolved {
                    warn!(
                        "{}: Capability {} not available in schema context ({:?})",
                        self.shared.device, unresolved.source, unresolved.reason
                    );
                }
                self.schema = Some(resolved);
                self.apply(Event::SchemaReady { incarnation });
            }
            Err(err) => self.apply(Event::SchemaFailed {
                incarnation,
                reason: err.to_string(),
            }),
        }
    }

    fn apply(&mut self, event: Event) {
        let actions = self.machine.handle(event);
        self.execute(actions);
    }

    fn execute(&mut self, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::Transition(state) => self.transition(state),
                Action::OpenTransport { incarnation } => self.open_transport(incarnation),
                Action::DiscardTransport { .. } => {}
                Action::ResolveSchema { incarnation } => self.resolve_schema(incarnation),
                Action::FailPending => {
                    self.shared.correlator.teardown();
                }
                Action::CloseTransport => self.close_transport(),
                Action::ScheduleRetry { token, delay } => {
                    self.cancel_retry();
                    let sender = self.sender.clone();
                    self.retry = Some(tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        let _ = sender.send(SessionCommand::RetryElapsed { token });
                    }));
                }
                Action::CancelRetry => self.cancel_retry(),
                Action::NotifyUp => self.notify_up(),
                Action::NotifyDown => {
                    if let Some(handler) = &self.handler {
                        handler.on_device_disconnected(&self.shared.device);
                    }
                }
                Action::NotifyGivenUp { .. } => {
                    let err = self.given_up_error();
                    for waiter in self.waiters.drain(..) {
                        let _ = waiter.send(Err(err.clone()));
                    }
                    if let Some(handler) = &self.handler {
                        handler.on_device_failed(&self.shared.device, &err);
                    }
                }
            }
        }
    }

    fn transition(&mut self, state: ConnectionState) {
        if state == ConnectionState::Up {
            if let (Some(preferences), Some(schema)) = (&self.preferences, &self.schema) {
                self.shared.set_snapshot(Some(Arc::new(SessionSnapshot {
                    preferences: preferences.clone(),
                    schema: schema.clone(),
                    session_id: self.session.as_ref().and_then(|s| s.session_id()),
                })));
            }
        } else {
            self.shared.set_snapshot(None);
        }
        if state == ConnectionState::Disconnected {
            self.preferences = None;
            self.schema = None;
        }

        let previous = self.shared.state.send_replace(state);
        if previous != state {
            info!("{}: {} -> {}", self.shared.device, previous, state);
        }
    }

    fn open_transport(&mut self, incarnation: u64) {
        if let Some(task) = self.connecting.take() {
            task.abort();
        }
        let transport = self.transport.clone();
        let device = self.shared.device.clone();
        let sender = self.sender.clone();
        self.connecting = Some(tokio::spawn(async move {
            let (events_tx, events_rx) = mpsc::unbounded_channel();
            let result = transport.connect(&device, events_tx).await;
            let _ = sender.send(SessionCommand::TransportOpened {
                incarnation,
                result,
                events: events_rx,
            });
        }));
    }

    fn resolve_schema(&mut self, incarnation: u64) {
        let Some(session) = &self.session else {
            self.apply(Event::SchemaFailed {
                incarnation,
                reason: "no transport session".to_string(),
            });
            return;
        };

        let preferences = Arc::new(
            SessionPreferences::from_capabilities(session.capabilities())
                .with_overrides(&self.overrides),
        );
        debug!("{}: Session preferences: {}", self.shared.device, preferences);
        let required = preferences.required_sources();
        let monitoring = preferences.is_monitoring_supported();
        self.preferences = Some(preferences);

        if let Some(task) = self.resolving.take() {
            task.abort();
        }
        let resolver = if monitoring {
            debug!("{}: Missing sources will be fetched from the device", self.shared.device);
            self.resolver.with_repository(Arc::new(DeviceSourceRepository::new(
                self.device_name(),
                self.resolver.repository().clone(),
                self.shared.correlator.clone(),
            )))
        } else {
            self.resolver.clone()
        };
        let sender = self.sender.clone();
        self.resolving = Some(tokio::spawn(async move {
            let result = resolver.resolve(required).await;
            let _ = sender.send(SessionCommand::SchemaResolved {
                incarnation,
                result,
            });
        }));
    }

    fn close_transport(&mut self) {
        if let Some(task) = self.keepalive.take() {
            task.abort();
        }
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
        if let Some(task) = self.resolving.take() {
            task.abort();
        }
        if let Some(task) = self.connecting.take() {
            task.abort();
        }
        if let Some(session) = self.session.take() {
            session.close();
        }
    }

    fn cancel_retry(&mut self) {
        if let Some(retry) = self.retry.take() {
            retry.abort();
        }
    }

    fn abort_tasks(&mut self) {
        self.cancel_retry();
        self.close_transport();
    }

    fn notify_up(&mut self) {
        let Some(snapshot) = self.shared.snapshot() else {
            return;
        };
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(Ok(snapshot.clone()));
        }
        if let Some(handler) = &self.handler {
            handler.on_device_connected(&self.shared.device, &snapshot);
        }
        self.start_keepalive();
    }

    fn start_keepalive(&mut self) {
        if let Some(task) = self.keepalive.take() {
            task.abort();
        }
        let Some(interval) = self.keepalive_interval else {
            return;
        };
        self.keepalive = Some(tokio::spawn(run_keepalive(
            self.machine.incarnation(),
            interval,
            self.shared.clone(),
            self.sender.clone(),
        )));
    }

    fn given_up_error(&self) -> SessionError {
        SessionError::GivenUp {
            device: self.device_name(),
            attempts: self.machine.attempts(),
            reason: self.machine.given_up().unwrap_or_default().to_string(),
        }
    }
}

/// Route one incarnation's inbound traffic until the transport goes away.
async fn pump_events(
    incarnation: u64,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
    shared: Arc<Shared>,
    handler: Option<Arc<dyn DeviceHandler>>,
    mailbox: mpsc::UnboundedSender<SessionCommand>,
) {
    let reason = loop {
        match events.recv().await {
            Some(TransportEvent::Message(message)) => {
                if is_notification(&message) {
                    match &handler {
                        Some(handler) => handler.on_notification(&shared.device, &message),
                        None => debug!("{}: Dropping notification, no handler", shared.device),
                    }
                } else {
                    shared.correlator.on_message(incarnation, message);
                }
            }
            Some(TransportEvent::Down { reason }) => break reason,
            None => break "transport event stream ended".to_string(),
        }
    };
    let _ = mailbox.send(SessionCommand::TransportDown {
        incarnation,
        reason,
    });
}

/// Probe an idle session with `<get-config>` on running.
///
/// Any reply, including an `<rpc-error>`, proves the session alive. A reply
/// matched to any other request defers the next keepalive. The task ends
/// after reporting the first failure.
async fn run_keepalive(
    incarnation: u64,
    interval: Duration,
    shared: Arc<Shared>,
    mailbox: mpsc::UnboundedSender<SessionCommand>,
) {
    let keepalive = Rpc::GetConfig {
        source: Target::Running,
        filter: Some(String::new()),
    };
    let mut last = Instant::now();
    loop {
        if let Some(activity) = shared.correlator.last_activity() {
            last = last.max(activity);
        }
        let deadline = last + interval;
        if Instant::now() < deadline {
            tokio::time::sleep_until(deadline).await;
            continue;
        }

        last = Instant::now();
        debug!("{}: Sending keepalive", shared.device);
        match shared.correlator.send(&keepalive).await {
            Ok(_) => {}
            Err(RpcError::Remote(err)) => {
                debug!("{}: Keepalive answered with error: {}", shared.device, err);
            }
            Err(err) => {
                let _ = mailbox.send(SessionCommand::KeepaliveFailed {
                    incarnation,
                    reason: err.to_string(),
                });
                return;
            }
        }
    }
}
