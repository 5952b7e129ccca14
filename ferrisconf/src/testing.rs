//! Test doubles: a scripted transport and an in-memory source repository.

use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use regex::Regex;
use tokio::sync::{Notify, mpsc};

use crate::communicator::DeviceHandler;
use crate::device::DeviceId;
use crate::error::{SessionError, TransportError};
use crate::schema::{SchemaBuildError, SchemaContext, SourceIdentifier, SourceRepository};
use crate::session::SessionSnapshot;
use crate::transport::{Transport, TransportEvent, TransportSession};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// `message-id` of an outbound `<rpc>`.
pub fn message_id_of(rpc: &str) -> String {
    let re = Regex::new(r#"message-id="([^"]+)""#).unwrap();
    re.captures(rpc).unwrap()[1].to_string()
}

/// `message-id` of the first sent message containing `needle`.
pub fn message_id_for(sent: &[String], needle: &str) -> String {
    let rpc = sent.iter().find(|m| m.contains(needle)).unwrap();
    message_id_of(rpc)
}

pub fn ok_reply(message_id: &str) -> String {
    format!(
        r#"<rpc-reply message-id="{}" xmlns="urn:ietf:params:xml:ns:netconf:base:1.0"><ok/></rpc-reply>"#,
        message_id
    )
}

pub fn data_reply(message_id: &str, data: &str) -> String {
    format!(
        r#"<rpc-reply message-id="{}" xmlns="urn:ietf:params:xml:ns:netconf:base:1.0"><data>{}</data></rpc-reply>"#,
        message_id, data
    )
}

pub fn error_reply(message_id: &str, tag: &str, message: &str) -> String {
    format!(
        r#"<rpc-reply message-id="{}"><rpc-error><error-type>application</error-type><error-tag>{}</error-tag><error-severity>error</error-severity><error-message>{}</error-message></rpc-error></rpc-reply>"#,
        message_id, tag, message
    )
}

/// Computes the device's reply to an outbound rpc.
pub type Responder = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Reply `<ok/>` to everything.
pub fn always_ok() -> Responder {
    Arc::new(|rpc: &str| Some(ok_reply(&message_id_of(rpc))))
}

pub fn capabilities(modules: &[&str]) -> Vec<String> {
    let mut caps = vec![
        "urn:ietf:params:netconf:base:1.0".to_string(),
        "urn:ietf:params:netconf:base:1.1".to_string(),
        "urn:ietf:params:netconf:capability:candidate:1.0".to_string(),
    ];
    for module in modules {
        caps.push(format!("urn:test:{}?module={}&revision=2024-01-01", module, module));
    }
    caps
}

pub struct MockSession {
    capabilities: Vec<String>,
    sent: Mutex<Vec<String>>,
    notify: Notify,
    fail_sends: AtomicBool,
    closed: AtomicBool,
    events: Mutex<Option<mpsc::UnboundedSender<TransportEvent>>>,
    responder: Mutex<Option<Responder>>,
}

impl MockSession {
    pub fn new(capabilities: Vec<String>) -> Self {
        Self {
            capabilities,
            sent: Mutex::new(Vec::new()),
            notify: Notify::new(),
            fail_sends: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            events: Mutex::new(None),
            responder: Mutex::new(None),
        }
    }

    fn with_events(
        self,
        events: mpsc::UnboundedSender<TransportEvent>,
        responder: Option<Responder>,
    ) -> Self {
        *self.events.lock().unwrap() = Some(events);
        *self.responder.lock().unwrap() = responder;
        self
    }

    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }

    pub async fn wait_for_sent(&self, count: usize) -> Vec<String> {
        loop {
            let notified = self.notify.notified();
            {
                let sent = self.sent.lock().unwrap();
                if sent.len() >= count {
                    return sent.clone();
                }
            }
            notified.await;
        }
    }

    pub fn fail_sends(&self) {
        self.fail_sends.store(true, Ordering::SeqCst);
    }

    pub fn set_responder(&self, responder: Option<Responder>) {
        *self.responder.lock().unwrap() = responder;
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Deliver an inbound message as if the device sent it.
    pub fn push(&self, message: impl Into<String>) {
        if let Some(events) = self.events.lock().unwrap().as_ref() {
            let _ = events.send(TransportEvent::Message(message.into()));
        }
    }

    /// Simulate the device dropping the session.
    pub fn drop_connection(&self, reason: &str) {
        if let Some(events) = self.events.lock().unwrap().take() {
            let _ = events.send(TransportEvent::Down {
                reason: reason.to_string(),
            });
        }
    }
}

impl TransportSession for MockSession {
    fn capabilities(&self) -> &[String] {
        &self.capabilities
    }

    fn session_id(&self) -> Option<u64> {
        Some(1)
    }

    fn send(&self, message: String) -> Result<(), TransportError> {
        if self.fail_sends.load(Ordering::SeqCst) || self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Disconnected);
        }
        let reply = self
            .responder
            .lock()
            .unwrap()
            .as_ref()
            .and_then(|r| r(&message));
        self.sent.lock().unwrap().push(message);
        self.notify.notify_waiters();
        if let Some(reply) = reply {
            self.push(reply);
        }
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.events.lock().unwrap().take();
    }
}

/// Outcome of one scripted connect.
#[derive(Debug, Clone)]
pub enum MockConnect {
    Succeed,
    Fail(String),
}

pub struct MockTransport {
    capabilities: Vec<String>,
    script: Mutex<VecDeque<MockConnect>>,
    fail_by_default: AtomicBool,
    responder: Option<Responder>,
    connect_delay: Option<Duration>,
    connects: AtomicUsize,
    sessions: Mutex<Vec<Arc<MockSession>>>,
    notify: Notify,
}

impl MockTransport {
    pub fn new(capabilities: Vec<String>) -> Self {
        Self {
            capabilities,
            script: Mutex::new(VecDeque::new()),
            fail_by_default: AtomicBool::new(false),
            responder: Some(always_ok()),
            connect_delay: None,
            connects: AtomicUsize::new(0),
            sessions: Mutex::new(Vec::new()),
            notify: Notify::new(),
        }
    }

    pub fn with_script(self, script: Vec<MockConnect>) -> Self {
        *self.script.lock().unwrap() = script.into();
        self
    }

    pub fn with_responder(mut self, responder: Option<Responder>) -> Self {
        self.responder = responder;
        self
    }

    pub fn with_connect_delay(mut self, delay: Duration) -> Self {
        self.connect_delay = Some(delay);
        self
    }

    /// Fail every connect not covered by the script.
    pub fn fail_by_default(&self, fail: bool) {
        self.fail_by_default.store(fail, Ordering::SeqCst);
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn session(&self, index: usize) -> Arc<MockSession> {
        self.sessions.lock().unwrap()[index].clone()
    }

    pub fn latest_session(&self) -> Arc<MockSession> {
        self.sessions.lock().unwrap().last().unwrap().clone()
    }

    pub async fn wait_for_sessions(&self, count: usize) {
        loop {
            let notified = self.notify.notified();
            if self.sessions.lock().unwrap().len() >= count {
                return;
            }
            notified.await;
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(
        &self,
        _device: &DeviceId,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Arc<dyn TransportSession>, TransportError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.connect_delay {
            tokio::time::sleep(delay).await;
        }
        let step = self.script.lock().unwrap().pop_front();
        let step = step.unwrap_or_else(|| {
            if self.fail_by_default.load(Ordering::SeqCst) {
                MockConnect::Fail("connection refused".into())
            } else {
                MockConnect::Succeed
            }
        });
        match step {
            MockConnect::Fail(reason) => Err(TransportError::Io(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                reason,
            ))),
            MockConnect::Succeed => {
                let session = Arc::new(
                    MockSession::new(self.capabilities.clone())
                        .with_events(events, self.responder.clone()),
                );
                self.sessions.lock().unwrap().push(session.clone());
                self.notify.notify_waiters();
                Ok(session)
            }
        }
    }
}

/// In-memory repository with configurable failures.
#[derive(Default)]
pub struct FakeRepository {
    missing: HashSet<SourceIdentifier>,
    unresolvable: HashSet<SourceIdentifier>,
    unsatisfied: HashSet<SourceIdentifier>,
    scripted: Mutex<VecDeque<SchemaBuildError>>,
    stored: Mutex<BTreeMap<SourceIdentifier, Bytes>>,
    build_calls: AtomicUsize,
    fetch_calls: AtomicUsize,
}

impl FakeRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_missing(mut self, id: SourceIdentifier) -> Self {
        self.missing.insert(id);
        self
    }

    pub fn with_unresolvable(mut self, id: SourceIdentifier) -> Self {
        self.unresolvable.insert(id);
        self
    }

    pub fn with_unsatisfied(mut self, id: SourceIdentifier) -> Self {
        self.unsatisfied.insert(id);
        self
    }

    /// Return `err` from the next build, before any other rule applies.
    pub fn with_scripted(self, err: SchemaBuildError) -> Self {
        self.scripted.lock().unwrap().push_back(err);
        self
    }

    pub fn build_calls(&self) -> usize {
        self.build_calls.load(Ordering::SeqCst)
    }

    pub fn fetch_calls(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    /// Text handed to `store_source` for `id`.
    pub fn stored(&self, id: &SourceIdentifier) -> Option<Bytes> {
        self.stored.lock().unwrap().get(id).cloned()
    }

    /// Missing unless something stored it since.
    fn is_missing(&self, id: &SourceIdentifier) -> bool {
        self.missing.contains(id) && !self.stored.lock().unwrap().contains_key(id)
    }
}

#[async_trait]
impl SourceRepository for FakeRepository {
    async fn fetch_source(&self, id: &SourceIdentifier) -> Result<Bytes, SchemaBuildError> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(text) = self.stored(id) {
            return Ok(text);
        }
        if self.missing.contains(id) {
            return Err(SchemaBuildError::MissingSource(id.clone()));
        }
        Ok(Bytes::from(format!("module {} {{}}", id.name())))
    }

    async fn build_context(
        &self,
        sources: &BTreeSet<SourceIdentifier>,
    ) -> Result<SchemaContext, SchemaBuildError> {
        self.build_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.scripted.lock().unwrap().pop_front() {
            return Err(err);
        }
        if let Some(id) = sources.iter().find(|s| self.is_missing(s)) {
            return Err(SchemaBuildError::MissingSource(id.clone()));
        }
        if let Some(id) = sources.iter().find(|s| self.unresolvable.contains(*s)) {
            return Err(SchemaBuildError::Resolution {
                failed_source: Some(id.clone()),
                resolved: BTreeSet::new(),
                unsatisfied: BTreeSet::new(),
            });
        }
        let unsatisfied: BTreeSet<_> = sources
            .iter()
            .filter(|s| self.unsatisfied.contains(*s))
            .cloned()
            .collect();
        if !unsatisfied.is_empty() {
            return Err(SchemaBuildError::Resolution {
                failed_source: None,
                resolved: sources.difference(&unsatisfied).cloned().collect(),
                unsatisfied,
            });
        }
        Ok(SchemaContext::new(sources.clone()))
    }

    async fn store_source(
        &self,
        id: &SourceIdentifier,
        text: Bytes,
    ) -> Result<(), SchemaBuildError> {
        self.stored.lock().unwrap().insert(id.clone(), text);
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum HandlerEvent {
    Connected,
    Disconnected,
    Failed(String),
    Notification(String),
}

/// Records every callback in order.
#[derive(Default)]
pub struct RecordingHandler {
    events: Mutex<Vec<HandlerEvent>>,
    notify: Notify,
}

impl RecordingHandler {
    pub fn events(&self) -> Vec<HandlerEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, wanted: fn(&HandlerEvent) -> bool) -> usize {
        self.events().iter().filter(|e| wanted(e)).count()
    }

    pub async fn wait_for(&self, wanted: fn(&HandlerEvent) -> bool) {
        loop {
            let notified = self.notify.notified();
            if self.events.lock().unwrap().iter().any(wanted) {
                return;
            }
            notified.await;
        }
    }

    fn record(&self, event: HandlerEvent) {
        self.events.lock().unwrap().push(event);
        self.notify.notify_waiters();
    }
}

impl DeviceHandler for RecordingHandler {
    fn on_device_connected(&self, _device: &DeviceId, _snapshot: &Arc<SessionSnapshot>) {
        self.record(HandlerEvent::Connected);
    }

    fn on_device_disconnected(&self, _device: &DeviceId) {
        self.record(HandlerEvent::Disconnected);
    }

    fn on_device_failed(&self, _device: &DeviceId, error: &SessionError) {
        self.record(HandlerEvent::Failed(error.to_string()));
    }

    fn on_notification(&self, _device: &DeviceId, notification: &str) {
        self.record(HandlerEvent::Notification(notification.to_string()));
    }
}
