//! Request/reply correlation over one multiplexed session.
//!
//! Each outstanding RPC is registered under its `message-id` before it is
//! written. The reply, a timeout or session teardown removes the entry;
//! whichever removes it resolves the caller, so every request is resolved
//! exactly once.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use log::{debug, trace, warn};
use tokio::sync::{Semaphore, oneshot};

use crate::error::RpcError;
use crate::rpc::message::{reply_message_id, rpc_envelope};
use crate::rpc::{Rpc, RpcReply};
use crate::transport::TransportSession;

type ReplySender = oneshot::Sender<Result<RpcReply, RpcError>>;

struct PendingRequest {
    issued_at: Instant,
    reply: ReplySender,
}

/// One transport session's worth of correlation state.
struct Incarnation {
    id: u64,
    session: Arc<dyn TransportSession>,
    next_message_id: AtomicU64,
    pending: DashMap<String, PendingRequest>,
    closed: AtomicBool,
}

impl Incarnation {
    fn take(&self, message_id: &str) -> Option<PendingRequest> {
        self.pending.remove(message_id).map(|(_, req)| req)
    }
}

/// Registry of outstanding requests for one device.
pub struct RequestCorrelator {
    device: String,
    request_timeout: Duration,
    permits: Option<Arc<Semaphore>>,
    current: RwLock<Option<Arc<Incarnation>>>,
    last_activity: Mutex<Option<tokio::time::Instant>>,
}

impl RequestCorrelator {
    /// `concurrency_limit == 0` means unlimited.
    pub fn new(
        device: impl Into<String>,
        request_timeout: Duration,
        concurrency_limit: usize,
    ) -> Self {
        Self {
            device: device.into(),
            request_timeout,
            permits: (concurrency_limit > 0).then(|| Arc::new(Semaphore::new(concurrency_limit))),
            current: RwLock::new(None),
            last_activity: Mutex::new(None),
        }
    }

    /// When the last reply was matched to a request.
    pub fn last_activity(&self) -> Option<tokio::time::Instant> {
        *self.last_activity.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// Start correlating on a new session. Message ids restart at 1.
    ///
    /// Any previous incarnation is torn down first.
    pub fn attach(&self, incarnation: u64, session: Arc<dyn TransportSession>) {
        self.teardown();
        let next = Arc::new(Incarnation {
            id: incarnation,
            session,
            next_message_id: AtomicU64::new(1),
            pending: DashMap::new(),
            closed: AtomicBool::new(false),
        });
        *self.write_slot() = Some(next);
        debug!("{}: Correlator attached to incarnation {}", self.device, incarnation);
    }

    /// Detach the current incarnation and fail everything still pending.
    ///
    /// Returns how many requests were failed.
    pub fn teardown(&self) -> usize {
        let Some(inc) = self.write_slot().take() else {
            return 0;
        };
        inc.closed.store(true, Ordering::SeqCst);

        let ids: Vec<String> = inc.pending.iter().map(|e| e.key().clone()).collect();
        let mut failed = 0;
        for id in ids {
            if let Some(req) = inc.take(&id) {
                let _ = req.reply.send(Err(self.session_closed()));
                failed += 1;
            }
        }
        if failed > 0 {
            debug!(
                "{}: Failed {} pending requests of incarnation {}",
                self.device, failed, inc.id
            );
        }
        failed
    }

    /// Number of requests awaiting a reply.
    pub fn pending_count(&self) -> usize {
        self.read_slot()
            .as_ref()
            .map(|inc| inc.pending.len())
            .unwrap_or(0)
    }

    /// Send an RPC and wait for its reply.
    ///
    /// Waits for a concurrency permit first when a limit is configured. The
    /// request timeout starts once the request is written.
    pub async fn send(&self, rpc: &Rpc) -> Result<RpcReply, RpcError> {
        let _permit = match &self.permits {
            Some(permits) => Some(
                permits
                    .acquire()
                    .await
                    .map_err(|_| self.not_connected())?,
            ),
            None => None,
        };

        let inc = self.read_slot().clone().ok_or_else(|| self.not_connected())?;

        let message_id = inc.next_message_id.fetch_add(1, Ordering::Relaxed).to_string();
        let (tx, mut rx) = oneshot::channel();
        inc.pending.insert(
            message_id.clone(),
            PendingRequest {
                issued_at: Instant::now(),
                reply: tx,
            },
        );

        // Teardown may have drained the map just before the insert.
        if inc.closed.load(Ordering::SeqCst) {
            inc.take(&message_id);
            return Err(self.session_closed());
        }

        trace!("{}: Sending {} as message {}", self.device, rpc.name(), message_id);
        if let Err(e) = inc.session.send(rpc_envelope(&message_id, &rpc.to_xml())) {
            inc.take(&message_id);
            return Err(RpcError::SendFailed {
                device: self.device.clone(),
                message_id,
                reason: e.to_string(),
            });
        }

        match tokio::time::timeout(self.request_timeout, &mut rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(self.session_closed()),
            Err(_) => {
                if inc.take(&message_id).is_some() {
                    warn!(
                        "{}: Request {} ({}) timed out after {:?}",
                        self.device,
                        message_id,
                        rpc.name(),
                        self.request_timeout
                    );
                    return Err(RpcError::Timeout {
                        message_id,
                        timeout: self.request_timeout,
                    });
                }
                // Someone else resolved it between the deadline and the removal.
                match rx.try_recv() {
                    Ok(result) => result,
                    Err(_) => Err(self.session_closed()),
                }
            }
        }
    }

    /// Route an inbound reply to its waiting request.
    pub fn on_message(&self, incarnation: u64, message: String) {
        let Some(inc) = self.read_slot().clone() else {
            warn!("{}: Discarding reply with no session attached", self.device);
            return;
        };
        if inc.id != incarnation {
            warn!(
                "{}: Discarding reply from stale incarnation {} (current {})",
                self.device, incarnation, inc.id
            );
            return;
        }

        let Some(message_id) = reply_message_id(&message) else {
            warn!("{}: Discarding message without message-id: {}", self.device, message);
            return;
        };

        let Some(req) = inc.take(&message_id) else {
            warn!(
                "{}: Discarding unsolicited or late reply for message {}",
                self.device, message_id
            );
            return;
        };

        *self.last_activity.lock().unwrap_or_else(|e| e.into_inner()) =
            Some(tokio::time::Instant::now());

        let elapsed = req.issued_at.elapsed();
        let result = RpcReply::parse(message_id, message, elapsed).map_err(RpcError::Remote);
        if req.reply.send(result).is_err() {
            debug!("{}: Requester went away before its reply arrived", self.device);
        }
    }

    fn not_connected(&self) -> RpcError {
        RpcError::NotConnected {
            device: self.device.clone(),
        }
    }

    fn session_closed(&self) -> RpcError {
        RpcError::SessionClosed {
            device: self.device.clone(),
        }
    }

    fn read_slot(&self) -> std::sync::RwLockReadGuard<'_, Option<Arc<Incarnation>>> {
        self.current.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_slot(&self) -> std::sync::RwLockWriteGuard<'_, Option<Arc<Incarnation>>> {
        self.current.write().unwrap_or_else(|e| e.into_inner())
    }
}
