//! Handles to the node that owns a device.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use tokio::sync::{mpsc, oneshot};

use super::messages::{MasterRequest, ProxyEnvelope, ProxyReply, ProxyRequest};
use crate::error::DocumentedError;

/// Channel to the endpoint serving one proxied transaction.
///
/// Asks that are not answered in time, or that find the channel closed,
/// resolve to a "master is down" [`ProxyReply::Failure`].
#[derive(Debug, Clone)]
pub struct OwnerRef {
    device: Arc<str>,
    mailbox: mpsc::UnboundedSender<ProxyEnvelope>,
}

impl OwnerRef {
    pub fn new(device: impl Into<String>, mailbox: mpsc::UnboundedSender<ProxyEnvelope>) -> Self {
        Self {
            device: Arc::from(device.into()),
            mailbox,
        }
    }

    /// A reference whose target is not known yet.
    ///
    /// Messages sent before `resolve` completes are queued and delivered in
    /// order once it does. If it fails, every ask is answered with the
    /// resolution cause and tells are dropped.
    pub fn deferred<F>(device: impl Into<String>, resolve: F) -> Self
    where
        F: Future<Output = Result<OwnerRef, DocumentedError>> + Send + 'static,
    {
        let device = device.into();
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(forward(device.clone(), resolve, rx));
        Self::new(device, tx)
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    pub fn is_closed(&self) -> bool {
        self.mailbox.is_closed()
    }

    /// Fire-and-forget. Returns false if the owner is gone.
    pub fn tell(&self, request: ProxyRequest) -> bool {
        self.mailbox.send(ProxyEnvelope::tell(request)).is_ok()
    }

    /// Send `request` and wait up to `timeout` for the reply.
    pub async fn ask(&self, request: ProxyRequest, timeout: Duration) -> ProxyReply {
        let name = request.name();
        let (envelope, reply) = ProxyEnvelope::ask(request);
        if self.mailbox.send(envelope).is_err() {
            warn!("{}: Owner unreachable, {} not sent", self.device, name);
            return self.master_is_down();
        }
        match tokio::time::timeout(timeout, reply).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => {
                warn!("{}: Owner dropped {} without replying", self.device, name);
                self.master_is_down()
            }
            Err(_) => {
                warn!(
                    "{}: No reply to {} within {:?}",
                    self.device, name, timeout
                );
                self.master_is_down()
            }
        }
    }

    fn master_is_down(&self) -> ProxyReply {
        ProxyReply::Failure(DocumentedError::master_is_down(&self.device))
    }
}

async fn forward<F>(device: String, resolve: F, mut queued: mpsc::UnboundedReceiver<ProxyEnvelope>)
where
    F: Future<Output = Result<OwnerRef, DocumentedError>>,
{
    match resolve.await {
        Ok(owner) => {
            debug!("{}: Owner resolved, forwarding queued messages", device);
            while let Some(envelope) = queued.recv().await {
                if let Err(mpsc::error::SendError(envelope)) = owner.mailbox.send(envelope) {
                    envelope.fail(DocumentedError::master_is_down(&device));
                }
            }
        }
        Err(cause) => {
            warn!("{}: Owner resolution failed: {}", device, cause);
            while let Some(envelope) = queued.recv().await {
                envelope.fail(cause.clone());
            }
        }
    }
}

/// Channel to the node that owns a device session.
#[derive(Debug, Clone)]
pub struct MasterRef {
    device: Arc<str>,
    mailbox: mpsc::UnboundedSender<MasterRequest>,
}

impl MasterRef {
    pub fn new(device: impl Into<String>, mailbox: mpsc::UnboundedSender<MasterRequest>) -> Self {
        Self {
            device: Arc::from(device.into()),
            mailbox,
        }
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    /// Ask the owner to open a transaction.
    pub async fn new_transaction(&self, timeout: Duration) -> Result<OwnerRef, DocumentedError> {
        let (tx, rx) = oneshot::channel();
        self.mailbox
            .send(MasterRequest::NewTransaction(tx))
            .map_err(|_| DocumentedError::master_is_down(&self.device))?;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(owner)) => Ok(owner),
            Ok(Err(_)) | Err(_) => {
                warn!("{}: Owner did not open a transaction", self.device);
                Err(DocumentedError::master_is_down(&self.device))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{DataPath, Datastore};
    use crate::error::{ErrorSeverity, ErrorTag, ErrorType};

    fn read() -> ProxyRequest {
        ProxyRequest::Read {
            store: Datastore::Configuration,
            path: DataPath::root(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_ask_timeout_is_master_is_down() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let owner = OwnerRef::new("dev1", tx);

        let reply = owner.ask(read(), Duration::from_secs(5)).await;

        match reply {
            ProxyReply::Failure(err) => {
                assert_eq!(err.severity, ErrorSeverity::Warning);
                assert_eq!(err.tag, ErrorTag::OperationFailed);
                assert_eq!(err.error_type, ErrorType::Application);
                assert_eq!(err.message, "dev1: Master is down. Please try again.");
            }
            other => panic!("unexpected reply: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_ask_on_closed_channel_fails_fast() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let owner = OwnerRef::new("dev1", tx);
        assert!(owner.is_closed());
        assert!(!owner.tell(ProxyRequest::Cancel));

        let reply = owner.ask(read(), Duration::from_secs(60)).await;
        assert_eq!(
            reply,
            ProxyReply::Failure(DocumentedError::master_is_down("dev1"))
        );
    }

    #[tokio::test]
    async fn test_deferred_queues_until_resolved() {
        let (resolved_tx, resolved_rx) = oneshot::channel::<OwnerRef>();
        let owner = OwnerRef::deferred("dev1", async move {
            resolved_rx
                .await
                .map_err(|_| DocumentedError::operation_failed("no owner"))
        });

        assert!(owner.tell(ProxyRequest::Delete {
            store: Datastore::Configuration,
            path: DataPath::root(),
        }));
        let asking = tokio::spawn({
            let owner = owner.clone();
            async move { owner.ask(ProxyRequest::Commit, Duration::from_secs(60)).await }
        });
        tokio::task::yield_now().await;

        let (target_tx, mut target_rx) = mpsc::unbounded_channel();
        resolved_tx.send(OwnerRef::new("dev1", target_tx)).unwrap();

        let first = target_rx.recv().await.unwrap();
        assert_eq!(first.request.name(), "delete");
        assert!(first.reply.is_none());

        let second = target_rx.recv().await.unwrap();
        assert_eq!(second.request, ProxyRequest::Commit);
        second.reply.unwrap().send(ProxyReply::Committed).unwrap();

        assert_eq!(asking.await.unwrap(), ProxyReply::Committed);
    }

    #[tokio::test]
    async fn test_deferred_resolution_failure_answers_asks() {
        let cause = DocumentedError::operation_failed("device not mounted");
        let owner = OwnerRef::deferred("dev1", {
            let cause = cause.clone();
            async move { Err(cause) }
        });

        assert!(owner.tell(ProxyRequest::Cancel));
        let reply = owner.ask(read(), Duration::from_secs(60)).await;
        assert_eq!(reply, ProxyReply::Failure(cause));
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_transaction_without_master() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let master = MasterRef::new("dev1", tx);

        let err = master
            .new_transaction(Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err, DocumentedError::master_is_down("dev1"));
    }
}
