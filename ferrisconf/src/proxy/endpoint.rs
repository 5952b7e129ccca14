//! Owner side: serving proxied transactions against a local session.

use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::sync::mpsc;

use super::messages::{MasterRequest, ProxyEnvelope, ProxyReply, ProxyRequest};
use super::owner::{MasterRef, OwnerRef};
use crate::data::{DataNode, DataPath, Datastore};
use crate::error::DocumentedError;

/// A transaction executed on the node that owns the device.
///
/// Failures are reported in the shape that crosses the cluster channel.
#[async_trait]
pub trait DataTransaction: Send {
    async fn read(
        &mut self,
        store: Datastore,
        path: &DataPath,
    ) -> Result<Option<DataNode>, DocumentedError>;

    async fn exists(&mut self, store: Datastore, path: &DataPath) -> Result<bool, DocumentedError> {
        Ok(self.read(store, path).await?.is_some())
    }

    async fn put(
        &mut self,
        store: Datastore,
        path: &DataPath,
        data: DataNode,
    ) -> Result<(), DocumentedError>;

    async fn merge(
        &mut self,
        store: Datastore,
        path: &DataPath,
        data: DataNode,
    ) -> Result<(), DocumentedError>;

    async fn delete(&mut self, store: Datastore, path: &DataPath) -> Result<(), DocumentedError>;

    async fn commit(&mut self) -> Result<(), DocumentedError>;

    /// Abandon all writes. Returns false if cleanup failed.
    async fn cancel(&mut self) -> bool;
}

/// Creates the transaction behind each proxied transaction.
pub type TransactionFactory = Arc<dyn Fn() -> Box<dyn DataTransaction> + Send + Sync>;

/// Serves one proxied transaction, one message at a time.
pub struct TransactionEndpoint {
    device: String,
    transaction: Box<dyn DataTransaction>,
    write_failure: Option<DocumentedError>,
    closed: bool,
}

impl TransactionEndpoint {
    /// Spawn an endpoint task and return the reference proxies talk to.
    ///
    /// If every reference is dropped before commit or cancel, the transaction
    /// is cancelled.
    pub fn spawn(device: impl Into<String>, transaction: Box<dyn DataTransaction>) -> OwnerRef {
        let device = device.into();
        let (tx, rx) = mpsc::unbounded_channel();
        let endpoint = Self {
            device: device.clone(),
            transaction,
            write_failure: None,
            closed: false,
        };
        tokio::spawn(endpoint.run(rx));
        OwnerRef::new(device, tx)
    }

    async fn run(mut self, mut mailbox: mpsc::UnboundedReceiver<ProxyEnvelope>) {
        while let Some(ProxyEnvelope { request, reply }) = mailbox.recv().await {
            let name = request.name();
            let response = self.handle(request).await;
            match (reply, response) {
                (Some(reply), Some(response)) => {
                    let _ = reply.send(response);
                }
                (None, Some(ProxyReply::Failure(cause))) => {
                    debug!("{}: {} failed: {}", self.device, name, cause);
                }
                _ => {}
            }
        }
        if !self.closed {
            info!("{}: Proxy went away, cancelling open transaction", self.device);
            self.transaction.cancel().await;
        }
    }

    async fn handle(&mut self, request: ProxyRequest) -> Option<ProxyReply> {
        if self.closed {
            return Some(ProxyReply::Failure(DocumentedError::operation_failed(
                format!("{}: transaction already closed", self.device),
            )));
        }
        let reply = match request {
            ProxyRequest::Read { store, path } => match self.transaction.read(store, &path).await {
                Ok(Some(node)) => ProxyReply::Data(node),
                Ok(None) => ProxyReply::EmptyRead,
                Err(cause) => ProxyReply::Failure(cause),
            },
            ProxyRequest::Exists { store, path } => {
                match self.transaction.exists(store, &path).await {
                    Ok(exists) => ProxyReply::Exists(exists),
                    Err(cause) => ProxyReply::Failure(cause),
                }
            }
            ProxyRequest::Commit => {
                self.closed = true;
                match self.write_failure.take() {
                    Some(cause) => {
                        warn!(
                            "{}: Not committing, an earlier write failed: {}",
                            self.device, cause
                        );
                        self.transaction.cancel().await;
                        ProxyReply::Failure(cause)
                    }
                    None => match self.transaction.commit().await {
                        Ok(()) => ProxyReply::Committed,
                        Err(cause) => ProxyReply::Failure(cause),
                    },
                }
            }
            ProxyRequest::Cancel => {
                self.closed = true;
                if !self.transaction.cancel().await {
                    warn!("{}: Cancel did not clean up", self.device);
                }
                ProxyReply::Cancelled
            }
            ProxyRequest::Put { .. } | ProxyRequest::Merge { .. } | ProxyRequest::Delete { .. } => {
                return self.write(request).await;
            }
        };
        Some(reply)
    }

    /// Apply a write. Only the first failure is kept; later writes are skipped.
    async fn write(&mut self, request: ProxyRequest) -> Option<ProxyReply> {
        if let Some(cause) = &self.write_failure {
            debug!(
                "{}: Skipping {} after failed write",
                self.device,
                request.name()
            );
            return Some(ProxyReply::Failure(cause.clone()));
        }
        let result = match request {
            ProxyRequest::Put { store, path, data } => {
                self.transaction.put(store, &path, data).await
            }
            ProxyRequest::Merge { store, path, data } => {
                self.transaction.merge(store, &path, data).await
            }
            ProxyRequest::Delete { store, path } => self.transaction.delete(store, &path).await,
            _ => return None,
        };
        match result {
            Ok(()) => None,
            Err(cause) => {
                warn!("{}: Write failed: {}", self.device, cause);
                self.write_failure = Some(cause.clone());
                Some(ProxyReply::Failure(cause))
            }
        }
    }
}

/// The owning node's dispatcher for new transactions.
pub struct DeviceMaster;

impl DeviceMaster {
    /// Spawn the dispatcher. Each transaction gets its own endpoint task.
    pub fn spawn(device: impl Into<String>, factory: TransactionFactory) -> MasterRef {
        let device = device.into();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let name = device.clone();
        tokio::spawn(async move {
            while let Some(MasterRequest::NewTransaction(reply)) = rx.recv().await {
                debug!("{}: Opening proxied transaction", name);
                let owner = TransactionEndpoint::spawn(name.clone(), factory());
                let _ = reply.send(owner);
            }
            debug!("{}: Master stopped", name);
        });
        MasterRef::new(device, tx)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use super::*;
    use crate::data::PathSegment;

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        Read,
        Put,
        Merge,
        Delete,
        Commit,
        Cancel,
    }

    #[derive(Clone, Default)]
    struct Recorder {
        calls: Arc<Mutex<Vec<Call>>>,
        fail_merge: bool,
        node: Option<DataNode>,
    }

    impl Recorder {
        fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }

        fn record(&self, call: Call) {
            self.calls.lock().unwrap().push(call);
        }
    }

    #[async_trait]
    impl DataTransaction for Recorder {
        async fn read(
            &mut self,
            _store: Datastore,
            _path: &DataPath,
        ) -> Result<Option<DataNode>, DocumentedError> {
            self.record(Call::Read);
            Ok(self.node.clone())
        }

        async fn put(
            &mut self,
            _store: Datastore,
            _path: &DataPath,
            _data: DataNode,
        ) -> Result<(), DocumentedError> {
            self.record(Call::Put);
            Ok(())
        }

        async fn merge(
            &mut self,
            _store: Datastore,
            _path: &DataPath,
            _data: DataNode,
        ) -> Result<(), DocumentedError> {
            self.record(Call::Merge);
            if self.fail_merge {
                return Err(DocumentedError::operation_failed("merge rejected"));
            }
            Ok(())
        }

        async fn delete(
            &mut self,
            _store: Datastore,
            _path: &DataPath,
        ) -> Result<(), DocumentedError> {
            self.record(Call::Delete);
            Ok(())
        }

        async fn commit(&mut self) -> Result<(), DocumentedError> {
            self.record(Call::Commit);
            Ok(())
        }

        async fn cancel(&mut self) -> bool {
            self.record(Call::Cancel);
            true
        }
    }

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn path() -> DataPath {
        DataPath::root().child(PathSegment::new("system"))
    }

    fn node() -> DataNode {
        DataNode::new("system", None, "<hostname>r1</hostname>")
    }

    #[tokio::test]
    async fn test_serves_reads_and_commit_in_order() {
        let recorder = Recorder {
            node: Some(node()),
            ..Default::default()
        };
        let owner = TransactionEndpoint::spawn("dev1", Box::new(recorder.clone()));

        let store = Datastore::Configuration;
        let reply = owner
            .ask(ProxyRequest::Read { store, path: path() }, TIMEOUT)
            .await;
        assert_eq!(reply, ProxyReply::Data(node()));

        let reply = owner
            .ask(ProxyRequest::Exists { store, path: path() }, TIMEOUT)
            .await;
        assert_eq!(reply, ProxyReply::Exists(true));

        owner.tell(ProxyRequest::Put {
            store,
            path: path(),
            data: node(),
        });
        owner.tell(ProxyRequest::Delete { store, path: path() });
        assert_eq!(
            owner.ask(ProxyRequest::Commit, TIMEOUT).await,
            ProxyReply::Committed
        );

        assert_eq!(
            recorder.calls(),
            vec![Call::Read, Call::Read, Call::Put, Call::Delete, Call::Commit]
        );
    }

    #[tokio::test]
    async fn test_empty_read() {
        let owner = TransactionEndpoint::spawn("dev1", Box::new(Recorder::default()));
        let reply = owner
            .ask(
                ProxyRequest::Read {
                    store: Datastore::Operational,
                    path: path(),
                },
                TIMEOUT,
            )
            .await;
        assert_eq!(reply, ProxyReply::EmptyRead);
    }

    #[tokio::test]
    async fn test_failed_write_surfaces_at_commit() {
        let recorder = Recorder {
            fail_merge: true,
            ..Default::default()
        };
        let owner = TransactionEndpoint::spawn("dev1", Box::new(recorder.clone()));
        let store = Datastore::Configuration;

        owner.tell(ProxyRequest::Merge {
            store,
            path: path(),
            data: node(),
        });
        owner.tell(ProxyRequest::Put {
            store,
            path: path(),
            data: node(),
        });

        match owner.ask(ProxyRequest::Commit, TIMEOUT).await {
            ProxyReply::Failure(cause) => assert_eq!(cause.message, "merge rejected"),
            other => panic!("unexpected reply: {other:?}"),
        }
        // The put after the failed merge is skipped and nothing is committed.
        assert_eq!(recorder.calls(), vec![Call::Merge, Call::Cancel]);
    }

    #[tokio::test]
    async fn test_requests_after_close_fail() {
        let recorder = Recorder::default();
        let owner = TransactionEndpoint::spawn("dev1", Box::new(recorder.clone()));

        assert_eq!(
            owner.ask(ProxyRequest::Cancel, TIMEOUT).await,
            ProxyReply::Cancelled
        );
        let reply = owner.ask(ProxyRequest::Commit, TIMEOUT).await;
        assert!(matches!(reply, ProxyReply::Failure(_)));
        assert_eq!(recorder.calls(), vec![Call::Cancel]);
    }

    #[tokio::test]
    async fn test_dropped_proxy_cancels() {
        let recorder = Recorder::default();
        let owner = TransactionEndpoint::spawn("dev1", Box::new(recorder.clone()));
        owner.tell(ProxyRequest::Delete {
            store: Datastore::Configuration,
            path: path(),
        });
        drop(owner);

        for _ in 0..100 {
            if recorder.calls().contains(&Call::Cancel) {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(recorder.calls(), vec![Call::Delete, Call::Cancel]);
    }

    #[tokio::test]
    async fn test_master_opens_independent_transactions() {
        let recorder = Recorder::default();
        let factory: TransactionFactory = {
            let recorder = recorder.clone();
            Arc::new(move || Box::new(recorder.clone()) as Box<dyn DataTransaction>)
        };
        let master = DeviceMaster::spawn("dev1", factory);

        let first = master.new_transaction(TIMEOUT).await.unwrap();
        let second = master.new_transaction(TIMEOUT).await.unwrap();

        assert_eq!(
            first.ask(ProxyRequest::Commit, TIMEOUT).await,
            ProxyReply::Committed
        );
        assert_eq!(
            second.ask(ProxyRequest::Cancel, TIMEOUT).await,
            ProxyReply::Cancelled
        );
        assert_eq!(recorder.calls(), vec![Call::Commit, Call::Cancel]);
    }
}
