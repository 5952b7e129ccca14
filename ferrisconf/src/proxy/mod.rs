//! Cluster transaction forwarding.
//!
//! Only the node that owns a device holds its session. Other nodes reach it
//! through a [`TransactionProxy`], which turns datastore transaction calls
//! into [`ProxyRequest`] messages for the owner's [`TransactionEndpoint`].
//!
//! ```text
//! ProxyTransaction --ProxyEnvelope--> TransactionEndpoint --> NetconfTransaction
//!        ^                                   |                        |
//!        +------------- ProxyReply ----------+                 DeviceCommunicator
//! ```
//!
//! A missing reply (owner down, overloaded, or gone) is reported as a
//! warning-severity `operation-failed` [`DocumentedError`](crate::error::DocumentedError),
//! the same shape as a real device error.

pub mod endpoint;
pub mod messages;
pub mod netconf;
pub mod owner;
pub mod transaction;

pub use endpoint::{DataTransaction, DeviceMaster, TransactionEndpoint, TransactionFactory};
pub use messages::{MasterRequest, ProxyEnvelope, ProxyReply, ProxyRequest};
pub use netconf::NetconfTransaction;
pub use owner::{MasterRef, OwnerRef};
pub use transaction::ProxyTransaction;

use std::time::Duration;

/// Default time to wait for the owner to answer.
pub const DEFAULT_ASK_TIMEOUT: Duration = Duration::from_secs(10);

/// Opens proxied transactions against a device owned by another node.
#[derive(Debug, Clone)]
pub struct TransactionProxy {
    device: String,
    master: MasterRef,
    ask_timeout: Duration,
}

impl TransactionProxy {
    pub fn new(device: impl Into<String>, master: MasterRef, ask_timeout: Duration) -> Self {
        Self {
            device: device.into(),
            master,
            ask_timeout,
        }
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    /// Open a transaction.
    ///
    /// Returns immediately. Operations issued before the owner has opened
    /// its side are queued and delivered once it has.
    pub fn new_transaction(&self) -> ProxyTransaction {
        let master = self.master.clone();
        let timeout = self.ask_timeout;
        let owner = OwnerRef::deferred(self.device.clone(), async move {
            master.new_transaction(timeout).await
        });
        ProxyTransaction::new(self.device.clone(), owner, self.ask_timeout)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::sync::mpsc;

    use super::*;
    use crate::data::{DataPath, Datastore};
    use crate::error::{DocumentedError, ProxyError};

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_master_fails_operations() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let proxy = TransactionProxy::new("dev1", MasterRef::new("dev1", tx), DEFAULT_ASK_TIMEOUT);

        let transaction = proxy.new_transaction();
        let err = transaction
            .read(Datastore::Configuration, DataPath::root())
            .await
            .unwrap_err();

        assert!(matches!(err, ProxyError::ReadFailed { .. }));
        assert_eq!(err.cause(), Some(&DocumentedError::master_is_down("dev1")));
    }

    #[tokio::test]
    async fn test_dropped_master_fails_fast() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let proxy = TransactionProxy::new("dev1", MasterRef::new("dev1", tx), DEFAULT_ASK_TIMEOUT);

        let transaction = proxy.new_transaction();
        let err = transaction.commit().await.unwrap_err();
        assert_eq!(err.cause(), Some(&DocumentedError::master_is_down("dev1")));
    }

    #[tokio::test]
    async fn test_transactions_get_separate_endpoints() {
        struct Empty;

        #[async_trait::async_trait]
        impl DataTransaction for Empty {
            async fn read(
                &mut self,
                _: Datastore,
                _: &DataPath,
            ) -> Result<Option<crate::data::DataNode>, DocumentedError> {
                Ok(None)
            }
            async fn put(
                &mut self,
                _: Datastore,
                _: &DataPath,
                _: crate::data::DataNode,
            ) -> Result<(), DocumentedError> {
                Ok(())
            }
            async fn merge(
                &mut self,
                _: Datastore,
                _: &DataPath,
                _: crate::data::DataNode,
            ) -> Result<(), DocumentedError> {
                Ok(())
            }
            async fn delete(&mut self, _: Datastore, _: &DataPath) -> Result<(), DocumentedError> {
                Ok(())
            }
            async fn commit(&mut self) -> Result<(), DocumentedError> {
                Ok(())
            }
            async fn cancel(&mut self) -> bool {
                true
            }
        }

        let master = DeviceMaster::spawn(
            "dev1",
            Arc::new(|| Box::new(Empty) as Box<dyn DataTransaction>),
        );
        let proxy = TransactionProxy::new("dev1", master, DEFAULT_ASK_TIMEOUT);

        let first = proxy.new_transaction();
        let second = proxy.new_transaction();
        first.commit().await.unwrap();

        // The second transaction is unaffected by the first one closing.
        assert!(second.is_open());
        assert!(
            !second
                .exists(Datastore::Operational, DataPath::root())
                .await
                .unwrap()
        );
        assert!(second.cancel());
    }
}
