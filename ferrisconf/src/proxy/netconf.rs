//! [`DataTransaction`] over a local NETCONF session.
//!
//! Writes go to the candidate datastore when the device has one, otherwise
//! straight to running when it is writable. The target is locked on the
//! first write and unlocked when the transaction ends:
//!
//! - `commit` sends `<commit/>` (candidate only), then `<unlock>`
//! - `cancel` sends `<discard-changes/>` (candidate only), then `<unlock>`

use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, warn};

use super::endpoint::{DataTransaction, DeviceMaster};
use super::owner::MasterRef;
use crate::communicator::DeviceCommunicator;
use crate::data::{DataNode, DataPath, Datastore, EditOperation, NETCONF_BASE_NS};
use crate::error::{DocumentedError, Error, ErrorSeverity, ErrorTag, ErrorType, RpcError};
use crate::rpc::{Rpc, RpcReply, Target};

/// One transaction against a device this node owns.
pub struct NetconfTransaction {
    device: DeviceCommunicator,
    target: Option<Target>,
    locked: bool,
}

impl NetconfTransaction {
    pub fn new(device: DeviceCommunicator) -> Self {
        Self {
            device,
            target: None,
            locked: false,
        }
    }

    /// Serve proxied transactions for `device` from this node.
    pub fn master(device: DeviceCommunicator) -> MasterRef {
        let name = device.id().to_string();
        DeviceMaster::spawn(
            name,
            Arc::new(move || {
                Box::new(NetconfTransaction::new(device.clone())) as Box<dyn DataTransaction>
            }),
        )
    }

    /// The datastore writes go to, once the first write has happened.
    pub fn target(&self) -> Option<Target> {
        self.target
    }

    async fn invoke(&self, rpc: Rpc) -> Result<RpcReply, DocumentedError> {
        self.device
            .invoke(rpc)
            .await
            .map_err(|e| DocumentedError::from(&e))
    }

    /// Pick and lock the write target on first use.
    async fn prepare_write(&mut self, store: Datastore) -> Result<Target, DocumentedError> {
        if store == Datastore::Operational {
            return Err(DocumentedError::new(
                ErrorType::Application,
                ErrorTag::InvalidValue,
                ErrorSeverity::Error,
                format!("{}: operational data is read-only", self.device.id()),
            ));
        }
        if let Some(target) = self.target {
            return Ok(target);
        }

        let preferences = self.device.preferences().ok_or_else(|| {
            DocumentedError::from(&Error::Rpc(RpcError::NotConnected {
                device: self.device.id().to_string(),
            }))
        })?;
        let target = if preferences.is_candidate_supported() {
            Target::Candidate
        } else if preferences.is_running_writable() {
            Target::Running
        } else {
            return Err(DocumentedError::new(
                ErrorType::Protocol,
                ErrorTag::OperationNotSupported,
                ErrorSeverity::Error,
                format!(
                    "{}: device supports neither candidate nor writable-running",
                    self.device.id()
                ),
            ));
        };

        debug!("{}: Locking {} for transaction", self.device.id(), target);
        self.invoke(Rpc::Lock { target }).await?;
        self.locked = true;
        self.target = Some(target);
        Ok(target)
    }

    async fn edit(
        &mut self,
        store: Datastore,
        path: &DataPath,
        operation: EditOperation,
        data: Option<DataNode>,
    ) -> Result<(), DocumentedError> {
        let target = self.prepare_write(store).await?;
        let config = path.to_edit_content(operation, data.as_ref());
        self.invoke(Rpc::EditConfig {
            target,
            default_operation: None,
            config,
        })
        .await?;
        Ok(())
    }

    async fn unlock(&mut self) -> Result<(), DocumentedError> {
        let Some(target) = self.target else {
            return Ok(());
        };
        if !self.locked {
            return Ok(());
        }
        self.locked = false;
        self.invoke(Rpc::Unlock { target }).await?;
        Ok(())
    }
}

#[async_trait]
impl DataTransaction for NetconfTransaction {
    async fn read(
        &mut self,
        store: Datastore,
        path: &DataPath,
    ) -> Result<Option<DataNode>, DocumentedError> {
        let filter = path.to_subtree_filter();
        let reply = match store {
            Datastore::Operational => self.invoke(Rpc::Get { filter }).await?,
            Datastore::Configuration => {
                self.invoke(Rpc::GetConfig {
                    source: Target::Running,
                    filter,
                })
                .await?
            }
        };
        // No match is an empty result, not an error.
        Ok(reply
            .data()
            .filter(|data| !data.trim().is_empty())
            .map(|data| DataNode::new("data", Some(NETCONF_BASE_NS.to_string()), data)))
    }

    async fn put(
        &mut self,
        store: Datastore,
        path: &DataPath,
        data: DataNode,
    ) -> Result<(), DocumentedError> {
        self.edit(store, path, EditOperation::Replace, Some(data)).await
    }

    async fn merge(
        &mut self,
        store: Datastore,
        path: &DataPath,
        data: DataNode,
    ) -> Result<(), DocumentedError> {
        self.edit(store, path, EditOperation::Merge, Some(data)).await
    }

    async fn delete(&mut self, store: Datastore, path: &DataPath) -> Result<(), DocumentedError> {
        self.edit(store, path, EditOperation::Delete, None).await
    }

    async fn commit(&mut self) -> Result<(), DocumentedError> {
        if self.target == Some(Target::Candidate) {
            if let Err(err) = self.invoke(Rpc::Commit).await {
                warn!("{}: Commit failed, discarding: {}", self.device.id(), err);
                self.cancel().await;
                return Err(err);
            }
        }
        self.unlock().await
    }

    async fn cancel(&mut self) -> bool {
        let mut clean = true;
        if self.target == Some(Target::Candidate) {
            if let Err(err) = self.invoke(Rpc::DiscardChanges).await {
                warn!("{}: Discard failed: {}", self.device.id(), err);
                clean = false;
            }
        }
        if let Err(err) = self.unlock().await {
            warn!("{}: Unlock failed: {}", self.device.id(), err);
            clean = false;
        }
        clean
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::communicator::DeviceBuilder;
    use crate::data::PathSegment;
    use crate::proxy::TransactionProxy;
    use crate::session::ReconnectPolicy;
    use crate::testing::{
        FakeRepository, MockTransport, Responder, capabilities, data_reply, error_reply,
        init_logging, message_id_of, ok_reply,
    };

    fn device_responder(data: &'static str, fail_commit: bool) -> Responder {
        Arc::new(move |rpc: &str| {
            let id = message_id_of(rpc);
            if rpc.contains("<get>") || rpc.contains("<get/>") || rpc.contains("<get-config>") {
                Some(data_reply(&id, data))
            } else if fail_commit && rpc.contains("<commit/>") {
                Some(error_reply(&id, "operation-failed", "commit check failed"))
            } else {
                Some(ok_reply(&id))
            }
        })
    }

    async fn connected(
        caps: Vec<String>,
        responder: Responder,
    ) -> (DeviceCommunicator, Arc<MockTransport>) {
        init_logging();
        let transport = Arc::new(MockTransport::new(caps).with_responder(Some(responder)));
        let device = DeviceBuilder::new("10.0.0.1")
            .name("dev1")
            .transport(transport.clone())
            .source_repository(Arc::new(FakeRepository::new()))
            .reconnect_policy(ReconnectPolicy::never())
            .build()
            .unwrap();
        device.connect().await.unwrap();
        (device, transport)
    }

    fn path() -> DataPath {
        DataPath::root().child(PathSegment::with_namespace("system", "urn:test:system"))
    }

    fn node() -> DataNode {
        DataNode::new("system", Some("urn:test:system".into()), "<hostname>r1</hostname>")
    }

    fn operations(transport: &MockTransport) -> Vec<String> {
        transport
            .latest_session()
            .sent()
            .iter()
            .map(|rpc| {
                let start = rpc.find("\"><").map(|i| i + 3).unwrap_or(0);
                let end = rpc[start..]
                    .find(|c: char| c == '>' || c == '/' || c == ' ')
                    .map(|i| start + i)
                    .unwrap_or(rpc.len());
                rpc[start..end].to_string()
            })
            .collect()
    }

    #[tokio::test]
    async fn test_read_passes_filter_through() {
        let (device, transport) = connected(
            capabilities(&["system"]),
            device_responder("<system xmlns=\"urn:test:system\"/>", false),
        )
        .await;
        let mut tx = NetconfTransaction::new(device);

        let node = tx.read(Datastore::Configuration, &path()).await.unwrap().unwrap();
        assert_eq!(node.name, "data");
        assert!(node.body.contains("<system"));

        let sent = transport.latest_session().sent();
        assert!(sent[0].contains("<get-config><source><running/></source>"));
        assert!(sent[0].contains(
            "<filter type=\"subtree\"><system xmlns=\"urn:test:system\"/></filter>"
        ));

        tx.read(Datastore::Operational, &path()).await.unwrap();
        assert!(transport.latest_session().sent()[1].contains("<get>"));
    }

    #[tokio::test]
    async fn test_empty_data_is_empty_read() {
        let (device, _) = connected(capabilities(&["system"]), device_responder("", false)).await;
        let mut tx = NetconfTransaction::new(device);

        assert_eq!(tx.read(Datastore::Operational, &path()).await.unwrap(), None);
        assert!(!tx.exists(Datastore::Operational, &path()).await.unwrap());
    }

    #[tokio::test]
    async fn test_candidate_write_and_commit() {
        let (device, transport) =
            connected(capabilities(&["system"]), device_responder("", false)).await;
        let mut tx = NetconfTransaction::new(device);

        tx.put(Datastore::Configuration, &path(), node()).await.unwrap();
        tx.delete(Datastore::Configuration, &path()).await.unwrap();
        assert_eq!(tx.target(), Some(Target::Candidate));
        tx.commit().await.unwrap();

        assert_eq!(
            operations(&transport),
            vec!["lock", "edit-config", "edit-config", "commit", "unlock"]
        );
        let sent = transport.latest_session().sent();
        assert!(sent[0].contains("<candidate/>"));
        assert!(sent[1].contains("nc:operation=\"replace\""));
        assert!(sent[2].contains("nc:operation=\"delete\""));
    }

    #[tokio::test]
    async fn test_running_target_without_candidate() {
        let caps = vec![
            "urn:ietf:params:netconf:base:1.0".to_string(),
            "urn:ietf:params:netconf:capability:writable-running:1.0".to_string(),
            "urn:test:system?module=system&revision=2024-01-01".to_string(),
        ];
        let (device, transport) = connected(caps, device_responder("", false)).await;
        let mut tx = NetconfTransaction::new(device);

        tx.merge(Datastore::Configuration, &path(), node()).await.unwrap();
        assert_eq!(tx.target(), Some(Target::Running));
        assert!(tx.cancel().await);

        assert_eq!(operations(&transport), vec!["lock", "edit-config", "unlock"]);
        assert!(transport.latest_session().sent()[1].contains("nc:operation=\"merge\""));
    }

    #[tokio::test]
    async fn test_no_writable_datastore() {
        let caps = vec![
            "urn:ietf:params:netconf:base:1.0".to_string(),
            "urn:test:system?module=system&revision=2024-01-01".to_string(),
        ];
        let (device, transport) = connected(caps, device_responder("", false)).await;
        let mut tx = NetconfTransaction::new(device);

        let err = tx.put(Datastore::Configuration, &path(), node()).await.unwrap_err();
        assert_eq!(err.tag, ErrorTag::OperationNotSupported);
        assert!(transport.latest_session().sent().is_empty());
    }

    #[tokio::test]
    async fn test_operational_writes_rejected() {
        let (device, _) = connected(capabilities(&["system"]), device_responder("", false)).await;
        let mut tx = NetconfTransaction::new(device);

        let err = tx.delete(Datastore::Operational, &path()).await.unwrap_err();
        assert_eq!(err.tag, ErrorTag::InvalidValue);
    }

    #[tokio::test]
    async fn test_commit_failure_discards_and_unlocks() {
        let (device, transport) =
            connected(capabilities(&["system"]), device_responder("", true)).await;
        let mut tx = NetconfTransaction::new(device);

        tx.put(Datastore::Configuration, &path(), node()).await.unwrap();
        let err = tx.commit().await.unwrap_err();

        assert_eq!(err.message, "commit check failed");
        assert_eq!(
            operations(&transport),
            vec!["lock", "edit-config", "commit", "discard-changes", "unlock"]
        );
    }

    #[tokio::test]
    async fn test_proxied_transaction_end_to_end() {
        let (device, transport) = connected(
            capabilities(&["system"]),
            device_responder("<system xmlns=\"urn:test:system\"/>", false),
        )
        .await;
        let proxy = TransactionProxy::new(
            "dev1",
            NetconfTransaction::master(device),
            Duration::from_secs(5),
        );

        let tx = proxy.new_transaction();
        assert!(tx.exists(Datastore::Configuration, path()).await.unwrap());
        tx.merge(Datastore::Configuration, path(), node()).unwrap();
        tx.commit().await.unwrap();

        assert_eq!(
            operations(&transport),
            vec!["get-config", "lock", "edit-config", "commit", "unlock"]
        );
    }

    #[tokio::test]
    async fn test_proxied_commit_reports_device_error() {
        let (device, _) = connected(capabilities(&["system"]), device_responder("", true)).await;
        let proxy = TransactionProxy::new(
            "dev1",
            NetconfTransaction::master(device),
            Duration::from_secs(5),
        );

        let tx = proxy.new_transaction();
        tx.put(Datastore::Configuration, path(), node()).unwrap();
        let err = tx.commit().await.unwrap_err();

        let cause = err.cause().unwrap();
        assert_eq!(cause.tag, ErrorTag::OperationFailed);
        assert_eq!(cause.error_type, ErrorType::Application);
        assert_eq!(cause.message, "commit check failed");
    }
}
