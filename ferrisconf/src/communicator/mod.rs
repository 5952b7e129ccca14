//! Public per-device facade.
//!
//! A [`DeviceCommunicator`] is a cheap, cloneable handle to one device
//! session. Lifecycle calls go through the session task; RPCs go straight to
//! the request correlator, so concurrent invocations never queue behind a
//! state transition.

mod builder;

pub use builder::DeviceBuilder;

use std::sync::Arc;

use log::debug;
use tokio::sync::{mpsc, oneshot, watch};

use crate::data::EditOperation;
use crate::device::DeviceId;
use crate::error::{Error, Result, RpcError, SessionError};
use crate::rpc::{Rpc, RpcReply, Target};
use crate::schema::SchemaContext;
use crate::session::actor::{SessionCommand, Shared};
use crate::session::{ConnectionState, SessionPreferences, SessionSnapshot};

/// Receives lifecycle callbacks and notifications for one device.
///
/// Callbacks run on the session task and must not block.
pub trait DeviceHandler: Send + Sync {
    /// The session is up and its schema context is ready.
    fn on_device_connected(&self, device: &DeviceId, snapshot: &Arc<SessionSnapshot>);

    /// An up session was lost or stopped.
    fn on_device_disconnected(&self, device: &DeviceId);

    /// Reconnect attempts are exhausted. Called once per give-up.
    fn on_device_failed(&self, device: &DeviceId, error: &SessionError);

    /// A `<notification>` arrived.
    fn on_notification(&self, device: &DeviceId, notification: &str) {
        let _ = (device, notification);
    }
}

struct Inner {
    shared: Arc<Shared>,
    mailbox: mpsc::UnboundedSender<SessionCommand>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        debug!("{}: Last communicator handle dropped", self.shared.device);
        let _ = self.mailbox.send(SessionCommand::Shutdown);
    }
}

/// Handle to one device session.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use ferrisconf::{DeviceBuilder, Rpc};
/// # use ferrisconf::schema::SourceRepository;
///
/// # async fn example(models: Arc<dyn SourceRepository>) -> Result<(), ferrisconf::Error> {
/// let device = DeviceBuilder::new("192.168.1.1")
///     .name("edge-1")
///     .username("admin")
///     .password("secret")
///     .source_repository(models)
///     .build()?;
///
/// device.connect().await?;
/// let reply = device.invoke(Rpc::Get { filter: None }).await?;
/// println!("{}", reply.data().unwrap_or_default());
/// device.disconnect().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct DeviceCommunicator {
    inner: Arc<Inner>,
}

impl DeviceCommunicator {
    pub(crate) fn new(shared: Arc<Shared>, mailbox: mpsc::UnboundedSender<SessionCommand>) -> Self {
        Self {
            inner: Arc::new(Inner { shared, mailbox }),
        }
    }

    pub fn id(&self) -> &DeviceId {
        &self.inner.shared.device
    }

    /// Bring the session up.
    ///
    /// Joins an attempt already in progress and returns the current snapshot
    /// when already up. Fails when retries are exhausted or `disconnect` is
    /// called first.
    pub async fn connect(&self) -> Result<Arc<SessionSnapshot>> {
        let (tx, rx) = oneshot::channel();
        self.command(SessionCommand::Connect(tx))?;
        rx.await
            .map_err(|_| self.terminated())?
            .map_err(Error::Session)
    }

    /// Tear the session down. Always ends in `Disconnected`.
    pub async fn disconnect(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.command(SessionCommand::Disconnect(tx))?;
        rx.await.map_err(|_| self.terminated())?;
        Ok(())
    }

    /// Send an RPC on the current session.
    pub async fn invoke(&self, rpc: Rpc) -> Result<RpcReply> {
        if self.state() != ConnectionState::Up {
            return Err(RpcError::NotConnected {
                device: self.id().to_string(),
            }
            .into());
        }
        Ok(self.inner.shared.correlator.send(&rpc).await?)
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.shared.state.borrow()
    }

    /// Watch state transitions.
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.inner.shared.state.subscribe()
    }

    /// The session snapshot, while up.
    pub fn snapshot(&self) -> Option<Arc<SessionSnapshot>> {
        self.inner.shared.snapshot()
    }

    pub fn preferences(&self) -> Option<Arc<SessionPreferences>> {
        self.snapshot().map(|s| s.preferences.clone())
    }

    pub fn schema(&self) -> Option<Arc<SchemaContext>> {
        self.snapshot().map(|s| s.schema.context.clone())
    }

    /// `<get>` with an optional subtree filter.
    pub async fn get(&self, filter: Option<String>) -> Result<RpcReply> {
        self.invoke(Rpc::Get { filter }).await
    }

    /// `<get-config>` with an optional subtree filter.
    pub async fn get_config(&self, source: Target, filter: Option<String>) -> Result<RpcReply> {
        self.invoke(Rpc::GetConfig { source, filter }).await
    }

    /// `<edit-config>` with a complete `<config>` element.
    pub async fn edit_config(
        &self,
        target: Target,
        default_operation: Option<EditOperation>,
        config: impl Into<String>,
    ) -> Result<RpcReply> {
        self.invoke(Rpc::EditConfig {
            target,
            default_operation,
            config: config.into(),
        })
        .await
    }

    fn command(&self, command: SessionCommand) -> Result<()> {
        self.inner
            .mailbox
            .send(command)
            .map_err(|_| self.terminated())
    }

    fn terminated(&self) -> Error {
        Error::Session(SessionError::Terminated {
            device: self.id().to_string(),
        })
    }
}

impl std::fmt::Debug for DeviceCommunicator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceCommunicator")
            .field("device", self.id())
            .field("state", &self.state())
            .finish()
    }
}
