//! Client side of a proxied transaction.

use std::sync::Mutex;
use std::time::Duration;

use log::debug;

use super::messages::{ProxyReply, ProxyRequest};
use super::owner::OwnerRef;
use crate::data::{DataNode, DataPath, Datastore};
use crate::error::ProxyError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxState {
    Open,
    Submitted,
    Cancelled,
}

impl TxState {
    fn as_str(&self) -> &'static str {
        match self {
            TxState::Open => "open",
            TxState::Submitted => "submitted",
            TxState::Cancelled => "cancelled",
        }
    }
}

/// A read-write transaction executed by the node that owns the device.
///
/// Reads and commit wait for the owner's reply; writes and cancel do not.
/// Once committed or cancelled every further call fails with
/// [`ProxyError::TransactionClosed`] without sending anything.
#[derive(Debug)]
pub struct ProxyTransaction {
    device: String,
    owner: OwnerRef,
    ask_timeout: Duration,
    state: Mutex<TxState>,
}

impl ProxyTransaction {
    pub fn new(device: impl Into<String>, owner: OwnerRef, ask_timeout: Duration) -> Self {
        Self {
            device: device.into(),
            owner,
            ask_timeout,
            state: Mutex::new(TxState::Open),
        }
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    pub fn is_open(&self) -> bool {
        self.state() == TxState::Open
    }

    /// Read the node at `path`. `Ok(None)` means nothing is there.
    pub async fn read(
        &self,
        store: Datastore,
        path: DataPath,
    ) -> Result<Option<DataNode>, ProxyError> {
        self.ensure_open()?;
        debug!("{}: Proxying read of {} {}", self.device, store, path);
        let request = ProxyRequest::Read {
            store,
            path: path.clone(),
        };
        match self.owner.ask(request, self.ask_timeout).await {
            ProxyReply::Data(node) => Ok(Some(node)),
            ProxyReply::EmptyRead => Ok(None),
            ProxyReply::Failure(cause) => Err(ProxyError::ReadFailed { store, path, cause }),
            _ => Err(self.unexpected("read")),
        }
    }

    pub async fn exists(&self, store: Datastore, path: DataPath) -> Result<bool, ProxyError> {
        self.ensure_open()?;
        debug!("{}: Proxying exists of {} {}", self.device, store, path);
        let request = ProxyRequest::Exists {
            store,
            path: path.clone(),
        };
        match self.owner.ask(request, self.ask_timeout).await {
            ProxyReply::Exists(exists) => Ok(exists),
            ProxyReply::Failure(cause) => Err(ProxyError::ReadFailed { store, path, cause }),
            _ => Err(self.unexpected("exists")),
        }
    }

    /// Replace the node at `path` with `data`.
    pub fn put(&self, store: Datastore, path: DataPath, data: DataNode) -> Result<(), ProxyError> {
        self.write(ProxyRequest::Put { store, path, data })
    }

    pub fn merge(
        &self,
        store: Datastore,
        path: DataPath,
        data: DataNode,
    ) -> Result<(), ProxyError> {
        self.write(ProxyRequest::Merge { store, path, data })
    }

    pub fn delete(&self, store: Datastore, path: DataPath) -> Result<(), ProxyError> {
        self.write(ProxyRequest::Delete { store, path })
    }

    /// Commit and close the transaction.
    ///
    /// A write that failed on the owner surfaces here.
    pub async fn commit(&self) -> Result<(), ProxyError> {
        self.close(TxState::Submitted)?;
        debug!("{}: Proxying commit", self.device);
        match self.owner.ask(ProxyRequest::Commit, self.ask_timeout).await {
            ProxyReply::Committed => Ok(()),
            ProxyReply::Failure(cause) => Err(ProxyError::CommitFailed {
                device: self.device.clone(),
                cause,
            }),
            _ => Err(self.unexpected("commit")),
        }
    }

    /// Cancel the transaction. Returns false if it was already closed.
    pub fn cancel(&self) -> bool {
        if self.close(TxState::Cancelled).is_err() {
            return false;
        }
        debug!("{}: Proxying cancel", self.device);
        self.owner.tell(ProxyRequest::Cancel);
        true
    }

    fn write(&self, request: ProxyRequest) -> Result<(), ProxyError> {
        self.ensure_open()?;
        debug!("{}: Proxying {}", self.device, request.name());
        self.owner.tell(request);
        Ok(())
    }

    fn state(&self) -> TxState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn ensure_open(&self) -> Result<(), ProxyError> {
        match self.state() {
            TxState::Open => Ok(()),
            closed => Err(self.closed(closed)),
        }
    }

    fn close(&self, next: TxState) -> Result<(), ProxyError> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if *state != TxState::Open {
            return Err(self.closed(*state));
        }
        *state = next;
        Ok(())
    }

    fn closed(&self, state: TxState) -> ProxyError {
        ProxyError::TransactionClosed {
            device: self.device.clone(),
            state: state.as_str(),
        }
    }

    fn unexpected(&self, operation: &'static str) -> ProxyError {
        ProxyError::UnexpectedReply {
            device: self.device.clone(),
            operation,
        }
    }
}
