//! Messages exchanged between a transaction proxy and the device owner.

use tokio::sync::oneshot;

use super::owner::OwnerRef;
use crate::data::{DataNode, DataPath, Datastore};
use crate::error::DocumentedError;

/// One operation on a proxied transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyRequest {
    Read {
        store: Datastore,
        path: DataPath,
    },
    Exists {
        store: Datastore,
        path: DataPath,
    },
    Put {
        store: Datastore,
        path: DataPath,
        data: DataNode,
    },
    Merge {
        store: Datastore,
        path: DataPath,
        data: DataNode,
    },
    Delete {
        store: Datastore,
        path: DataPath,
    },
    Commit,
    Cancel,
}

impl ProxyRequest {
    pub fn name(&self) -> &'static str {
        match self {
            ProxyRequest::Read { .. } => "read",
            ProxyRequest::Exists { .. } => "exists",
            ProxyRequest::Put { .. } => "put",
            ProxyRequest::Merge { .. } => "merge",
            ProxyRequest::Delete { .. } => "delete",
            ProxyRequest::Commit => "commit",
            ProxyRequest::Cancel => "cancel",
        }
    }
}

/// The owner's answer to a [`ProxyRequest`].
///
/// `Failure` may answer any request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyReply {
    Data(DataNode),
    EmptyRead,
    Exists(bool),
    Committed,
    Cancelled,
    Failure(DocumentedError),
}

/// A request plus, for asks, where to send the reply.
#[derive(Debug)]
pub struct ProxyEnvelope {
    pub request: ProxyRequest,
    pub reply: Option<oneshot::Sender<ProxyReply>>,
}

impl ProxyEnvelope {
    pub fn ask(request: ProxyRequest) -> (Self, oneshot::Receiver<ProxyReply>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                request,
                reply: Some(tx),
            },
            rx,
        )
    }

    pub fn tell(request: ProxyRequest) -> Self {
        Self {
            request,
            reply: None,
        }
    }

    /// Answer an ask with `cause`. Tells are dropped.
    pub fn fail(self, cause: DocumentedError) {
        if let Some(reply) = self.reply {
            let _ = reply.send(ProxyReply::Failure(cause));
        }
    }
}

/// Requests served by a device's owning node.
#[derive(Debug)]
pub enum MasterRequest {
    /// Open a transaction; replies with the endpoint serving it.
    NewTransaction(oneshot::Sender<OwnerRef>),
}
