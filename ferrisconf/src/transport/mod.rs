//! Transport layer: the raw NETCONF message stream to a device.
//!
//! A [`Transport`] opens sessions; a [`TransportSession`] sends framed
//! messages and reports inbound messages and loss of the session through the
//! event channel handed to [`Transport::connect`]. [`SshTransport`] is the
//! NETCONF-over-SSH implementation on russh.

pub mod config;
pub mod framing;
mod ssh;

pub use config::{AuthMethod, HostKeyVerification, SshConfig};
pub use ssh::SshTransport;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::device::DeviceId;
use crate::error::TransportError;

/// Something that happened on an open session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// One complete inbound message (reply or notification).
    Message(String),
    /// The session is gone. Sent at most once, and nothing follows it.
    Down { reason: String },
}

/// Opens transport sessions to devices.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Connect, authenticate and exchange hellos.
    ///
    /// Inbound messages after the hello are delivered on `events`.
    async fn connect(
        &self,
        device: &DeviceId,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Arc<dyn TransportSession>, TransportError>;
}

/// An established session after the hello exchange.
pub trait TransportSession: Send + Sync {
    /// Capabilities the device advertised in its hello.
    fn capabilities(&self) -> &[String];

    /// Session id from the device hello.
    fn session_id(&self) -> Option<u64>;

    /// Queue one message for sending. Framing is applied by the session.
    fn send(&self, message: String) -> Result<(), TransportError>;

    /// Close the session. Idempotent.
    fn close(&self);
}
