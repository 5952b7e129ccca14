//! # Ferrisconf
//!
//! Async NETCONF device session manager.
//!
//! Ferrisconf keeps one long-lived NETCONF session per managed device:
//! it connects over SSH, negotiates capabilities, builds a schema context
//! from the advertised modules, correlates RPC replies, and reconnects with
//! backoff when the session drops. In a cluster, nodes that do not own a
//! device reach it through transaction proxies.
//!
//! ## Features
//!
//! - Async SSH transport via russh with base:1.0 and base:1.1 framing
//! - Connection lifecycle driven by a single task per device
//! - Concurrent RPCs matched by `message-id`, with timeouts and backpressure
//! - Schema resolution that degrades past missing or broken models
//! - Configurable reconnect policy with exponential backoff
//! - Cluster transaction forwarding with uniform failure reporting
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use ferrisconf::{DeviceBuilder, Rpc};
//! use ferrisconf::schema::SourceRepository;
//!
//! # async fn example(models: Arc<dyn SourceRepository>) -> Result<(), ferrisconf::Error> {
//! let device = DeviceBuilder::new("192.168.1.1")
//!     .username("admin")
//!     .password("secret")
//!     .source_repository(models)
//!     .build()?;
//!
//! let snapshot = device.connect().await?;
//! println!("{}", snapshot.preferences);
//!
//! let reply = device.invoke(Rpc::Get { filter: None }).await?;
//! println!("{}", reply.data().unwrap_or_default());
//!
//! device.disconnect().await?;
//! # Ok(())
//! # }
//! ```

pub mod communicator;
pub mod data;
pub mod device;
pub mod error;
pub mod proxy;
pub mod rpc;
pub mod schema;
pub mod session;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

// Re-export main types for convenience
pub use communicator::{DeviceBuilder, DeviceCommunicator, DeviceHandler};
pub use data::{DataNode, DataPath, Datastore, PathSegment};
pub use device::DeviceId;
pub use error::{DocumentedError, Error, Result};
pub use proxy::{ProxyTransaction, TransactionProxy};
pub use rpc::{Rpc, RpcReply, Target};
pub use schema::{SchemaCache, SchemaContext, SourceIdentifier};
pub use session::{
    ConnectionState, ReconnectPolicy, SessionConfig, SessionPreferences, SessionSnapshot,
};
pub use transport::{AuthMethod, HostKeyVerification, SshConfig};
