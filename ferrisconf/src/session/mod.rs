//! Device session lifecycle.
//!
//! A session moves through [`ConnectionState`]s driven by a single actor
//! task. The actor owns the [`SessionMachine`] and executes its actions:
//! opening the transport, negotiating the schema, failing outstanding
//! requests on loss, and scheduling reconnects per the [`ReconnectPolicy`].
//! RPCs bypass the actor and go straight to the [`RequestCorrelator`].

pub(crate) mod actor;
pub mod config;
pub mod correlator;
pub mod preferences;
pub mod reconnect;
pub mod state;

pub use config::SessionConfig;
pub use correlator::RequestCorrelator;
pub use preferences::{
    CapabilityOrigin, CapabilityOverride, CapabilityOverrides, ModuleCapability,
    SessionPreferences,
};
pub use reconnect::ReconnectPolicy;
pub use state::{ConnectionState, SessionMachine};

use std::sync::Arc;

use crate::schema::{ResolvedSchema, SchemaContext};

/// Everything known about a session while it is up.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub preferences: Arc<SessionPreferences>,
    pub schema: ResolvedSchema,
    pub session_id: Option<u64>,
}

impl SessionSnapshot {
    pub fn context(&self) -> &Arc<SchemaContext> {
        &self.schema.context
    }
}
