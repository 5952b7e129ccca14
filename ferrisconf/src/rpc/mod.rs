//! NETCONF RPCs and replies.
//!
//! [`Rpc`] renders the base operations a session needs (plus an escape hatch
//! for arbitrary operations). [`RpcReply`] is what a completed request
//! resolves to.

pub mod message;

use std::fmt;
use std::time::Duration;

use crate::data::EditOperation;
use crate::error::{DocumentedError, ErrorSeverity};

const MONITORING_NS: &str = "urn:ietf:params:xml:ns:yang:ietf-netconf-monitoring";

/// A configuration datastore name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Target {
    Running,
    Candidate,
    Startup,
}

impl Target {
    pub fn as_str(&self) -> &'static str {
        match self {
            Target::Running => "running",
            Target::Candidate => "candidate",
            Target::Startup => "startup",
        }
    }

    fn element(&self) -> String {
        format!("<{}/>", self.as_str())
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An operation to send to the device.
///
/// Filters and configuration bodies are passed through verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rpc {
    /// `<get>` with an optional subtree filter.
    Get { filter: Option<String> },

    /// `<get-config>` from `source` with an optional subtree filter.
    GetConfig {
        source: Target,
        filter: Option<String>,
    },

    /// `<edit-config>` on `target`. `config` is a complete `<config>` element.
    EditConfig {
        target: Target,
        default_operation: Option<EditOperation>,
        config: String,
    },

    Lock { target: Target },

    Unlock { target: Target },

    Commit,

    DiscardChanges,

    /// `<get-schema>` for the YANG text of one module.
    GetSchema {
        identifier: String,
        version: Option<String>,
    },

    /// Any other operation; `body` is the content of the `<rpc>` element.
    Raw { body: String },
}

impl Rpc {
    /// The operation name, for logging.
    pub fn name(&self) -> &str {
        match self {
            Rpc::Get { .. } => "get",
            Rpc::GetConfig { .. } => "get-config",
            Rpc::EditConfig { .. } => "edit-config",
            Rpc::Lock { .. } => "lock",
            Rpc::Unlock { .. } => "unlock",
            Rpc::Commit => "commit",
            Rpc::DiscardChanges => "discard-changes",
            Rpc::GetSchema { .. } => "get-schema",
            Rpc::Raw { .. } => "rpc",
        }
    }

    /// Render the content of the `<rpc>` element.
    pub fn to_xml(&self) -> String {
        match self {
            Rpc::Get { filter } => match filter {
                Some(f) => format!("<get>{}</get>", subtree_filter(f)),
                None => "<get/>".to_string(),
            },
            Rpc::GetConfig { source, filter } => {
                let filter = filter.as_deref().map(subtree_filter).unwrap_or_default();
                format!(
                    "<get-config><source>{}</source>{}</get-config>",
                    source.element(),
                    filter
                )
            }
            Rpc::EditConfig {
                target,
                default_operation,
                config,
            } => {
                let default_operation = default_operation
                    .map(|op| format!("<default-operation>{}</default-operation>", op.as_str()))
                    .unwrap_or_default();
                format!(
                    "<edit-config><target>{}</target>{}{}</edit-config>",
                    target.element(),
                    default_operation,
                    config
                )
            }
            Rpc::Lock { target } => format!("<lock><target>{}</target></lock>", target.element()),
            Rpc::Unlock { target } => {
                format!("<unlock><target>{}</target></unlock>", target.element())
            }
            Rpc::Commit => "<commit/>".to_string(),
            Rpc::DiscardChanges => "<discard-changes/>".to_string(),
            Rpc::GetSchema {
                identifier,
                version,
            } => {
                let version = version
                    .as_deref()
                    .map(|v| format!("<version>{}</version>", message::escape(v)))
                    .unwrap_or_default();
                format!(
                    "<get-schema xmlns=\"{}\"><identifier>{}</identifier>{}<format>yang</format></get-schema>",
                    MONITORING_NS,
                    message::escape(identifier),
                    version
                )
            }
            Rpc::Raw { body } => body.clone(),
        }
    }
}

fn subtree_filter(filter: &str) -> String {
    format!("<filter type=\"subtree\">{}</filter>", filter)
}

/// A successful reply to an [`Rpc`].
#[derive(Debug, Clone)]
pub struct RpcReply {
    /// The `message-id` the reply answered.
    pub message_id: String,

    /// The raw `<rpc-reply>` document.
    pub raw: String,

    /// Time from send to reply.
    pub elapsed: Duration,

    /// `<rpc-error>` entries with severity `warning`.
    pub warnings: Vec<DocumentedError>,
}

impl RpcReply {
    /// Interpret a raw reply. Replies carrying an error-severity `<rpc-error>`
    /// are returned as `Err` with the first such error.
    pub fn parse(
        message_id: impl Into<String>,
        raw: impl Into<String>,
        elapsed: Duration,
    ) -> std::result::Result<Self, DocumentedError> {
        let raw = raw.into();
        let (errors, warnings): (Vec<_>, Vec<_>) = message::rpc_errors(&raw)
            .into_iter()
            .partition(|e| e.severity == ErrorSeverity::Error);
        if let Some(first) = errors.into_iter().next() {
            return Err(first);
        }
        Ok(Self {
            message_id: message_id.into(),
            raw,
            elapsed,
            warnings,
        })
    }

    /// Content of `<data>`. `None` if the reply has no data element.
    pub fn data(&self) -> Option<String> {
        message::data_content(&self.raw)
    }

    /// Whether the reply is `<ok/>`.
    pub fn is_ok(&self) -> bool {
        message::is_ok(&self.raw)
    }
}

impl fmt::Display for RpcReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.raw)
    }
}
