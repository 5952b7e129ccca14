//! Error types for ferrisconf.

use std::fmt;
use std::io;
use std::time::Duration;

use indexmap::IndexMap;
use thiserror::Error;

use crate::data::{DataPath, Datastore};
use crate::schema::SourceIdentifier;

/// Main error type for ferrisconf operations.
#[derive(Error, Debug)]
pub enum Error {
    /// SSH/NETCONF transport-level errors
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Session lifecycle errors
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    /// Schema context could not be built
    #[error("Schema error: {0}")]
    Schema(#[from] SchemaResolutionError),

    /// Errors resolving a single RPC
    #[error("RPC error: {0}")]
    Rpc(#[from] RpcError),

    /// Errors from a proxied cluster transaction
    #[error("Proxy error: {0}")]
    Proxy(#[from] ProxyError),

    /// Invalid builder or session configuration
    #[error("Invalid configuration: {message}")]
    Config { message: String },
}

/// Transport layer errors (SSH connection, authentication, NETCONF framing).
#[derive(Error, Debug)]
pub enum TransportError {
    /// SSH handshake or protocol error
    #[error("SSH error: {0}")]
    Ssh(#[from] russh::Error),

    /// Authentication failed
    #[error("Authentication failed for user '{user}'")]
    AuthenticationFailed { user: String },

    /// SSH key error
    #[error("SSH key error: {0}")]
    Key(String),

    /// Host key is not in known_hosts and verification is strict
    #[error("Host key for {host}:{port} is unknown")]
    HostKeyUnknown { host: String, port: u16 },

    /// Host key differs from the one recorded in known_hosts
    #[error("Host key for {host}:{port} changed (known_hosts line {line})")]
    HostKeyChanged { host: String, port: u16, line: usize },

    /// known_hosts could not be read or written
    #[error("known_hosts error: {0}")]
    KnownHosts(String),

    /// The server's hello was missing or unusable
    #[error("Invalid hello from device: {0}")]
    InvalidHello(String),

    /// A frame could not be decoded
    #[error("Framing error: {0}")]
    Framing(String),

    /// Connection was closed unexpectedly
    #[error("Connection disconnected")]
    Disconnected,

    /// Operation timed out
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Session lifecycle errors reported to `connect()` callers and device handlers.
#[derive(Error, Debug, Clone)]
pub enum SessionError {
    /// The session is not up
    #[error("{device}: session is not connected")]
    NotConnected { device: String },

    /// The connection attempt was abandoned by `disconnect()`
    #[error("{device}: session was disconnected")]
    Disconnected { device: String },

    /// Reconnect attempts are exhausted
    #[error("{device}: given up connecting after {attempts} attempts: {reason}")]
    GivenUp {
        device: String,
        attempts: u32,
        reason: String,
    },

    /// The session task is gone
    #[error("{device}: session task terminated")]
    Terminated { device: String },
}

/// The required schema source set could not produce a context.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchemaResolutionError {
    /// Every required source was stripped
    #[error("no more sources for schema context")]
    NoSources,

    /// A degrade step did not shrink the required set
    #[error("resolution did not make progress on {remaining} sources")]
    NoProgress { remaining: usize },

    /// The source repository reported a non-recoverable failure
    #[error("unrecoverable schema build failure: {0}")]
    Unrecoverable(String),

    /// A missing source was reported that was never required
    #[error("source {0} reported missing but not in the required set")]
    UnknownSource(SourceIdentifier),
}

/// Errors resolving a single RPC future.
#[derive(Error, Debug, Clone)]
pub enum RpcError {
    /// No reply within the request deadline
    #[error("request {message_id} timed out after {timeout:?}")]
    Timeout {
        message_id: String,
        timeout: Duration,
    },

    /// The session was torn down while the request was outstanding
    #[error("the netconf session to {device} is disconnected")]
    SessionClosed { device: String },

    /// There is no session to send on
    #[error("{device}: session is not connected")]
    NotConnected { device: String },

    /// The transport refused the outbound message
    #[error("{device}: failed to send request {message_id}: {reason}")]
    SendFailed {
        device: String,
        message_id: String,
        reason: String,
    },

    /// The device replied with an `<rpc-error>`
    #[error("remote error: {0}")]
    Remote(DocumentedError),
}

/// Errors surfaced by a proxied cluster transaction.
///
/// Every variant that represents a failed operation carries a
/// [`DocumentedError`] cause, so remote failures and ask timeouts look the same.
#[derive(Error, Debug, Clone)]
pub enum ProxyError {
    /// A `read` or `exists` failed
    #[error("Read of store {store} path {path} failed")]
    ReadFailed {
        store: Datastore,
        path: DataPath,
        #[source]
        cause: DocumentedError,
    },

    /// A `commit` failed
    #[error("{device}: Commit of operation failed")]
    CommitFailed {
        device: String,
        #[source]
        cause: DocumentedError,
    },

    /// The transaction was already submitted or cancelled
    #[error("{device}: transaction {state} already")]
    TransactionClosed { device: String, state: &'static str },

    /// The owner replied with a message that does not answer the request
    #[error("{device}: {operation} returned unexpected reply")]
    UnexpectedReply {
        device: String,
        operation: &'static str,
    },
}

impl ProxyError {
    /// The protocol-level cause of a failed operation, if any.
    pub fn cause(&self) -> Option<&DocumentedError> {
        match self {
            ProxyError::ReadFailed { cause, .. } | ProxyError::CommitFailed { cause, .. } => {
                Some(cause)
            }
            _ => None,
        }
    }
}

/// NETCONF `error-type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorType {
    Transport,
    Rpc,
    Protocol,
    Application,
}

impl ErrorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorType::Transport => "transport",
            ErrorType::Rpc => "rpc",
            ErrorType::Protocol => "protocol",
            ErrorType::Application => "application",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "transport" => Some(ErrorType::Transport),
            "rpc" => Some(ErrorType::Rpc),
            "protocol" => Some(ErrorType::Protocol),
            "application" => Some(ErrorType::Application),
            _ => None,
        }
    }
}

/// NETCONF `error-severity`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorSeverity {
    Error,
    Warning,
}

impl ErrorSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorSeverity::Error => "error",
            ErrorSeverity::Warning => "warning",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "error" => Some(ErrorSeverity::Error),
            "warning" => Some(ErrorSeverity::Warning),
            _ => None,
        }
    }
}

/// NETCONF `error-tag` (RFC 6241 Appendix A).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorTag {
    InUse,
    InvalidValue,
    TooBig,
    MissingAttribute,
    BadAttribute,
    UnknownAttribute,
    MissingElement,
    BadElement,
    UnknownElement,
    UnknownNamespace,
    AccessDenied,
    LockDenied,
    ResourceDenied,
    RollbackFailed,
    DataExists,
    DataMissing,
    OperationNotSupported,
    OperationFailed,
    PartialOperation,
    MalformedMessage,
}

const ERROR_TAGS: &[(ErrorTag, &str)] = &[
    (ErrorTag::InUse, "in-use"),
    (ErrorTag::InvalidValue, "invalid-value"),
    (ErrorTag::TooBig, "too-big"),
    (ErrorTag::MissingAttribute, "missing-attribute"),
    (ErrorTag::BadAttribute, "bad-attribute"),
    (ErrorTag::UnknownAttribute, "unknown-attribute"),
    (ErrorTag::MissingElement, "missing-element"),
    (ErrorTag::BadElement, "bad-element"),
    (ErrorTag::UnknownElement, "unknown-element"),
    (ErrorTag::UnknownNamespace, "unknown-namespace"),
    (ErrorTag::AccessDenied, "access-denied"),
    (ErrorTag::LockDenied, "lock-denied"),
    (ErrorTag::ResourceDenied, "resource-denied"),
    (ErrorTag::RollbackFailed, "rollback-failed"),
    (ErrorTag::DataExists, "data-exists"),
    (ErrorTag::DataMissing, "data-missing"),
    (ErrorTag::OperationNotSupported, "operation-not-supported"),
    (ErrorTag::OperationFailed, "operation-failed"),
    (ErrorTag::PartialOperation, "partial-operation"),
    (ErrorTag::MalformedMessage, "malformed-message"),
];

impl ErrorTag {
    pub fn as_str(&self) -> &'static str {
        ERROR_TAGS
            .iter()
            .find(|(tag, _)| tag == self)
            .map(|(_, name)| *name)
            .unwrap_or("operation-failed")
    }

    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim();
        ERROR_TAGS
            .iter()
            .find(|(_, name)| *name == value)
            .map(|(tag, _)| *tag)
    }
}

/// A protocol-level error in the shape of a NETCONF `<rpc-error>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentedError {
    pub error_type: ErrorType,
    pub tag: ErrorTag,
    pub severity: ErrorSeverity,
    pub message: String,
    pub info: IndexMap<String, String>,
}

impl DocumentedError {
    /// Create an error with no `error-info`.
    pub fn new(
        error_type: ErrorType,
        tag: ErrorTag,
        severity: ErrorSeverity,
        message: impl Into<String>,
    ) -> Self {
        Self {
            error_type,
            tag,
            severity,
            message: message.into(),
            info: IndexMap::new(),
        }
    }

    /// An application-level `operation-failed` error.
    pub fn operation_failed(message: impl Into<String>) -> Self {
        Self::new(
            ErrorType::Application,
            ErrorTag::OperationFailed,
            ErrorSeverity::Error,
            message,
        )
    }

    /// The error reported when the owning node of a device does not answer.
    pub fn master_is_down(device: impl fmt::Display) -> Self {
        Self::new(
            ErrorType::Application,
            ErrorTag::OperationFailed,
            ErrorSeverity::Warning,
            format!("{}: Master is down. Please try again.", device),
        )
    }

    /// Add an `error-info` entry.
    pub fn with_info(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.info.insert(key.into(), value.into());
        self
    }
}

impl fmt::Display for DocumentedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({} {} {})",
            self.message,
            self.severity.as_str(),
            self.error_type.as_str(),
            self.tag.as_str()
        )
    }
}

impl std::error::Error for DocumentedError {}

impl From<&Error> for DocumentedError {
    /// Flatten a local failure into the shape carried across the cluster channel.
    fn from(err: &Error) -> Self {
        match err {
            Error::Rpc(RpcError::Remote(doc)) => doc.clone(),
            Error::Proxy(proxy) => proxy
                .cause()
                .cloned()
                .unwrap_or_else(|| DocumentedError::operation_failed(proxy.to_string())),
            Error::Transport(e) => DocumentedError::new(
                ErrorType::Transport,
                ErrorTag::OperationFailed,
                ErrorSeverity::Error,
                e.to_string(),
            ),
            Error::Rpc(e @ RpcError::SessionClosed { .. })
            | Error::Rpc(e @ RpcError::NotConnected { .. })
            | Error::Rpc(e @ RpcError::SendFailed { .. }) => DocumentedError::new(
                ErrorType::Transport,
                ErrorTag::OperationFailed,
                ErrorSeverity::Error,
                e.to_string(),
            ),
            other => DocumentedError::operation_failed(other.to_string()),
        }
    }
}

/// Result type alias using ferrisconf's Error.
pub type Result<T> = std::result::Result<T, Error>;
