//! Builder for device communicators.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use secrecy::SecretString;
use tokio::sync::mpsc;

use super::{DeviceCommunicator, DeviceHandler};
use crate::device::DeviceId;
use crate::error::{Error, Result};
use crate::schema::{SchemaResolver, SourceRepository};
use crate::session::actor::{SessionActor, Shared};
use crate::session::{
    CapabilityOverrides, ReconnectPolicy, RequestCorrelator, SessionConfig, SessionMachine,
};
use crate::transport::{AuthMethod, HostKeyVerification, SshConfig, SshTransport, Transport};

/// Builder for constructing device communicators.
///
/// `build` spawns the session task, so it must run inside a tokio runtime.
/// The session stays disconnected until `connect` is called.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use ferrisconf::{DeviceBuilder, SessionConfig};
/// # use ferrisconf::schema::SourceRepository;
///
/// # fn example(models: Arc<dyn SourceRepository>) -> Result<(), ferrisconf::Error> {
/// let device = DeviceBuilder::new("192.168.1.1")
///     .port(830)
///     .username("admin")
///     .private_key("~/.ssh/id_ed25519")
///     .session_config(SessionConfig {
///         concurrent_rpc_limit: 8,
///         ..Default::default()
///     })
///     .source_repository(models)
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct DeviceBuilder {
    host: String,
    port: u16,
    name: Option<String>,
    username: Option<String>,
    auth: AuthMethod,
    timeout: Duration,
    host_key_verification: HostKeyVerification,
    known_hosts_path: Option<PathBuf>,
    chunked_framing: bool,
    ssh_keepalive: Option<Duration>,
    session_config: SessionConfig,
    reconnect: Option<ReconnectPolicy>,
    overrides: CapabilityOverrides,
    transport: Option<Arc<dyn Transport>>,
    repository: Option<Arc<dyn SourceRepository>>,
    handler: Option<Arc<dyn DeviceHandler>>,
}

impl DeviceBuilder {
    /// Create a new builder for the specified host.
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: 830,
            name: None,
            username: None,
            auth: AuthMethod::None,
            timeout: Duration::from_secs(30),
            host_key_verification: HostKeyVerification::default(),
            known_hosts_path: None,
            chunked_framing: true,
            ssh_keepalive: None,
            session_config: SessionConfig::default(),
            reconnect: None,
            overrides: CapabilityOverrides::default(),
            transport: None,
            repository: None,
            handler: None,
        }
    }

    /// Set the NETCONF port (default: 830).
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Logical device name used in logs and errors (default: `host:port`).
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set the username for authentication.
    pub fn username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    /// Set password authentication.
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.auth = AuthMethod::Password(SecretString::from(password.into()));
        self
    }

    /// Set private key authentication.
    pub fn private_key(mut self, key_path: impl Into<PathBuf>) -> Self {
        self.auth = AuthMethod::PrivateKey {
            path: key_path.into(),
            passphrase: None,
        };
        self
    }

    /// Set private key authentication with passphrase.
    pub fn private_key_with_passphrase(
        mut self,
        key_path: impl Into<PathBuf>,
        passphrase: impl Into<String>,
    ) -> Self {
        self.auth = AuthMethod::PrivateKey {
            path: key_path.into(),
            passphrase: Some(SecretString::from(passphrase.into())),
        };
        self
    }

    /// Bound on connecting, authenticating and the hello exchange.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn host_key_verification(mut self, mode: HostKeyVerification) -> Self {
        self.host_key_verification = mode;
        self
    }

    pub fn known_hosts_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.known_hosts_path = Some(path.into());
        self
    }

    /// Offer base:1.1 chunked framing (default: true).
    pub fn chunked_framing(mut self, enabled: bool) -> Self {
        self.chunked_framing = enabled;
        self
    }

    /// Send SSH keepalives at this interval (default: off).
    ///
    /// This only keeps the SSH connection alive. NETCONF-level keepalives
    /// are configured through [`SessionConfig::keepalive_interval_millis`].
    pub fn ssh_keepalive(mut self, interval: Duration) -> Self {
        self.ssh_keepalive = Some(interval);
        self
    }

    pub fn session_config(mut self, config: SessionConfig) -> Self {
        self.session_config = config;
        self
    }

    /// Override the reconnect policy derived from the session config.
    pub fn reconnect_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = Some(policy);
        self
    }

    pub fn capability_overrides(mut self, overrides: CapabilityOverrides) -> Self {
        self.overrides = overrides;
        self
    }

    /// Use a custom transport instead of NETCONF over SSH.
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Where schema sources come from. Usually a shared `SchemaCache`.
    pub fn source_repository(mut self, repository: Arc<dyn SourceRepository>) -> Self {
        self.repository = Some(repository);
        self
    }

    pub fn handler(mut self, handler: Arc<dyn DeviceHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Build the communicator and spawn its session task.
    pub fn build(self) -> Result<DeviceCommunicator> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| Error::Config {
            message: "DeviceBuilder::build must be called inside a tokio runtime".to_string(),
        })?;

        self.session_config.validate()?;

        let repository = self.repository.ok_or_else(|| Error::Config {
            message: "A source repository is required".to_string(),
        })?;

        let transport: Arc<dyn Transport> = match self.transport {
            Some(transport) => transport,
            None => {
                let username = self.username.ok_or_else(|| Error::Config {
                    message: "Username is required".to_string(),
                })?;
                let mut ssh = SshConfig::new(username, self.auth);
                ssh.timeout = self.timeout;
                ssh.host_key_verification = self.host_key_verification;
                ssh.known_hosts_path = self.known_hosts_path;
                ssh.offer_chunked_framing = self.chunked_framing;
                ssh.keepalive_interval = self.ssh_keepalive;
                Arc::new(SshTransport::new(ssh))
            }
        };

        let name = self
            .name
            .unwrap_or_else(|| format!("{}:{}", self.host, self.port));
        let device = DeviceId::new(name, self.host, self.port);

        let policy = self
            .reconnect
            .unwrap_or_else(|| self.session_config.reconnect_policy());
        let correlator = RequestCorrelator::new(
            device.to_string(),
            self.session_config.request_timeout(),
            self.session_config.concurrent_rpc_limit,
        );
        let shared = Arc::new(Shared::new(device.clone(), correlator));

        let (tx, rx) = mpsc::unbounded_channel();
        let actor = SessionActor::new(
            shared.clone(),
            SessionMachine::new(device.to_string(), policy),
            transport,
            SchemaResolver::new(device.to_string(), repository),
            self.handler,
            self.overrides,
            self.session_config.keepalive_interval(),
            rx,
            tx.clone(),
        );
        runtime.spawn(actor.run());

        Ok(DeviceCommunicator::new(shared, tx))
    }
}
