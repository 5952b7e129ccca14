//! NETCONF over SSH using russh.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, info, trace, warn};
use russh::client::{self, Handle, Msg};
use russh::keys::{PrivateKeyWithHashAlg, PublicKey, load_secret_key};
use russh::{Channel, ChannelMsg};
use secrecy::ExposeSecret;
use tokio::sync::mpsc;

use super::config::{AuthMethod, HostKeyVerification, SshConfig};
use super::framing::{FrameDecoder, Framing, encode};
use super::{Transport, TransportEvent, TransportSession};
use crate::device::DeviceId;
use crate::error::TransportError;
use crate::rpc::message::{BASE_1_0, BASE_1_1, client_hello, parse_hello};

const NETCONF_SUBSYSTEM: &str = "netconf";

/// Opens NETCONF sessions over SSH.
#[derive(Debug, Clone)]
pub struct SshTransport {
    config: SshConfig,
}

impl SshTransport {
    pub fn new(config: SshConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SshConfig {
        &self.config
    }

    /// The connect timeout only bounds session setup; SSH keepalives are
    /// off unless configured.
    fn client_config(&self) -> client::Config {
        client::Config {
            inactivity_timeout: None,
            keepalive_interval: self.config.keepalive_interval,
            ..Default::default()
        }
    }

    async fn open(
        &self,
        device: &DeviceId,
    ) -> Result<(Handle<SshHandler>, Channel<Msg>), TransportError> {
        let ssh_config = Arc::new(self.client_config());

        let host_key_error: Arc<Mutex<Option<TransportError>>> = Arc::new(Mutex::new(None));

        let handler = SshHandler {
            host: device.host().to_string(),
            port: device.port(),
            host_key_verification: self.config.host_key_verification.clone(),
            known_hosts_path: self.config.known_hosts_path.clone(),
            host_key_error: host_key_error.clone(),
        };

        let mut session = client::connect(ssh_config, (device.host(), device.port()), handler)
            .await
            .map_err(|e| {
                // A detailed host-key error beats russh's generic UnknownKey.
                match host_key_error.lock().ok().and_then(|mut slot| slot.take()) {
                    Some(hk_err) => hk_err,
                    None => TransportError::Ssh(e),
                }
            })?;

        self.authenticate(&mut session).await?;

        let channel = session.channel_open_session().await?;
        channel.request_subsystem(true, NETCONF_SUBSYSTEM).await?;

        Ok((session, channel))
    }

    async fn authenticate(&self, session: &mut Handle<SshHandler>) -> Result<(), TransportError> {
        let username = &self.config.username;
        let success = match &self.config.auth {
            AuthMethod::None => session.authenticate_none(username).await?.success(),
            AuthMethod::Password(password) => session
                .authenticate_password(username, password.expose_secret())
                .await?
                .success(),
            AuthMethod::PrivateKey { path, passphrase } => {
                let key = load_secret_key(path, passphrase.as_ref().map(|p| p.expose_secret()))
                    .map_err(|e| TransportError::Key(e.to_string()))?;

                let hash_alg = session.best_supported_rsa_hash().await?.flatten();

                session
                    .authenticate_publickey(
                        username,
                        PrivateKeyWithHashAlg::new(Arc::new(key), hash_alg),
                    )
                    .await?
                    .success()
            }
        };

        if !success {
            return Err(TransportError::AuthenticationFailed {
                user: username.clone(),
            });
        }
        Ok(())
    }

    /// Send our hello and wait for the device's.
    async fn exchange_hello(
        &self,
        device: &DeviceId,
        channel: &mut Channel<Msg>,
        decoder: &mut FrameDecoder,
    ) -> Result<(Vec<String>, Option<u64>), TransportError> {
        let mut ours = vec![BASE_1_0];
        if self.config.offer_chunked_framing {
            ours.push(BASE_1_1);
        }
        let hello = encode(Framing::EndOfMessage, &client_hello(&ours));
        channel.data(&hello[..]).await?;

        loop {
            if let Some(message) = decoder.next_message()? {
                let hello = parse_hello(&message).ok_or_else(|| {
                    TransportError::InvalidHello(format!(
                        "{}: no capabilities in hello",
                        device
                    ))
                })?;
                return Ok((hello.capabilities, hello.session_id));
            }
            match channel.wait().await {
                Some(ChannelMsg::Data { data }) => decoder.extend(&data[..]),
                Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => {
                    return Err(TransportError::Disconnected);
                }
                Some(other) => trace!("{}: ignoring channel message {:?}", device, other),
            }
        }
    }
}

#[async_trait]
impl Transport for SshTransport {
    async fn connect(
        &self,
        device: &DeviceId,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Arc<dyn TransportSession>, TransportError> {
        let timeout = self.config.timeout;
        let establish = async {
            let (handle, mut channel) = self.open(device).await?;
            let mut decoder = FrameDecoder::new(Framing::EndOfMessage);
            let (capabilities, session_id) = self
                .exchange_hello(device, &mut channel, &mut decoder)
                .await?;
            Ok::<_, TransportError>((handle, channel, decoder, capabilities, session_id))
        };

        let (handle, channel, mut decoder, capabilities, session_id) =
            tokio::time::timeout(timeout, establish)
                .await
                .map_err(|_| TransportError::Timeout(timeout))??;

        let framing = if self.config.offer_chunked_framing
            && capabilities.iter().any(|c| c == BASE_1_1)
        {
            Framing::Chunked
        } else {
            Framing::EndOfMessage
        };
        decoder.set_framing(framing);

        info!(
            "{}: NETCONF session {:?} established ({:?} framing, {} capabilities)",
            device,
            session_id,
            framing,
            capabilities.len()
        );

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_channel(
            device.to_string(),
            handle,
            channel,
            decoder,
            outbound_rx,
            events,
        ));

        Ok(Arc::new(SshSession {
            capabilities,
            session_id,
            framing,
            outbound: outbound_tx,
            closed: AtomicBool::new(false),
        }))
    }
}

enum Outbound {
    Frame(Bytes),
    Close,
}

struct SshSession {
    capabilities: Vec<String>,
    session_id: Option<u64>,
    framing: Framing,
    outbound: mpsc::UnboundedSender<Outbound>,
    closed: AtomicBool,
}

impl TransportSession for SshSession {
    fn capabilities(&self) -> &[String] {
        &self.capabilities
    }

    fn session_id(&self) -> Option<u64> {
        self.session_id
    }

    fn send(&self, message: String) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Disconnected);
        }
        self.outbound
            .send(Outbound::Frame(encode(self.framing, &message)))
            .map_err(|_| TransportError::Disconnected)
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            let _ = self.outbound.send(Outbound::Close);
        }
    }
}

impl Drop for SshSession {
    fn drop(&mut self) {
        self.close();
    }
}

/// Own the channel: write queued frames, decode inbound data into events.
async fn run_channel(
    device: String,
    handle: Handle<SshHandler>,
    mut channel: Channel<Msg>,
    mut decoder: FrameDecoder,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    events: mpsc::UnboundedSender<TransportEvent>,
) {
    let reason = loop {
        tokio::select! {
            msg = channel.wait() => match msg {
                Some(ChannelMsg::Data { data }) => {
                    decoder.extend(&data[..]);
                    let mut failure = None;
                    loop {
                        match decoder.next_message() {
                            Ok(Some(message)) => {
                                if events.send(TransportEvent::Message(message)).is_err() {
                                    failure = Some("event receiver dropped".to_string());
                                    break;
                                }
                            }
                            Ok(None) => break,
                            Err(e) => {
                                failure = Some(e.to_string());
                                break;
                            }
                        }
                    }
                    if let Some(reason) = failure {
                        break reason;
                    }
                }
                Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => {
                    break "channel closed by device".to_string();
                }
                Some(ChannelMsg::ExitStatus { exit_status }) => {
                    debug!("{}: subsystem exited with status {}", device, exit_status);
                }
                Some(other) => trace!("{}: ignoring channel message {:?}", device, other),
            },
            out = outbound.recv() => match out {
                Some(Outbound::Frame(bytes)) => {
                    if let Err(e) = channel.data(&bytes[..]).await {
                        break format!("write failed: {}", e);
                    }
                }
                Some(Outbound::Close) | None => break "closed locally".to_string(),
            },
        }
    };

    debug!("{}: NETCONF channel finished: {}", device, reason);
    let _ = channel.eof().await;
    let _ = channel.close().await;
    if let Err(e) = handle
        .disconnect(russh::Disconnect::ByApplication, "", "en")
        .await
    {
        debug!("{}: SSH disconnect failed: {}", device, e);
    }
    let _ = events.send(TransportEvent::Down { reason });
}

/// SSH client handler for russh.
struct SshHandler {
    host: String,
    port: u16,
    host_key_verification: HostKeyVerification,
    known_hosts_path: Option<PathBuf>,
    /// Detailed host-key failure for `connect` to report.
    host_key_error: Arc<Mutex<Option<TransportError>>>,
}

impl SshHandler {
    /// `Ok(true)` if the key matches, `Ok(false)` if the host is unknown.
    fn check_known_hosts(&self, pubkey: &PublicKey) -> Result<bool, TransportError> {
        let result = match &self.known_hosts_path {
            Some(path) => russh::keys::check_known_hosts_path(&self.host, self.port, pubkey, path),
            None => russh::keys::check_known_hosts(&self.host, self.port, pubkey),
        };

        match result {
            Ok(matched) => Ok(matched),
            Err(russh::keys::Error::KeyChanged { line }) => Err(TransportError::HostKeyChanged {
                host: self.host.clone(),
                port: self.port,
                line,
            }),
            Err(e) => Err(TransportError::KnownHosts(e.to_string())),
        }
    }

    fn learn_host_key(&self, pubkey: &PublicKey) -> Result<(), TransportError> {
        let result = match &self.known_hosts_path {
            Some(path) => russh::keys::known_hosts::learn_known_hosts_path(
                &self.host, self.port, pubkey, path,
            ),
            None => russh::keys::known_hosts::learn_known_hosts(&self.host, self.port, pubkey),
        };
        result.map_err(|e| TransportError::KnownHosts(e.to_string()))
    }

    fn reject(&self, err: TransportError) -> bool {
        if let Ok(mut slot) = self.host_key_error.lock() {
            *slot = Some(err);
        }
        false
    }
}

impl client::Handler for SshHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        let accepted = match self.host_key_verification {
            HostKeyVerification::Disabled => true,
            HostKeyVerification::AcceptNew => match self.check_known_hosts(server_public_key) {
                Ok(true) => true,
                Ok(false) => {
                    if let Err(e) = self.learn_host_key(server_public_key) {
                        warn!("{}:{}: failed to save host key: {}", self.host, self.port, e);
                    }
                    true
                }
                Err(e) => self.reject(e),
            },
            HostKeyVerification::Strict => match self.check_known_hosts(server_public_key) {
                Ok(true) => true,
                Ok(false) => self.reject(TransportError::HostKeyUnknown {
                    host: self.host.clone(),
                    port: self.port,
                }),
                Err(e) => self.reject(e),
            },
        };
        Ok(accepted)
    }
}
