//! SSH connection handles.
//!
//! [`SshClient`] wraps an authenticated russh session. Clients are
//! established either by direct TCP dial or through an already-open
//! client's direct-tcpip channel, which is how tunnel chains nest
//! arbitrarily deep. [`SshDialer`] plugs both paths into the tunnel
//! resolver.

use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

use russh::client::{self, AuthResult, Handle, Msg};
use russh::keys::{decode_secret_key, PrivateKeyWithHashAlg};
use russh::{Channel, ChannelMsg, Disconnect};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

use opshub_core::constants::{
    CONNECT_TIMEOUT, KEEPALIVE_INTERVAL, PTY_CHANNEL_DEPTH, TERM_TYPE,
};
use opshub_core::{AuthMethod, Endpoint, Error, ResourceId, Result};

use crate::cache::ManagedConn;
use crate::terminal::{InteractiveConn, PtyChannel, PtyCommand};
use crate::tunnel::LinkDialer;

/// Captured output of a one-shot remote command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_status: u32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_status == 0
    }
}

/// One-shot command execution on a remote host. Separate from
/// [`ManagedConn`] so the stats collector can run against test doubles.
pub trait RemoteExec: Send + Sync {
    fn exec(&self, command: &str) -> impl Future<Output = Result<CommandOutput>> + Send;
}

struct ClientHandler;

impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh::keys::PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        // Managed machines are registered by operators; there is no
        // known_hosts store to verify against.
        Ok(true)
    }
}

struct SshInner {
    id: ResourceId,
    addr: String,
    handle: Handle<ClientHandler>,
    created_at: Instant,
    sessions: AtomicU32,
}

/// An authenticated SSH connection to one managed machine.
///
/// Cheap to clone; all clones share the underlying session. Dropping the
/// last clone tears the transport down, but cached handles are normally
/// closed explicitly through eviction.
#[derive(Clone)]
pub struct SshClient {
    inner: Arc<SshInner>,
}

impl SshClient {
    /// Dial `endpoint` over TCP and authenticate.
    pub async fn connect_direct(endpoint: &Endpoint) -> Result<Self> {
        let config = Arc::new(client_config());
        let connect = client::connect(
            config,
            (endpoint.host.as_str(), endpoint.port),
            ClientHandler,
        );
        let handle = timeout(CONNECT_TIMEOUT, connect)
            .await
            .map_err(|_| Error::transport(endpoint.id, format!("connect to {} timed out", endpoint.addr())))?
            .map_err(|e| Error::transport(endpoint.id, format!("connect to {} failed: {}", endpoint.addr(), e)))?;
        Self::authenticate(handle, endpoint).await
    }

    /// Open a direct-tcpip channel on `parent` to `endpoint` and run a
    /// fresh SSH session over it.
    pub async fn connect_via(parent: &SshClient, endpoint: &Endpoint) -> Result<Self> {
        let channel = parent
            .inner
            .handle
            .channel_open_direct_tcpip(endpoint.host.clone(), u32::from(endpoint.port), "127.0.0.1", 0)
            .await
            .map_err(|e| {
                Error::transport(
                    endpoint.id,
                    format!("tunnel through machine {} failed: {}", parent.id(), e),
                )
            })?;

        let config = Arc::new(client_config());
        let connect = client::connect_stream(config, channel.into_stream(), ClientHandler);
        let handle = timeout(CONNECT_TIMEOUT, connect)
            .await
            .map_err(|_| Error::transport(endpoint.id, format!("handshake with {} over tunnel timed out", endpoint.addr())))?
            .map_err(|e| Error::transport(endpoint.id, format!("handshake with {} over tunnel failed: {}", endpoint.addr(), e)))?;
        Self::authenticate(handle, endpoint).await
    }

    async fn authenticate(mut handle: Handle<ClientHandler>, endpoint: &Endpoint) -> Result<Self> {
        let auth_result = match &endpoint.auth {
            AuthMethod::Password { password } => handle
                .authenticate_password(endpoint.username.clone(), password.clone())
                .await
                .map_err(|e| Error::transport(endpoint.id, format!("password auth errored: {}", e)))?,
            AuthMethod::PrivateKey { key, passphrase } => {
                let key = decode_secret_key(key, passphrase.as_deref()).map_err(|e| {
                    Error::config(format!("machine {}: unreadable private key: {}", endpoint.id, e))
                })?;
                let hash_alg = handle
                    .best_supported_rsa_hash()
                    .await
                    .map_err(|e| Error::transport(endpoint.id, format!("rsa hash negotiation failed: {}", e)))?
                    .flatten();
                handle
                    .authenticate_publickey(
                        endpoint.username.clone(),
                        PrivateKeyWithHashAlg::new(Arc::new(key), hash_alg),
                    )
                    .await
                    .map_err(|e| Error::transport(endpoint.id, format!("publickey auth errored: {}", e)))?
            }
        };

        match auth_result {
            AuthResult::Success => {}
            AuthResult::Failure { .. } => {
                return Err(Error::Auth {
                    id: endpoint.id,
                    message: format!("credentials rejected for {}@{}", endpoint.username, endpoint.addr()),
                });
            }
        }

        info!(resource_id = endpoint.id, addr = %endpoint.addr(), "SSH connection established");
        Ok(Self {
            inner: Arc::new(SshInner {
                id: endpoint.id,
                addr: endpoint.addr(),
                handle,
                created_at: Instant::now(),
                sessions: AtomicU32::new(0),
            }),
        })
    }

    pub fn id(&self) -> ResourceId {
        self.inner.id
    }

    pub fn addr(&self) -> &str {
        &self.inner.addr
    }

    pub fn age(&self) -> std::time::Duration {
        self.inner.created_at.elapsed()
    }

    /// Number of interactive terminal sessions currently attached.
    pub fn session_count(&self) -> u32 {
        self.inner.sessions.load(Ordering::SeqCst)
    }

    /// Run `command` on a fresh exec channel and collect its output.
    pub async fn run(&self, command: &str) -> Result<CommandOutput> {
        let mut channel = self
            .inner
            .handle
            .channel_open_session()
            .await
            .map_err(|e| Error::transport(self.inner.id, format!("open exec channel: {}", e)))?;
        channel
            .exec(true, command)
            .await
            .map_err(|e| Error::transport(self.inner.id, format!("exec request: {}", e)))?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut exit_status = 0u32;

        loop {
            match channel.wait().await {
                Some(ChannelMsg::Data { data }) => stdout.extend_from_slice(&data),
                Some(ChannelMsg::ExtendedData { data, ext: 1 }) => stderr.extend_from_slice(&data),
                Some(ChannelMsg::ExitStatus { exit_status: code }) => exit_status = code,
                Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => break,
                Some(_) => {}
            }
        }

        trace!(resource_id = self.inner.id, command, exit_status, "Remote command finished");
        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            exit_status,
        })
    }

    /// Request a pty and shell on a new session channel and hand it to a
    /// relay task. Fails if the server rejects the pty request.
    pub async fn open_shell(&self, cols: u16, rows: u16) -> Result<PtyChannel> {
        let channel = self
            .inner
            .handle
            .channel_open_session()
            .await
            .map_err(|e| Error::transport(self.inner.id, format!("open session channel: {}", e)))?;

        channel
            .request_pty(true, TERM_TYPE, u32::from(cols), u32::from(rows), 0, 0, &[])
            .await
            .map_err(|e| Error::protocol(format!("pty allocation rejected: {}", e)))?;
        channel
            .request_shell(true)
            .await
            .map_err(|e| Error::protocol(format!("shell start rejected: {}", e)))?;

        Ok(spawn_pty_relay(self.inner.id, channel))
    }

    /// RAII marker for one attached terminal session.
    pub fn attach(&self) -> SessionGuard {
        self.inner.sessions.fetch_add(1, Ordering::SeqCst);
        SessionGuard {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl ManagedConn for SshClient {
    async fn is_alive(&self) -> bool {
        !self.inner.handle.is_closed()
    }

    async fn close(&self) {
        debug!(resource_id = self.inner.id, "Closing SSH connection");
        let _ = self
            .inner
            .handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await;
    }
}

impl RemoteExec for SshClient {
    async fn exec(&self, command: &str) -> Result<CommandOutput> {
        self.run(command).await
    }
}

impl InteractiveConn for SshClient {
    async fn open_pty(&self, cols: u16, rows: u16) -> Result<PtyChannel> {
        self.open_shell(cols, rows).await
    }

    fn attach_session(&self) -> Box<dyn std::any::Any + Send> {
        Box::new(self.attach())
    }
}

/// Decrements the owning client's session counter on drop.
pub struct SessionGuard {
    inner: Arc<SshInner>,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.inner.sessions.fetch_sub(1, Ordering::SeqCst);
    }
}

fn client_config() -> client::Config {
    client::Config {
        inactivity_timeout: None,
        keepalive_interval: Some(KEEPALIVE_INTERVAL),
        keepalive_max: 3,
        ..Default::default()
    }
}

/// Owns the russh channel for one interactive shell and relays between
/// it and the in-process pty frame channels. Dropping the channel when
/// the task exits closes the remote pty, so the shell receives EOF even
/// when the session is torn down from our side.
fn spawn_pty_relay(id: ResourceId, mut channel: Channel<Msg>) -> PtyChannel {
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<PtyCommand>(PTY_CHANNEL_DEPTH);
    let (output_tx, output_rx) = mpsc::channel::<Vec<u8>>(PTY_CHANNEL_DEPTH);

    tokio::spawn(async move {
        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(PtyCommand::Data(bytes)) => {
                        if let Err(e) = channel.data(&bytes[..]).await {
                            warn!(resource_id = id, error = %e, "Pty write failed");
                            break;
                        }
                    }
                    Some(PtyCommand::Resize { cols, rows }) => {
                        if let Err(e) = channel
                            .window_change(u32::from(cols), u32::from(rows), 0, 0)
                            .await
                        {
                            warn!(resource_id = id, error = %e, "Pty resize failed");
                        }
                    }
                    Some(PtyCommand::Close) | None => {
                        let _ = channel.eof().await;
                        break;
                    }
                },
                msg = channel.wait() => match msg {
                    Some(ChannelMsg::Data { data }) => {
                        if output_tx.send(data.to_vec()).await.is_err() {
                            break;
                        }
                    }
                    Some(ChannelMsg::ExtendedData { data, .. }) => {
                        if output_tx.send(data.to_vec()).await.is_err() {
                            break;
                        }
                    }
                    Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => break,
                    Some(_) => {}
                },
            }
        }
        debug!(resource_id = id, "Pty relay stopped");
        // output_tx drops here, signalling EOF to the session bridge.
    });

    PtyChannel::from_parts(cmd_tx, output_rx)
}

/// Production [`LinkDialer`]: direct TCP for root hops, direct-tcpip
/// channels for everything below.
#[derive(Default)]
pub struct SshDialer;

impl LinkDialer for SshDialer {
    type Conn = SshClient;

    async fn dial_direct(&self, endpoint: &Endpoint) -> Result<SshClient> {
        SshClient::connect_direct(endpoint).await
    }

    async fn dial_via(&self, parent: &SshClient, endpoint: &Endpoint) -> Result<SshClient> {
        SshClient::connect_via(parent, endpoint).await
    }
}
