//! SSH transport adapter built on `russh`.
//!
//! # Responsibilities
//! - Run the SSH handshake over an accepted TCP stream
//! - Route password authentication through the [`CredentialVerifier`]
//! - Translate russh channel opens and requests into [`ChannelOpen`] and
//!   [`ControlRequest`] values, then answer the peer with the core's decisions
//!
//! # Design Decisions
//! - The handler holds no policy; every decision is made by the core and
//!   awaited here
//! - russh's server handler can only accept or refuse an open, and sends
//!   every refusal as `SSH_OPEN_ADMINISTRATIVELY_PROHIBITED` "Rejected". The
//!   core's reject reason and message are logged here and go no further.
//!   Channel types russh does not know are refused by russh itself with
//!   `SSH_OPEN_UNKNOWN_CHANNEL_TYPE` before the core sees them
//! - Authentication progress is published on a `watch` channel so the
//!   handshake can tell a rejected client from one that simply left
//! - A request arriving for a channel the core no longer listens on is
//!   answered with failure

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use futures_util::future::BoxFuture;
use russh::keys::PrivateKey;
use russh::server::{Auth, Handle, Msg, Session};
use russh::{Channel, ChannelId};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};

use crate::config::SshConfig;

use super::{
    encode_string, ChannelCloser, ChannelNumber, ChannelOpen, Connection, ControlRequest,
    CredentialVerifier, HandshakeError, Handshaker, OpenDecision, PeerIdentity, PendingChannel,
    Reply, Verdict,
};

const QUEUE_DEPTH: usize = 16;

/// Errors raised by the SSH adapter.
#[derive(Debug, thiserror::Error)]
pub enum SshError {
    #[error(transparent)]
    Russh(#[from] russh::Error),
    #[error("failed to load host key {path}: {source}")]
    HostKey {
        path: String,
        #[source]
        source: russh::keys::Error,
    },
}

/// Load the server's host key from an OpenSSH or PEM file.
pub fn load_host_key(path: &Path) -> Result<PrivateKey, SshError> {
    russh::keys::load_secret_key(path, None).map_err(|source| SshError::HostKey {
        path: path.display().to_string(),
        source,
    })
}

/// Build the russh server configuration.
pub fn server_config(config: &SshConfig, host_key: PrivateKey) -> russh::server::Config {
    russh::server::Config {
        auth_rejection_time: Duration::from_secs(config.auth_rejection_time_secs),
        auth_rejection_time_initial: Some(Duration::from_secs(0)),
        inactivity_timeout: config.inactivity_timeout_secs.map(Duration::from_secs),
        keys: vec![host_key],
        ..Default::default()
    }
}

/// Authentication progress for one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
enum AuthState {
    Pending,
    Rejected(String),
    Accepted(String),
}

impl AuthState {
    fn is_accepted(&self) -> bool {
        matches!(self, AuthState::Accepted(_))
    }
}

/// Performs SSH handshakes for the acceptor.
pub struct SshHandshaker {
    config: Arc<russh::server::Config>,
    verifier: Arc<dyn CredentialVerifier>,
    timeout: Duration,
}

impl SshHandshaker {
    pub fn new(
        config: russh::server::Config,
        verifier: Arc<dyn CredentialVerifier>,
        timeout: Duration,
    ) -> Self {
        Self {
            config: Arc::new(config),
            verifier,
            timeout,
        }
    }

    async fn run(
        &self,
        stream: TcpStream,
        peer_addr: SocketAddr,
    ) -> Result<Connection, HandshakeError> {
        let (open_tx, open_rx) = mpsc::channel(QUEUE_DEPTH);
        let (request_tx, request_rx) = mpsc::channel(QUEUE_DEPTH);
        let (auth_tx, mut auth_rx) = watch::channel(AuthState::Pending);

        let handler = SshHandler {
            verifier: self.verifier.clone(),
            peer_addr,
            auth: auth_tx,
            opens: open_tx,
            global_requests: request_tx,
            channels: HashMap::new(),
            next_channel: 0,
        };

        let deadline = tokio::time::Instant::now() + self.timeout;
        let handshake = russh::server::run_stream(self.config.clone(), stream, handler);
        let running = tokio::time::timeout_at(deadline, handshake)
            .await
            .map_err(|_| HandshakeError::Timeout(self.timeout.as_secs()))?
            .map_err(|e| HandshakeError::Transport(e.to_string()))?;
        let session = tokio::spawn(async move {
            if let Err(e) = running.await {
                tracing::debug!(peer = %peer_addr, error = %e, "SSH session ended with error");
            }
        });

        let authenticated = tokio::time::timeout_at(deadline, async {
            let accepted = auth_rx
                .wait_for(AuthState::is_accepted)
                .await
                .map(|state| state.clone());
            accepted.map_err(|_| auth_rx.borrow().clone())
        })
        .await;

        match authenticated {
            Ok(Ok(AuthState::Accepted(user))) => Ok(Connection {
                peer: PeerIdentity {
                    user,
                    addr: Some(peer_addr),
                },
                channel_opens: open_rx,
                requests: request_rx,
            }),
            Ok(Err(AuthState::Rejected(user))) => Err(HandshakeError::Rejected(user)),
            Ok(_) => Err(HandshakeError::Disconnected),
            Err(_) => {
                session.abort();
                Err(HandshakeError::Timeout(self.timeout.as_secs()))
            }
        }
    }
}

impl Handshaker for SshHandshaker {
    fn handshake(
        &self,
        stream: TcpStream,
        peer_addr: SocketAddr,
    ) -> BoxFuture<'_, Result<Connection, HandshakeError>> {
        Box::pin(self.run(stream, peer_addr))
    }
}

struct ChannelEntry {
    number: ChannelNumber,
    requests: mpsc::Sender<ControlRequest>,
}

/// Per-connection russh handler.
struct SshHandler {
    verifier: Arc<dyn CredentialVerifier>,
    peer_addr: SocketAddr,
    auth: watch::Sender<AuthState>,
    opens: mpsc::Sender<ChannelOpen>,
    global_requests: mpsc::Sender<ControlRequest>,
    channels: HashMap<ChannelId, ChannelEntry>,
    next_channel: u32,
}

impl SshHandler {
    async fn forward_open(
        &mut self,
        channel_type: &str,
        channel: Channel<Msg>,
        session: &mut Session,
    ) -> Result<bool, SshError> {
        let id = channel.id();
        let number = ChannelNumber(self.next_channel);
        self.next_channel = self.next_channel.wrapping_add(1);

        let (request_tx, request_rx) = mpsc::channel(QUEUE_DEPTH);
        let pending = PendingChannel {
            stream: Box::new(channel.into_stream()),
            requests: request_rx,
            closer: Box::new(SshCloser {
                handle: session.handle(),
                id,
            }),
        };
        self.channels.insert(
            id,
            ChannelEntry {
                number,
                requests: request_tx,
            },
        );

        let (open, decision) = ChannelOpen::new(number, channel_type, pending);
        if self.opens.send(open).await.is_err() {
            self.channels.remove(&id);
            return Ok(false);
        }

        match decision.await {
            Ok(OpenDecision::Accept) => Ok(true),
            Ok(OpenDecision::Reject { reason, message }) => {
                // russh answers the peer with "administratively prohibited".
                tracing::debug!(
                    peer = %self.peer_addr,
                    channel = %number,
                    reason = ?reason,
                    message = %message,
                    "Channel open rejected"
                );
                self.channels.remove(&id);
                Ok(false)
            }
            Err(_) => {
                self.channels.remove(&id);
                Ok(false)
            }
        }
    }

    async fn forward_request(&mut self, id: ChannelId, kind: &str, payload: Bytes) -> Reply {
        let Some(entry) = self.channels.get(&id) else {
            return Reply::Failure;
        };
        let (request, reply) = ControlRequest::new(kind, payload);
        if entry.requests.send(request).await.is_err() {
            tracing::trace!(
                channel = %entry.number,
                kind,
                "Request for a channel no longer negotiating"
            );
            return Reply::Failure;
        }
        reply.await.unwrap_or(Reply::Failure)
    }

    async fn answer_request(
        &mut self,
        id: ChannelId,
        kind: &str,
        payload: Bytes,
        session: &mut Session,
    ) -> Result<(), SshError> {
        if self.forward_request(id, kind, payload).await.is_success() {
            session.channel_success(id)?;
        } else {
            session.channel_failure(id)?;
        }
        Ok(())
    }
}

impl russh::server::Handler for SshHandler {
    type Error = SshError;

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        match self.verifier.verify(user, password.as_bytes()) {
            Verdict::Accept => {
                tracing::info!(user, peer = %self.peer_addr, "login detected");
                self.auth.send_replace(AuthState::Accepted(user.to_string()));
                Ok(Auth::Accept)
            }
            Verdict::Reject => {
                tracing::warn!(user, peer = %self.peer_addr, "authentication rejected");
                self.auth.send_replace(AuthState::Rejected(user.to_string()));
                Ok(Auth::Reject {
                    proceed_with_methods: None,
                    partial_success: false,
                })
            }
        }
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        self.forward_open("session", channel, session).await
    }

    async fn channel_open_x11(
        &mut self,
        channel: Channel<Msg>,
        _originator_address: &str,
        _originator_port: u32,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        self.forward_open("x11", channel, session).await
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        _host_to_connect: &str,
        _port_to_connect: u32,
        _originator_address: &str,
        _originator_port: u32,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        self.forward_open("direct-tcpip", channel, session).await
    }

    async fn subsystem_request(
        &mut self,
        channel: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.answer_request(channel, "subsystem", encode_string(name.as_bytes()), session)
            .await
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.answer_request(channel, "shell", Bytes::new(), session).await
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.answer_request(channel, "exec", encode_string(data), session).await
    }

    async fn env_request(
        &mut self,
        channel: ChannelId,
        variable_name: &str,
        variable_value: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let payload = encode_pair(variable_name.as_bytes(), variable_value.as_bytes());
        self.answer_request(channel, "env", payload, session).await
    }

    async fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(entry) = self.channels.remove(&channel) {
            tracing::trace!(
                peer = %self.peer_addr,
                channel = %entry.number,
                "Peer closed channel"
            );
        }
        Ok(())
    }

    async fn tcpip_forward(
        &mut self,
        address: &str,
        port: &mut u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let mut payload = BytesMut::new();
        payload.put_slice(&encode_string(address.as_bytes()));
        payload.put_u32(*port);

        let (request, reply) = ControlRequest::new("tcpip-forward", payload.freeze());
        if self.global_requests.send(request).await.is_err() {
            return Ok(false);
        }
        Ok(reply.await.map(|r| r.is_success()).unwrap_or(false))
    }
}

/// Concatenate two SSH strings.
fn encode_pair(first: &[u8], second: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(8 + first.len() + second.len());
    out.put_slice(&encode_string(first));
    out.put_slice(&encode_string(second));
    out.freeze()
}

/// Closes a channel through the session handle.
struct SshCloser {
    handle: Handle,
    id: ChannelId,
}

impl ChannelCloser for SshCloser {
    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            // Fails only when the session is already gone.
            let _ = self.handle.close(self.id).await;
        })
    }
}
