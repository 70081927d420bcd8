//! Transport vocabulary shared by the server core and transport adapters.
//!
//! # Data Flow
//! ```text
//! TcpStream
//!     → Handshaker (ssh.rs in production, memory.rs in tests)
//!     → Connection { peer, channel opens, connection-level requests }
//!     → ChannelOpen  --accept-->  AcceptedChannel { stream, requests, closer }
//!                    --reject-->  open failure sent to the peer
//! ```
//!
//! # Design Decisions
//! - Every decision or reply is a value consumed on use, so a second answer
//!   cannot be expressed
//! - Dropping an unanswered open or request answers it negatively
//! - The core never sees transport framing; it only sees these types

pub mod auth;
pub mod memory;
pub mod ssh;

use std::fmt;
use std::net::SocketAddr;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};

pub use auth::{CredentialVerifier, StaticCredentials, Verdict};

/// Duplex byte stream carried by an accepted channel.
pub trait ChannelIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> ChannelIo for T {}

/// Owned channel byte stream.
pub type ByteStream = Box<dyn ChannelIo>;

/// Releases a channel at the transport level.
pub trait ChannelCloser: Send + Sync {
    /// Close the channel. Must be harmless on an already-closed channel.
    fn close(&self) -> BoxFuture<'_, ()>;
}

/// Error type for transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("channel {0} closed before it could be accepted")]
    ChannelGone(ChannelNumber),
}

/// Why a handshake did not produce a connection.
#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("authentication rejected for {0:?}")]
    Rejected(String),
    #[error("peer disconnected before authenticating")]
    Disconnected,
    #[error("handshake timed out after {0} seconds")]
    Timeout(u64),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl HandshakeError {
    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            HandshakeError::Rejected(_) => "rejected",
            HandshakeError::Disconnected => "disconnected",
            HandshakeError::Timeout(_) => "timeout",
            HandshakeError::Transport(_) => "transport",
            HandshakeError::Io(_) => "io",
        }
    }
}

/// Turns raw TCP connections into authenticated [`Connection`]s.
pub trait Handshaker: Send + Sync + 'static {
    fn handshake(
        &self,
        stream: TcpStream,
        peer_addr: SocketAddr,
    ) -> BoxFuture<'_, Result<Connection, HandshakeError>>;
}

/// Who is on the other end of a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerIdentity {
    /// Authenticated user name.
    pub user: String,
    /// Remote socket address, when the transport has one.
    pub addr: Option<SocketAddr>,
}

impl fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.addr {
            Some(addr) => write!(f, "{}@{}", self.user, addr),
            None => write!(f, "{}", self.user),
        }
    }
}

/// One authenticated transport session.
#[derive(Debug)]
pub struct Connection {
    pub peer: PeerIdentity,
    /// Inbound channel-open requests, in arrival order.
    pub channel_opens: mpsc::Receiver<ChannelOpen>,
    /// Connection-level out-of-band requests.
    pub requests: mpsc::Receiver<ControlRequest>,
}

/// Per-connection channel number assigned by the transport adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelNumber(pub u32);

impl fmt::Display for ChannelNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ch-{}", self.0)
    }
}

/// Channel open failure codes (RFC 4254 §5.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    AdministrativelyProhibited = 1,
    ConnectFailed = 2,
    UnknownChannelType = 3,
    ResourceShortage = 4,
}

/// Answer to a channel-open request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpenDecision {
    Accept,
    Reject {
        reason: RejectReason,
        message: String,
    },
}

/// Answer to a control request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Success { payload: Option<Bytes> },
    Failure,
}

impl Reply {
    pub fn success() -> Self {
        Reply::Success { payload: None }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Reply::Success { .. })
    }
}

/// One out-of-band request on a channel or connection.
///
/// The reply handle is consumed by [`ControlRequest::reply`]. A request
/// dropped without a reply answers [`Reply::Failure`].
pub struct ControlRequest {
    kind: String,
    payload: Bytes,
    reply: Option<oneshot::Sender<Reply>>,
}

impl ControlRequest {
    /// Build a request and the receiver its reply will arrive on.
    pub fn new(
        kind: impl Into<String>,
        payload: impl Into<Bytes>,
    ) -> (Self, oneshot::Receiver<Reply>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                kind: kind.into(),
                payload: payload.into(),
                reply: Some(tx),
            },
            rx,
        )
    }

    /// The request type tag.
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Opaque payload bytes.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Answer the request.
    pub fn reply(mut self, reply: Reply) {
        if let Some(tx) = self.reply.take() {
            // The requester may have gone away; nothing to do then.
            let _ = tx.send(reply);
        }
    }
}

impl Drop for ControlRequest {
    fn drop(&mut self) {
        if let Some(tx) = self.reply.take() {
            let _ = tx.send(Reply::Failure);
        }
    }
}

impl fmt::Debug for ControlRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControlRequest")
            .field("kind", &self.kind)
            .field("payload_len", &self.payload.len())
            .field("answered", &self.reply.is_none())
            .finish()
    }
}

/// Transport resources for a channel, handed over on accept.
pub struct PendingChannel {
    pub stream: ByteStream,
    pub requests: mpsc::Receiver<ControlRequest>,
    pub closer: Box<dyn ChannelCloser>,
}

/// An inbound channel-open request awaiting a decision.
///
/// Dropped without a decision it rejects with `ConnectFailed`.
pub struct ChannelOpen {
    number: ChannelNumber,
    channel_type: String,
    decision: Option<oneshot::Sender<OpenDecision>>,
    pending: Option<PendingChannel>,
}

impl ChannelOpen {
    pub fn new(
        number: ChannelNumber,
        channel_type: impl Into<String>,
        pending: PendingChannel,
    ) -> (Self, oneshot::Receiver<OpenDecision>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                number,
                channel_type: channel_type.into(),
                decision: Some(tx),
                pending: Some(pending),
            },
            rx,
        )
    }

    pub fn number(&self) -> ChannelNumber {
        self.number
    }

    /// Declared channel type, e.g. `session`.
    pub fn channel_type(&self) -> &str {
        &self.channel_type
    }

    /// Refuse the channel.
    pub fn reject(mut self, reason: RejectReason, message: impl Into<String>) {
        if let Some(tx) = self.decision.take() {
            let _ = tx.send(OpenDecision::Reject {
                reason,
                message: message.into(),
            });
        }
    }

    /// Accept the channel and take ownership of its stream and request queue.
    pub fn accept(mut self) -> Result<AcceptedChannel, TransportError> {
        let tx = self
            .decision
            .take()
            .ok_or(TransportError::ChannelGone(self.number))?;
        let pending = self
            .pending
            .take()
            .ok_or(TransportError::ChannelGone(self.number))?;

        tx.send(OpenDecision::Accept)
            .map_err(|_| TransportError::ChannelGone(self.number))?;

        Ok(AcceptedChannel {
            number: self.number,
            stream: pending.stream,
            requests: pending.requests,
            closer: pending.closer,
        })
    }
}

impl Drop for ChannelOpen {
    fn drop(&mut self) {
        if let Some(tx) = self.decision.take() {
            let _ = tx.send(OpenDecision::Reject {
                reason: RejectReason::ConnectFailed,
                message: "channel dropped".to_string(),
            });
        }
    }
}

impl fmt::Debug for ChannelOpen {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelOpen")
            .field("number", &self.number)
            .field("channel_type", &self.channel_type)
            .finish()
    }
}

/// A channel the server has accepted.
pub struct AcceptedChannel {
    pub number: ChannelNumber,
    pub stream: ByteStream,
    pub requests: mpsc::Receiver<ControlRequest>,
    pub closer: Box<dyn ChannelCloser>,
}

/// Closer for transports where dropping the stream is enough.
pub struct NoopCloser;

impl ChannelCloser for NoopCloser {
    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async {})
    }
}

/// Encode an SSH `string`: big-endian u32 length followed by the bytes.
pub fn encode_string(value: &[u8]) -> Bytes {
    let mut out = Vec::with_capacity(4 + value.len());
    out.extend_from_slice(&(value.len() as u32).to_be_bytes());
    out.extend_from_slice(value);
    Bytes::from(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending() -> (PendingChannel, mpsc::Sender<ControlRequest>) {
        let (stream, _peer) = tokio::io::duplex(64);
        let (tx, rx) = mpsc::channel(4);
        (
            PendingChannel {
                stream: Box::new(stream),
                requests: rx,
                closer: Box::new(NoopCloser),
            },
            tx,
        )
    }

    #[tokio::test]
    async fn request_reply_is_delivered_once() {
        let (request, rx) = ControlRequest::new("subsystem", encode_string(b"sftp"));
        assert_eq!(request.kind(), "subsystem");
        assert_eq!(request.payload(), b"\x00\x00\x00\x04sftp");

        request.reply(Reply::success());
        assert_eq!(rx.await.unwrap(), Reply::success());
    }

    #[tokio::test]
    async fn dropped_request_answers_failure() {
        let (request, rx) = ControlRequest::new("shell", Bytes::new());
        drop(request);
        assert_eq!(rx.await.unwrap(), Reply::Failure);
    }

    #[tokio::test]
    async fn dropped_open_is_rejected() {
        let (pending, _tx) = pending();
        let (open, rx) = ChannelOpen::new(ChannelNumber(0), "session", pending);
        drop(open);
        assert!(matches!(
            rx.await.unwrap(),
            OpenDecision::Reject {
                reason: RejectReason::ConnectFailed,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn accept_fails_when_peer_is_gone() {
        let (pending, _tx) = pending();
        let (open, rx) = ChannelOpen::new(ChannelNumber(7), "session", pending);
        drop(rx);
        let err = open.accept().err().unwrap();
        assert!(matches!(err, TransportError::ChannelGone(ChannelNumber(7))));
    }

    #[test]
    fn encode_string_prefixes_length() {
        assert_eq!(&encode_string(b"ftp")[..], b"\x00\x00\x00\x03ftp");
        assert_eq!(&encode_string(b"")[..], b"\x00\x00\x00\x00");
    }
}
