//! In-process transport.
//!
//! Produces a [`Connection`] whose channels are backed by `tokio::io::duplex`
//! pipes, plus a [`MemoryClient`] that drives it from the peer's side. Used
//! to exercise the server core without a secure transport underneath.

use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use tokio::io::DuplexStream;
use tokio::sync::mpsc;

use super::{
    ChannelCloser, ChannelNumber, ChannelOpen, Connection, ControlRequest, OpenDecision,
    PeerIdentity, PendingChannel, RejectReason, Reply,
};

const QUEUE_DEPTH: usize = 16;
const PIPE_CAPACITY: usize = 64 * 1024;

/// Build a connected pair: the server's [`Connection`] and the peer driving it.
pub fn connection(peer: PeerIdentity) -> (Connection, MemoryClient) {
    let (open_tx, open_rx) = mpsc::channel(QUEUE_DEPTH);
    let (request_tx, request_rx) = mpsc::channel(QUEUE_DEPTH);
    (
        Connection {
            peer,
            channel_opens: open_rx,
            requests: request_rx,
        },
        MemoryClient {
            opens: open_tx,
            requests: request_tx,
            next_channel: AtomicU32::new(0),
        },
    )
}

/// The server refused a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenRejected {
    pub reason: RejectReason,
    pub message: String,
}

impl fmt::Display for OpenRejected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "channel open rejected ({:?}): {}", self.reason, self.message)
    }
}

impl std::error::Error for OpenRejected {}

/// Peer side of an in-memory connection.
pub struct MemoryClient {
    opens: mpsc::Sender<ChannelOpen>,
    requests: mpsc::Sender<ControlRequest>,
    next_channel: AtomicU32,
}

impl MemoryClient {
    /// Open a channel and wait for the server's decision.
    pub async fn open_channel(&self, channel_type: &str) -> Result<ClientChannel, OpenRejected> {
        let (number, pending, client) = self.prepare_channel();
        let (open, decision) = ChannelOpen::new(number, channel_type, pending);

        if self.opens.send(open).await.is_err() {
            return Err(connection_closed());
        }

        match decision.await {
            Ok(OpenDecision::Accept) => Ok(client),
            Ok(OpenDecision::Reject { reason, message }) => Err(OpenRejected { reason, message }),
            Err(_) => Err(connection_closed()),
        }
    }

    /// Send a connection-level request.
    pub async fn global_request(&self, kind: &str, payload: impl Into<Bytes>) -> Reply {
        let (request, reply) = ControlRequest::new(kind, payload);
        if self.requests.send(request).await.is_err() {
            return Reply::Failure;
        }
        reply.await.unwrap_or(Reply::Failure)
    }

    fn prepare_channel(&self) -> (ChannelNumber, PendingChannel, ClientChannel) {
        let number = ChannelNumber(self.next_channel.fetch_add(1, Ordering::Relaxed));
        let (server_io, client_io) = tokio::io::duplex(PIPE_CAPACITY);
        let (request_tx, request_rx) = mpsc::channel(QUEUE_DEPTH);
        let closes = Arc::new(AtomicUsize::new(0));

        let pending = PendingChannel {
            stream: Box::new(server_io),
            requests: request_rx,
            closer: Box::new(RecordingCloser {
                closes: closes.clone(),
            }),
        };
        let client = ClientChannel {
            number,
            stream: Some(client_io),
            requests: Some(request_tx),
            closes,
        };
        (number, pending, client)
    }
}

fn connection_closed() -> OpenRejected {
    OpenRejected {
        reason: RejectReason::ConnectFailed,
        message: "connection closed".to_string(),
    }
}

/// Peer side of an accepted channel.
pub struct ClientChannel {
    number: ChannelNumber,
    stream: Option<DuplexStream>,
    requests: Option<mpsc::Sender<ControlRequest>>,
    closes: Arc<AtomicUsize>,
}

impl ClientChannel {
    pub fn number(&self) -> ChannelNumber {
        self.number
    }

    /// Send a control request and wait for its reply.
    ///
    /// A server that has stopped reading requests answers [`Reply::Failure`].
    pub async fn request(&self, kind: &str, payload: impl Into<Bytes>) -> Reply {
        let Some(requests) = &self.requests else {
            return Reply::Failure;
        };
        let (request, reply) = ControlRequest::new(kind, payload);
        if requests.send(request).await.is_err() {
            return Reply::Failure;
        }
        reply.await.unwrap_or(Reply::Failure)
    }

    /// Stop sending control requests; the server sees the request stream end.
    pub fn finish_requests(&mut self) {
        self.requests = None;
    }

    /// Take the peer's end of the byte stream.
    pub fn take_stream(&mut self) -> Option<DuplexStream> {
        self.stream.take()
    }

    /// How many times the server closed this channel.
    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    /// Whether the server closed this channel.
    pub fn is_closed(&self) -> bool {
        self.close_count() > 0
    }

    /// Wait until the server closes the channel.
    pub async fn closed(&self) {
        while !self.is_closed() {
            tokio::task::yield_now().await;
        }
    }
}

impl fmt::Debug for ClientChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientChannel")
            .field("number", &self.number)
            .field("closes", &self.close_count())
            .finish()
    }
}

/// Counts server-side close calls.
struct RecordingCloser {
    closes: Arc<AtomicUsize>,
}

impl ChannelCloser for RecordingCloser {
    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.closes.fetch_add(1, Ordering::SeqCst);
        })
    }
}
