//! Top-level accept loop.
//!
//! # Responsibilities
//! - Accept TCP connections within the listener's connection limit
//! - Run the transport handshake for each, concurrently
//! - Spawn a [`ConnectionServicer`] for every authenticated connection
//! - Stop accepting when shutdown is signalled
//!
//! # Design Decisions
//! - A failed accept or handshake is logged and the loop continues
//! - Handshakes run in the connection's task so a slow client never
//!   holds up the next accept

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::broadcast;

use crate::net::connection::ConnectionTracker;
use crate::net::listener::{ConnectionPermit, Listener, ListenerError};
use crate::observability::metrics;
use crate::transport::Handshaker;

use super::servicer::ConnectionServicer;
use super::ServerContext;

/// Pause after an accept error, e.g. when the process is out of descriptors.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

pub struct ConnectionAcceptor {
    listener: Listener,
    handshaker: Arc<dyn Handshaker>,
    context: Arc<ServerContext>,
    tracker: ConnectionTracker,
}

impl ConnectionAcceptor {
    pub fn new(
        listener: Listener,
        handshaker: Arc<dyn Handshaker>,
        context: Arc<ServerContext>,
        tracker: ConnectionTracker,
    ) -> Self {
        Self {
            listener,
            handshaker,
            context,
            tracker,
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept until `shutdown` fires. Connections already running keep going;
    /// use the tracker to wait for them.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        tracing::info!(
            mode = %self.context.mode(),
            max_connections = self.listener.max_connections(),
            "Accepting connections"
        );

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!("Acceptor stopping");
                    break;
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer_addr, permit)) => {
                        self.spawn_connection(stream, peer_addr, permit)
                    }
                    Err(ListenerError::Closed) => break,
                    Err(e) => {
                        tracing::warn!(error = %e, "Accept failed");
                        tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    }
                },
            }
        }
    }

    fn spawn_connection(&self, stream: TcpStream, peer_addr: SocketAddr, permit: ConnectionPermit) {
        let guard = self.tracker.track();
        let handshaker = self.handshaker.clone();
        let context = self.context.clone();

        tokio::spawn(async move {
            metrics::record_connection_accepted();
            tracing::debug!(
                connection_id = %guard.id(),
                peer_addr = %peer_addr,
                "Starting handshake"
            );

            match handshaker.handshake(stream, peer_addr).await {
                Ok(connection) => {
                    tracing::info!(
                        connection_id = %guard.id(),
                        peer = %connection.peer,
                        "SSH server established"
                    );
                    metrics::record_session_established();

                    let summary = ConnectionServicer::new(context).run(connection).await;
                    tracing::debug!(
                        connection_id = %guard.id(),
                        channels = summary.channels,
                        refused = summary.refused,
                        "Connection finished"
                    );
                }
                Err(e) => {
                    tracing::warn!(
                        connection_id = %guard.id(),
                        peer_addr = %peer_addr,
                        error = %e,
                        "Handshake failed"
                    );
                    metrics::record_handshake_failure(e.kind());
                }
            }

            metrics::record_connection_closed();
            drop(permit);
            drop(guard);
        });
    }
}
