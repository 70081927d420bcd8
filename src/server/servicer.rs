//! Per-connection servicing.
//!
//! # Responsibilities
//! - Drain connection-level requests, answering each with failure
//! - Spawn one negotiator task per channel-open request
//! - Optionally bound the number of live channels on a connection

use std::sync::Arc;

use tokio::sync::{mpsc, Semaphore};
use tokio::task::{JoinError, JoinSet};

use crate::observability::metrics;
use crate::transport::{Connection, ControlRequest, PeerIdentity, RejectReason, Reply};

use super::negotiator::{ChannelNegotiator, ChannelState};
use super::ServerContext;

/// Totals for one serviced connection.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ServiceSummary {
    pub channels: usize,
    pub refused: usize,
}

/// Services every channel of one connection.
pub struct ConnectionServicer {
    context: Arc<ServerContext>,
}

impl ConnectionServicer {
    pub fn new(context: Arc<ServerContext>) -> Self {
        Self { context }
    }

    /// Run until the connection stops producing channel opens and every
    /// spawned negotiator has finished.
    pub async fn run(self, connection: Connection) -> ServiceSummary {
        let Connection {
            peer,
            mut channel_opens,
            requests,
        } = connection;

        let discard = tokio::spawn(discard_requests(peer.clone(), requests));
        let limit = self
            .context
            .max_channels
            .map(|max| Arc::new(Semaphore::new(max)));
        let negotiator = ChannelNegotiator::new(
            peer.clone(),
            self.context.policy.clone(),
            self.context.binding.clone(),
            self.context.diagnostics.clone(),
        );

        let mut summary = ServiceSummary::default();
        let mut channels = JoinSet::new();

        while let Some(open) = channel_opens.recv().await {
            let permit = match &limit {
                Some(limit) => match limit.clone().try_acquire_owned() {
                    Ok(permit) => Some(permit),
                    Err(_) => {
                        tracing::warn!(
                            peer = %peer,
                            channel = %open.number(),
                            "Channel limit reached"
                        );
                        metrics::record_channel_rejected("resource_shortage");
                        open.reject(RejectReason::ResourceShortage, "too many channels");
                        summary.refused += 1;
                        continue;
                    }
                },
                None => None,
            };

            summary.channels += 1;
            let negotiator = negotiator.clone();
            channels.spawn(async move {
                let state = negotiator.run(open).await;
                drop(permit);
                state
            });

            // Reap finished negotiators so the set stays small on long connections.
            while let Some(joined) = channels.try_join_next() {
                report_join(&peer, joined);
            }
        }

        while let Some(joined) = channels.join_next().await {
            report_join(&peer, joined);
        }
        discard.abort();

        summary
    }
}

fn report_join(peer: &PeerIdentity, joined: Result<ChannelState, JoinError>) {
    if let Err(e) = joined {
        tracing::error!(peer = %peer, error = %e, "Channel task failed");
    }
}

/// Connection-level requests carry nothing this server acts on.
async fn discard_requests(peer: PeerIdentity, mut requests: mpsc::Receiver<ControlRequest>) {
    while let Some(request) = requests.recv().await {
        tracing::trace!(peer = %peer, kind = request.kind(), "Discarding connection request");
        metrics::record_global_request();
        request.reply(Reply::Failure);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observability::diagnostics::DiagnosticSink;
    use crate::observability::logging::capture::capture_logs;
    use crate::server::binding::{AccessMode, EngineError, EngineOptions, ProtocolEngine};
    use crate::server::negotiator::NegotiationPolicy;
    use crate::transport::{encode_string, memory, ByteStream};
    use bytes::Bytes;
    use futures_util::future::BoxFuture;
    use tokio::io::AsyncReadExt;

    struct DrainEngine;

    impl ProtocolEngine for DrainEngine {
        fn name(&self) -> &'static str {
            "drain"
        }

        fn run(
            &self,
            mut stream: ByteStream,
            _options: EngineOptions,
        ) -> BoxFuture<'_, Result<(), EngineError>> {
            Box::pin(async move {
                let mut buf = Vec::new();
                stream.read_to_end(&mut buf).await?;
                Err(EngineError::RemoteEof)
            })
        }
    }

    struct PanickingEngine;

    impl ProtocolEngine for PanickingEngine {
        fn name(&self) -> &'static str {
            "panicking"
        }

        fn run(
            &self,
            _stream: ByteStream,
            _options: EngineOptions,
        ) -> BoxFuture<'_, Result<(), EngineError>> {
            Box::pin(async move { panic!("engine bug") })
        }
    }

    fn context(max_channels: Option<usize>) -> Arc<ServerContext> {
        context_with(Arc::new(DrainEngine), max_channels)
    }

    fn context_with(
        engine: Arc<dyn ProtocolEngine>,
        max_channels: Option<usize>,
    ) -> Arc<ServerContext> {
        Arc::new(ServerContext::new(
            engine,
            AccessMode::ReadWrite,
            NegotiationPolicy::default(),
            max_channels,
            DiagnosticSink::discard(),
        ))
    }

    fn peer() -> PeerIdentity {
        PeerIdentity {
            user: "testuser".into(),
            addr: None,
        }
    }

    #[tokio::test]
    async fn connection_requests_are_refused() {
        let (conn, client) = memory::connection(peer());
        let servicer = tokio::spawn(ConnectionServicer::new(context(None)).run(conn));

        let forward = client.global_request("tcpip-forward", Bytes::new()).await;
        assert_eq!(forward, Reply::Failure);
        let keepalive = client.global_request("keepalive@openssh.com", Bytes::new()).await;
        assert_eq!(keepalive, Reply::Failure);

        drop(client);
        assert_eq!(servicer.await.unwrap(), ServiceSummary::default());
    }

    #[tokio::test]
    async fn channel_limit_refuses_excess_opens() {
        let (conn, client) = memory::connection(peer());
        let servicer = tokio::spawn(ConnectionServicer::new(context(Some(1))).run(conn));

        let mut first = client.open_channel("session").await.unwrap();
        let err = client.open_channel("session").await.unwrap_err();
        assert_eq!(err.reason, RejectReason::ResourceShortage);

        // Finishing the first channel frees its slot.
        first.finish_requests();
        first.closed().await;
        tokio::task::yield_now().await;
        let mut third = loop {
            match client.open_channel("session").await {
                Ok(channel) => break channel,
                Err(_) => tokio::task::yield_now().await,
            }
        };
        assert!(third.request("subsystem", encode_string(b"sftp")).await.is_success());
        drop(third.take_stream());
        third.closed().await;

        drop(client);
        let summary = servicer.await.unwrap();
        assert_eq!(summary.channels, 2);
        assert!(summary.refused >= 1);
    }

    #[tokio::test]
    async fn panicked_channel_task_is_logged_once() {
        let (logs, _guard) = capture_logs();
        let (conn, client) = memory::connection(peer());
        let servicer = tokio::spawn(
            ConnectionServicer::new(context_with(Arc::new(PanickingEngine), None)).run(conn),
        );

        let crashed = client.open_channel("session").await.unwrap();
        assert!(crashed.request("subsystem", encode_string(b"sftp")).await.is_success());
        crashed.closed().await;

        // The next open reaps the crashed task while the connection is still live.
        let mut idle = client.open_channel("session").await.unwrap();
        idle.finish_requests();
        idle.closed().await;

        drop(client);
        let summary = servicer.await.unwrap();
        assert_eq!(summary.channels, 2);
        assert_eq!(logs.count("ERROR", "Channel task failed"), 1);
    }
}
