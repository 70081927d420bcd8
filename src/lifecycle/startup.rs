//! Startup orchestration.
//!
//! # Responsibilities
//! - Build every component from a validated [`ServerConfig`]
//! - Load the host key and bind the listener
//! - Start the metrics exporter when enabled
//!
//! # Design Decisions
//! - Fail fast: any startup error is fatal
//! - Subsystems initialize in order, not concurrently
//! - The listener binds last, so traffic only arrives once everything is ready

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;

use crate::config::schema::DEMO_USER;
use crate::config::ServerConfig;
use crate::net::connection::ConnectionTracker;
use crate::net::listener::{Listener, ListenerError};
use crate::observability::diagnostics::DiagnosticSink;
use crate::observability::metrics;
use crate::server::{
    AccessMode, ConnectionAcceptor, NegotiationPolicy, ProtocolEngine, ServerContext,
};
use crate::sftp::SftpEngine;
use crate::transport::ssh::{self, SshError, SshHandshaker};
use crate::transport::{Handshaker, StaticCredentials};

/// Error type for startup.
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("sftp root {0} is not a directory")]
    Root(String),
    #[error(transparent)]
    HostKey(#[from] SshError),
    #[error(transparent)]
    Listener(#[from] ListenerError),
}

/// A fully built server, bound and ready to accept.
pub struct Server {
    acceptor: ConnectionAcceptor,
    tracker: ConnectionTracker,
    drain_timeout: Duration,
}

impl Server {
    /// Build the production server: SSH transport and filesystem SFTP engine.
    pub async fn build(config: &ServerConfig) -> Result<Self, StartupError> {
        if !Path::new(&config.sftp.root).is_dir() {
            return Err(StartupError::Root(config.sftp.root.clone()));
        }

        let host_key = ssh::load_host_key(Path::new(&config.ssh.host_key_path))?;
        tracing::info!(path = %config.ssh.host_key_path, "Host key loaded");

        if config.auth.uses_demo_account() {
            tracing::warn!(
                user = DEMO_USER,
                "Demonstration account enabled; configure auth.users before exposing this server"
            );
        }
        let credentials = StaticCredentials::new(&config.auth.users);
        let handshaker = SshHandshaker::new(
            ssh::server_config(&config.ssh, host_key),
            Arc::new(credentials),
            Duration::from_secs(config.ssh.handshake_timeout_secs),
        );

        let engine = SftpEngine::new(&config.sftp.root);
        let diagnostics = DiagnosticSink::from_flag(config.observability.debug_stderr);

        Self::assemble(config, Arc::new(handshaker), Arc::new(engine), diagnostics).await
    }

    /// Build around a caller-supplied transport and engine.
    pub async fn assemble(
        config: &ServerConfig,
        handshaker: Arc<dyn Handshaker>,
        engine: Arc<dyn ProtocolEngine>,
        diagnostics: DiagnosticSink,
    ) -> Result<Self, StartupError> {
        let context = ServerContext::new(
            engine,
            AccessMode::from_read_only(config.sftp.read_only),
            NegotiationPolicy::with_prefix(config.sftp.subsystem_prefix),
            config.listener.max_channels_per_connection,
            diagnostics,
        );

        let listener = Listener::bind(&config.listener).await?;

        if config.observability.metrics_enabled {
            match config.observability.metrics_address.parse::<SocketAddr>() {
                Ok(addr) => metrics::init_metrics(addr),
                Err(e) => tracing::error!(
                    metrics_address = %config.observability.metrics_address,
                    error = %e,
                    "Failed to parse metrics address"
                ),
            }
        }

        let tracker = ConnectionTracker::new();
        let acceptor =
            ConnectionAcceptor::new(listener, handshaker, Arc::new(context), tracker.clone());
        Ok(Self {
            acceptor,
            tracker,
            drain_timeout: Duration::from_secs(config.shutdown.drain_timeout_secs),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.acceptor.local_addr()
    }

    pub fn tracker(&self) -> ConnectionTracker {
        self.tracker.clone()
    }

    /// Accept until shutdown, then give live connections the drain timeout to finish.
    pub async fn run(self, shutdown: broadcast::Receiver<()>) {
        let Server {
            acceptor,
            tracker,
            drain_timeout,
        } = self;

        acceptor.run(shutdown).await;

        tracing::info!(active_connections = tracker.active_count(), "Draining connections");
        if !tracker.wait_for_drain_timeout(drain_timeout).await {
            tracing::warn!(
                remaining = tracker.active_count(),
                timeout_secs = drain_timeout.as_secs(),
                "Drain timeout expired; closing remaining connections"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_root_fails_before_anything_binds() {
        let mut config = ServerConfig::default();
        config.sftp.root = "/definitely/not/a/dir".to_string();
        assert!(matches!(Server::build(&config).await, Err(StartupError::Root(_))));
    }

    #[tokio::test]
    async fn missing_host_key_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = ServerConfig::default();
        config.sftp.root = dir.path().display().to_string();
        config.ssh.host_key_path = dir.path().join("no_key").display().to_string();
        assert!(matches!(Server::build(&config).await, Err(StartupError::HostKey(_))));
    }
}
