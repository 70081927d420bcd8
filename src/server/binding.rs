//! Protocol engine binding.
//!
//! # Responsibilities
//! - Hand a negotiated channel's byte stream to the protocol engine
//! - Classify the engine's terminal result
//! - Close the channel exactly once on every exit path
//!
//! # Design Decisions
//! - The engine is a trait object; the binding never looks inside it
//! - Only three terminal signals matter: remote EOF, error, success
//! - [`EngineSession`] owns the channel closer; closing is idempotent and a
//!   dropped session still schedules the close

use std::fmt;
use std::sync::Arc;

use futures_util::future::BoxFuture;

use crate::observability::diagnostics::DiagnosticSink;
use crate::observability::metrics;
use crate::transport::{ByteStream, ChannelCloser, ChannelNumber, PeerIdentity};

use super::negotiator::ChannelState;

/// Whether the engine may modify anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    ReadOnly,
    ReadWrite,
}

impl AccessMode {
    pub fn from_read_only(read_only: bool) -> Self {
        if read_only {
            AccessMode::ReadOnly
        } else {
            AccessMode::ReadWrite
        }
    }

    pub fn is_read_only(self) -> bool {
        self == AccessMode::ReadOnly
    }
}

impl fmt::Display for AccessMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccessMode::ReadOnly => write!(f, "read-only"),
            AccessMode::ReadWrite => write!(f, "read-write"),
        }
    }
}

/// Settings an engine instance is constructed with.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub mode: AccessMode,
    pub diagnostics: DiagnosticSink,
}

/// Terminal failure reported by an engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The peer closed its side of the stream.
    #[error("remote end closed the stream")]
    RemoteEof,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// A file-transfer protocol implementation.
pub trait ProtocolEngine: Send + Sync + 'static {
    /// Name logged with engine events.
    fn name(&self) -> &'static str;

    /// Serve `stream` until the engine finishes or the stream ends.
    fn run(
        &self,
        stream: ByteStream,
        options: EngineOptions,
    ) -> BoxFuture<'_, Result<(), EngineError>>;
}

/// How an engine session ended.
#[derive(Debug)]
pub enum EngineOutcome {
    /// The client closed the stream.
    RemoteExit,
    /// The engine failed.
    Failed(EngineError),
    /// The engine finished on its own.
    Completed,
}

impl EngineOutcome {
    pub fn classify(result: Result<(), EngineError>) -> Self {
        match result {
            Ok(()) => EngineOutcome::Completed,
            Err(EngineError::RemoteEof) => EngineOutcome::RemoteExit,
            Err(err) => EngineOutcome::Failed(err),
        }
    }

    /// Channel state after this outcome.
    pub fn terminal_state(&self) -> ChannelState {
        match self {
            EngineOutcome::RemoteExit | EngineOutcome::Completed => ChannelState::Closed,
            EngineOutcome::Failed(_) => ChannelState::Failed,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            EngineOutcome::RemoteExit => "remote_exit",
            EngineOutcome::Failed(_) => "error",
            EngineOutcome::Completed => "completed",
        }
    }
}

/// Owns the channel closer for the lifetime of one engine run.
pub struct EngineSession {
    closer: Option<Box<dyn ChannelCloser>>,
}

impl EngineSession {
    pub fn new(closer: Box<dyn ChannelCloser>) -> Self {
        Self {
            closer: Some(closer),
        }
    }

    /// Close the channel. Later calls do nothing.
    pub async fn close(&mut self) {
        if let Some(closer) = self.closer.take() {
            closer.close().await;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closer.is_none()
    }
}

impl Drop for EngineSession {
    fn drop(&mut self) {
        if let Some(closer) = self.closer.take() {
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                runtime.spawn(async move { closer.close().await });
            }
        }
    }
}

/// Binds negotiated channels to the protocol engine.
#[derive(Clone)]
pub struct EngineBinding {
    engine: Arc<dyn ProtocolEngine>,
    mode: AccessMode,
    diagnostics: DiagnosticSink,
}

impl EngineBinding {
    pub fn new(
        engine: Arc<dyn ProtocolEngine>,
        mode: AccessMode,
        diagnostics: DiagnosticSink,
    ) -> Self {
        Self {
            engine,
            mode,
            diagnostics,
        }
    }

    pub fn mode(&self) -> AccessMode {
        self.mode
    }

    /// Run the engine on `stream` to completion, then close the channel.
    pub async fn run(
        &self,
        peer: &PeerIdentity,
        channel: ChannelNumber,
        stream: ByteStream,
        closer: Box<dyn ChannelCloser>,
    ) -> EngineOutcome {
        let mut session = EngineSession::new(closer);
        let options = EngineOptions {
            mode: self.mode,
            diagnostics: self.diagnostics.clone(),
        };

        match self.mode {
            AccessMode::ReadOnly => self.diagnostics.emit("Read-only server"),
            AccessMode::ReadWrite => self.diagnostics.emit("Read write server"),
        }
        tracing::debug!(
            peer = %peer,
            channel = %channel,
            engine = self.engine.name(),
            mode = %self.mode,
            "Engine session started"
        );

        metrics::record_engine_started();
        let outcome = EngineOutcome::classify(self.engine.run(stream, options).await);
        metrics::record_engine_finished(outcome.label());

        match &outcome {
            EngineOutcome::RemoteExit => {
                tracing::info!(
                    peer = %peer,
                    channel = %channel,
                    "{} client exited session",
                    self.engine.name()
                );
            }
            EngineOutcome::Failed(err) => {
                tracing::error!(
                    peer = %peer,
                    channel = %channel,
                    error = %err,
                    "{} server completed with error",
                    self.engine.name()
                );
            }
            EngineOutcome::Completed => {
                tracing::debug!(peer = %peer, channel = %channel, "Engine session completed");
            }
        }

        session.close().await;
        outcome
    }
}

impl fmt::Debug for EngineBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineBinding")
            .field("engine", &self.engine.name())
            .field("mode", &self.mode)
            .finish()
    }
}
