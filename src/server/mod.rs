//! Server core: connection acceptance, channel negotiation, engine binding.
//!
//! # Data Flow
//! ```text
//! Listener.accept()
//!     → acceptor.rs (handshake per connection, spawn servicer)
//!     → servicer.rs (discard connection requests, spawn negotiator per channel)
//!     → negotiator.rs (channel type policy, subsystem negotiation)
//!     → binding.rs (run the protocol engine, classify, close)
//! ```
//!
//! # Design Decisions
//! - One task per connection, one per channel, one per channel control loop
//! - Shared state is limited to [`ServerContext`], which is immutable
//! - No failure below the acceptor ends the accept loop

pub mod acceptor;
pub mod binding;
pub mod negotiator;
pub mod servicer;

use std::sync::Arc;

use crate::observability::diagnostics::DiagnosticSink;

pub use acceptor::ConnectionAcceptor;
pub use binding::{
    AccessMode, EngineBinding, EngineError, EngineOptions, EngineOutcome, ProtocolEngine,
};
pub use negotiator::{ChannelNegotiator, ChannelState, NegotiationPolicy};
pub use servicer::{ConnectionServicer, ServiceSummary};

/// Everything a connection needs, built once at startup.
#[derive(Debug)]
pub struct ServerContext {
    pub policy: Arc<NegotiationPolicy>,
    pub binding: EngineBinding,
    pub diagnostics: DiagnosticSink,
    /// Per-connection channel limit. `None` leaves channels unbounded.
    pub max_channels: Option<usize>,
}

impl ServerContext {
    pub fn new(
        engine: Arc<dyn ProtocolEngine>,
        mode: AccessMode,
        policy: NegotiationPolicy,
        max_channels: Option<usize>,
        diagnostics: DiagnosticSink,
    ) -> Self {
        Self {
            policy: Arc::new(policy),
            binding: EngineBinding::new(engine, mode, diagnostics.clone()),
            diagnostics,
            max_channels,
        }
    }

    pub fn mode(&self) -> AccessMode {
        self.binding.mode()
    }
}
