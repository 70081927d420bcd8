//! Per-channel negotiation state machine.
//!
//! # Data Flow
//! ```text
//! Pending ──type mismatch──▶ Rejected
//!    │ ──accept error──────▶ Failed
//!    ▼
//!  Open  (control loop: one reply per request, in arrival order)
//!    │ ──request stream ends──▶ Closed
//!    ▼ subsystem "sftp" accepted
//!  Bound (engine runs to completion)
//!    ├── remote EOF / success ──▶ Closed
//!    └── other error ───────────▶ Failed
//! ```
//!
//! # Design Decisions
//! - The control loop runs in its own task and keeps answering while the
//!   engine runs; once bound, further subsystem requests are refused
//! - The loop signals the binding through a oneshot after it has replied,
//!   so the peer always sees success before engine traffic
//! - When the engine finishes the loop is aborted; any request it still
//!   held is answered with failure by [`ControlRequest`]'s drop

use std::fmt;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};

use crate::config::SubsystemPrefix;
use crate::observability::diagnostics::DiagnosticSink;
use crate::observability::metrics;
use crate::transport::{
    AcceptedChannel, ChannelOpen, ControlRequest, PeerIdentity, RejectReason, Reply,
};

use super::binding::EngineBinding;

/// Request type that selects a subsystem.
pub const SUBSYSTEM_REQUEST: &str = "subsystem";

/// Negotiation progress of one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Pending,
    Open,
    Bound,
    Rejected,
    Failed,
    Closed,
}

impl ChannelState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ChannelState::Rejected | ChannelState::Failed | ChannelState::Closed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ChannelState::Pending => "pending",
            ChannelState::Open => "open",
            ChannelState::Bound => "bound",
            ChannelState::Rejected => "rejected",
            ChannelState::Failed => "failed",
            ChannelState::Closed => "closed",
        }
    }
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a channel must look like to reach the engine.
#[derive(Debug, Clone)]
pub struct NegotiationPolicy {
    pub channel_type: String,
    pub subsystem: String,
    pub prefix: SubsystemPrefix,
}

impl Default for NegotiationPolicy {
    fn default() -> Self {
        Self {
            channel_type: "session".to_string(),
            subsystem: "sftp".to_string(),
            prefix: SubsystemPrefix::Strict,
        }
    }
}

impl NegotiationPolicy {
    pub fn with_prefix(prefix: SubsystemPrefix) -> Self {
        Self {
            prefix,
            ..Self::default()
        }
    }

    pub fn accepts_channel_type(&self, channel_type: &str) -> bool {
        channel_type == self.channel_type
    }

    /// Decide one control request. Emits the trace lines for it.
    pub fn evaluate(&self, request: &ControlRequest, diagnostics: &DiagnosticSink) -> bool {
        if request.kind() != SUBSYSTEM_REQUEST {
            return false;
        }

        let accepted = match decode_subsystem_name(request.payload(), self.prefix) {
            Some(name) => {
                diagnostics.emit(format_args!("Subsystem: {}", String::from_utf8_lossy(name)));
                name == self.subsystem.as_bytes()
            }
            None => {
                diagnostics.emit(format_args!(
                    "Subsystem: malformed payload ({} bytes)",
                    request.payload().len()
                ));
                false
            }
        };
        diagnostics.emit(format_args!(" - accepted: {}", accepted));
        metrics::record_subsystem_request(accepted);
        accepted
    }
}

/// Extract the subsystem name from a `uint32 length ++ name` payload.
///
/// Payloads shorter than the prefix never decode. Under
/// [`SubsystemPrefix::Strict`] the prefix must equal the number of
/// remaining bytes; under [`SubsystemPrefix::Permissive`] it is skipped.
pub fn decode_subsystem_name(payload: &[u8], prefix: SubsystemPrefix) -> Option<&[u8]> {
    let (len, name) = payload.split_first_chunk::<4>()?;
    match prefix {
        SubsystemPrefix::Permissive => Some(name),
        SubsystemPrefix::Strict => {
            let declared = u32::from_be_bytes(*len) as usize;
            (declared == name.len()).then_some(name)
        }
    }
}

/// Drives one channel from open request to terminal state.
#[derive(Debug, Clone)]
pub struct ChannelNegotiator {
    peer: PeerIdentity,
    policy: Arc<NegotiationPolicy>,
    binding: EngineBinding,
    diagnostics: DiagnosticSink,
}

impl ChannelNegotiator {
    pub fn new(
        peer: PeerIdentity,
        policy: Arc<NegotiationPolicy>,
        binding: EngineBinding,
        diagnostics: DiagnosticSink,
    ) -> Self {
        Self {
            peer,
            policy,
            binding,
            diagnostics,
        }
    }

    /// Negotiate `open` and, if it binds, run the engine. Returns the terminal state.
    pub async fn run(&self, open: ChannelOpen) -> ChannelState {
        let number = open.number();
        let state = self.negotiate(open).await;
        tracing::debug!(peer = %self.peer, channel = %number, state = %state, "Channel finished");
        metrics::record_channel_finished(state.as_str());
        state
    }

    async fn negotiate(&self, open: ChannelOpen) -> ChannelState {
        self.diagnostics.emit(format_args!("Incoming channel: {}", open.channel_type()));

        if !self.policy.accepts_channel_type(open.channel_type()) {
            self.diagnostics
                .emit(format_args!("Unknown channel type: {}", open.channel_type()));
            metrics::record_channel_rejected("unknown_channel_type");
            open.reject(RejectReason::UnknownChannelType, "unknown channel type");
            return ChannelState::Rejected;
        }

        let channel = match open.accept() {
            Ok(channel) => channel,
            Err(e) => {
                tracing::warn!(peer = %self.peer, error = %e, "could not accept channel");
                return ChannelState::Failed;
            }
        };
        self.diagnostics.emit("Channel accepted");

        self.serve(channel).await
    }

    async fn serve(&self, channel: AcceptedChannel) -> ChannelState {
        let AcceptedChannel {
            number,
            stream,
            requests,
            closer,
        } = channel;

        let (bound_tx, bound_rx) = oneshot::channel();
        let control = tokio::spawn(control_loop(
            requests,
            self.policy.clone(),
            self.diagnostics.clone(),
            bound_tx,
        ));

        if bound_rx.await.is_err() {
            // Request stream ended without a binding.
            closer.close().await;
            return ChannelState::Closed;
        }

        tracing::debug!(
            peer = %self.peer,
            channel = %number,
            subsystem = %self.policy.subsystem,
            "Subsystem bound"
        );
        let outcome = self.binding.run(&self.peer, number, stream, closer).await;
        control.abort();
        outcome.terminal_state()
    }
}

/// Answer control requests strictly in order until the stream ends.
async fn control_loop(
    mut requests: mpsc::Receiver<ControlRequest>,
    policy: Arc<NegotiationPolicy>,
    diagnostics: DiagnosticSink,
    bound: oneshot::Sender<()>,
) {
    let mut bound = Some(bound);

    while let Some(request) = requests.recv().await {
        diagnostics.emit(format_args!("Request: {}", request.kind()));

        let accepted = bound.is_some() && policy.evaluate(&request, &diagnostics);
        if accepted {
            request.reply(Reply::success());
            if let Some(tx) = bound.take() {
                let _ = tx.send(());
            }
        } else {
            request.reply(Reply::Failure);
        }
    }
}
