//! Shared utilities for integration testing.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::subscriber::DefaultGuard;

use sftp_listener::config::ServerConfig;
use sftp_listener::observability::diagnostics::DiagnosticSink;
use sftp_listener::server::{
    AccessMode, EngineError, EngineOptions, NegotiationPolicy, ProtocolEngine, ServerContext,
};
use sftp_listener::transport::memory::{self, MemoryClient};
use sftp_listener::transport::{
    ByteStream, Connection, CredentialVerifier, HandshakeError, Handshaker, PeerIdentity, Verdict,
};

/// How a [`RecordingEngine`] ends its session.
#[derive(Debug, Clone, Copy)]
pub enum EngineScript {
    /// Read until the client hangs up, then report remote EOF.
    ExitOnEof,
    /// Read until the client hangs up, then report a protocol error.
    FailOnEof,
    /// Return success immediately.
    Succeed,
}

/// Engine that records every session it is asked to run.
pub struct RecordingEngine {
    script: EngineScript,
    starts: AtomicUsize,
    modes: Mutex<Vec<AccessMode>>,
}

impl RecordingEngine {
    pub fn new(script: EngineScript) -> Arc<Self> {
        Arc::new(Self {
            script,
            starts: AtomicUsize::new(0),
            modes: Mutex::new(Vec::new()),
        })
    }

    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn modes(&self) -> Vec<AccessMode> {
        self.modes.lock().unwrap().clone()
    }
}

impl ProtocolEngine for RecordingEngine {
    fn name(&self) -> &'static str {
        "recording"
    }

    fn run(
        &self,
        mut stream: ByteStream,
        options: EngineOptions,
    ) -> BoxFuture<'_, Result<(), EngineError>> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        self.modes.lock().unwrap().push(options.mode);
        let script = self.script;

        Box::pin(async move {
            if let EngineScript::Succeed = script {
                return Ok(());
            }
            let mut buf = Vec::new();
            stream.read_to_end(&mut buf).await?;
            match script {
                EngineScript::FailOnEof => Err(EngineError::Protocol("truncated packet".into())),
                _ => Err(EngineError::RemoteEof),
            }
        })
    }
}

pub fn peer(user: &str) -> PeerIdentity {
    PeerIdentity {
        user: user.to_string(),
        addr: None,
    }
}

pub fn context(
    engine: Arc<RecordingEngine>,
    mode: AccessMode,
    policy: NegotiationPolicy,
    sink: DiagnosticSink,
) -> Arc<ServerContext> {
    Arc::new(ServerContext::new(engine, mode, policy, None, sink))
}

/// Poll `condition` until it holds or a second passes.
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

/// Formatted `tracing` output collected while a capture guard is alive.
#[derive(Clone, Default)]
pub struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

impl CapturedLogs {
    /// Lines logged at `level` whose text contains `needle`.
    pub fn count(&self, level: &str, needle: &str) -> usize {
        let bytes = self.0.lock().unwrap();
        let level = format!(" {level} ");
        String::from_utf8_lossy(&bytes)
            .lines()
            .filter(|line| line.contains(&level) && line.contains(needle))
            .count()
    }
}

impl std::io::Write for CapturedLogs {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Route this thread's events into a buffer until the guard drops.
///
/// Tests using it must run on the default current-thread runtime.
pub fn capture_logs() -> (CapturedLogs, DefaultGuard) {
    let logs = CapturedLogs::default();
    let writer = logs.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(move || writer.clone())
        .with_ansi(false)
        .with_max_level(tracing::Level::DEBUG)
        .finish();
    (logs, tracing::subscriber::set_default(subscriber))
}

/// Test configuration bound to an ephemeral loopback port.
pub fn local_config() -> ServerConfig {
    let mut config = ServerConfig::default();
    config.listener.bind_address = "127.0.0.1:0".to_string();
    config.shutdown.drain_timeout_secs = 1;
    config
}

/// Plain-text stand-in for the SSH handshake.
///
/// The client sends `user:password\n` and gets `OK\n` or `DENIED\n`. On
/// success the connection is served over the in-memory transport and the
/// peer-side driver is handed to the test through `clients`.
pub struct LineHandshaker {
    verifier: Arc<dyn CredentialVerifier>,
    clients: mpsc::UnboundedSender<MemoryClient>,
}

impl LineHandshaker {
    pub fn new(
        verifier: Arc<dyn CredentialVerifier>,
    ) -> (Self, mpsc::UnboundedReceiver<MemoryClient>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { verifier, clients: tx }, rx)
    }

    async fn run(
        &self,
        stream: TcpStream,
        peer_addr: SocketAddr,
    ) -> Result<Connection, HandshakeError> {
        let mut reader = BufReader::new(stream);
        let mut line = String::new();
        if reader.read_line(&mut line).await? == 0 {
            return Err(HandshakeError::Disconnected);
        }

        let (user, password) = line.trim_end().split_once(':').unwrap_or((line.trim_end(), ""));
        let mut stream = reader.into_inner();
        match self.verifier.verify(user, password.as_bytes()) {
            Verdict::Accept => {
                stream.write_all(b"OK\n").await?;
                let (mut connection, client) = memory::connection(peer(user));
                connection.peer.addr = Some(peer_addr);
                let _ = self.clients.send(client);
                Ok(connection)
            }
            Verdict::Reject => {
                stream.write_all(b"DENIED\n").await?;
                Err(HandshakeError::Rejected(user.to_string()))
            }
        }
    }
}

impl Handshaker for LineHandshaker {
    fn handshake(
        &self,
        stream: TcpStream,
        peer_addr: SocketAddr,
    ) -> BoxFuture<'_, Result<Connection, HandshakeError>> {
        Box::pin(self.run(stream, peer_addr))
    }
}

/// Connect and present credentials; returns the server's answer line.
pub async fn login(addr: SocketAddr, user: &str, password: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(format!("{}:{}\n", user, password).as_bytes())
        .await
        .unwrap();
    let mut answer = String::new();
    BufReader::new(stream).read_line(&mut answer).await.unwrap();
    answer.trim_end().to_string()
}
