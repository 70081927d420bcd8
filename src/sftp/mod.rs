//! SFTP protocol engine.
//!
//! # Data Flow
//! ```text
//! negotiated channel ByteStream
//!     → TrackedStream (records how the stream ended)
//!     → russh_sftp::server::run (packet loop, spawned)
//!     → FsHandler (filesystem operations under the served root)
//! ```
//!
//! # Design Decisions
//! - russh-sftp drives its loop in a detached task and only stops on EOF,
//!   so the engine learns the outcome from the stream wrapper's drop
//! - A read error is recorded and then reported to the loop as EOF

pub mod fs;

use std::io;
use std::path::PathBuf;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures_util::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::oneshot;

use crate::server::{EngineError, EngineOptions, ProtocolEngine};
use crate::transport::ByteStream;

pub use fs::FsHandler;

/// How the byte stream under the engine ended.
#[derive(Debug)]
enum Termination {
    Eof,
    Failed(io::Error),
}

/// SFTP engine serving a directory tree.
#[derive(Debug, Clone)]
pub struct SftpEngine {
    root: PathBuf,
}

impl SftpEngine {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl ProtocolEngine for SftpEngine {
    fn name(&self) -> &'static str {
        "sftp"
    }

    fn run(
        &self,
        stream: ByteStream,
        options: EngineOptions,
    ) -> BoxFuture<'_, Result<(), EngineError>> {
        Box::pin(async move {
            let (done_tx, done_rx) = oneshot::channel();
            let handler = FsHandler::new(self.root.clone(), options.mode, options.diagnostics);
            russh_sftp::server::run(TrackedStream::new(stream, done_tx), handler).await;

            match done_rx.await {
                Ok(Some(Termination::Eof)) => Err(EngineError::RemoteEof),
                Ok(Some(Termination::Failed(e))) => Err(EngineError::Io(e)),
                Ok(None) | Err(_) => Ok(()),
            }
        })
    }
}

/// Byte stream that remembers its first terminal event and reports it on drop.
struct TrackedStream {
    inner: ByteStream,
    ended: Option<Termination>,
    done: Option<oneshot::Sender<Option<Termination>>>,
}

impl TrackedStream {
    fn new(inner: ByteStream, done: oneshot::Sender<Option<Termination>>) -> Self {
        Self {
            inner,
            ended: None,
            done: Some(done),
        }
    }

    fn record(&mut self, termination: Termination) {
        if self.ended.is_none() {
            self.ended = Some(termination);
        }
    }
}

impl AsyncRead for TrackedStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.ended.is_some() {
            return Poll::Ready(Ok(()));
        }

        let before = buf.filled().len();
        match Pin::new(&mut self.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                if buf.remaining() > 0 && buf.filled().len() == before {
                    self.record(Termination::Eof);
                }
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Err(e)) => {
                self.record(Termination::Failed(e));
                Poll::Ready(Ok(()))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl AsyncWrite for TrackedStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let result = Pin::new(&mut self.inner).poll_write(cx, buf);
        if let Poll::Ready(Err(e)) = &result {
            self.record(Termination::Failed(io::Error::new(e.kind(), e.to_string())));
        }
        result
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

impl Drop for TrackedStream {
    fn drop(&mut self) {
        if let Some(done) = self.done.take() {
            let _ = done.send(self.ended.take());
        }
    }
}
