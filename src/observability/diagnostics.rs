//! Diagnostic sink for protocol-level trace output.
//!
//! # Responsibilities
//! - Carry the debug trace destination into every component that needs it
//! - Serialize writes so concurrent tasks never interleave a line
//! - Offer an in-memory target so tests can assert on emitted lines
//!
//! # Design Decisions
//! - Passed explicitly into constructors; there is no process-wide sink
//! - One `emit` call is one line, written under a single lock acquisition
//! - Operator-facing events go through `tracing`; this sink only carries
//!   the verbose negotiation and engine trace
//! - Writes are blocking and happen under a std `Mutex` on the calling
//!   worker thread, so the sink is meant for low-volume trace output only

use std::fmt;
use std::io::Write;
use std::sync::{Arc, Mutex};

enum Target {
    Discard,
    Writer(Mutex<Box<dyn Write + Send>>),
    Memory(Mutex<Vec<String>>),
}

/// Cloneable handle to a diagnostic destination.
#[derive(Clone)]
pub struct DiagnosticSink {
    target: Arc<Target>,
}

impl DiagnosticSink {
    /// A sink that drops everything.
    pub fn discard() -> Self {
        Self {
            target: Arc::new(Target::Discard),
        }
    }

    /// A sink that writes to standard error.
    pub fn stderr() -> Self {
        Self::from_writer(std::io::stderr())
    }

    /// A sink over an arbitrary writer.
    pub fn from_writer<W: Write + Send + 'static>(writer: W) -> Self {
        Self {
            target: Arc::new(Target::Writer(Mutex::new(Box::new(writer)))),
        }
    }

    /// A sink that keeps lines in memory, readable through [`DiagnosticSink::lines`].
    pub fn memory() -> Self {
        Self {
            target: Arc::new(Target::Memory(Mutex::new(Vec::new()))),
        }
    }

    /// Pick the destination from the `debug_stderr` switch.
    pub fn from_flag(debug_stderr: bool) -> Self {
        if debug_stderr {
            Self::stderr()
        } else {
            Self::discard()
        }
    }

    /// Whether emitted lines go anywhere.
    pub fn is_enabled(&self) -> bool {
        !matches!(*self.target, Target::Discard)
    }

    /// Write one line.
    pub fn emit(&self, line: impl fmt::Display) {
        match &*self.target {
            Target::Discard => {}
            Target::Writer(writer) => {
                let mut writer = match writer.lock() {
                    Ok(guard) => guard,
                    Err(poisoned) => poisoned.into_inner(),
                };
                // A failing diagnostic destination must not affect the session.
                let _ = writeln!(writer, "{}", line);
                let _ = writer.flush();
            }
            Target::Memory(lines) => {
                let mut lines = match lines.lock() {
                    Ok(guard) => guard,
                    Err(poisoned) => poisoned.into_inner(),
                };
                lines.push(line.to_string());
            }
        }
    }

    /// Lines captured by a memory sink. Empty for other targets.
    pub fn lines(&self) -> Vec<String> {
        match &*self.target {
            Target::Memory(lines) => match lines.lock() {
                Ok(guard) => guard.clone(),
                Err(poisoned) => poisoned.into_inner().clone(),
            },
            _ => Vec::new(),
        }
    }

    /// True if any captured line contains `needle`.
    pub fn contains(&self, needle: &str) -> bool {
        self.lines().iter().any(|line| line.contains(needle))
    }
}

impl fmt::Debug for DiagnosticSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match &*self.target {
            Target::Discard => "discard",
            Target::Writer(_) => "writer",
            Target::Memory(_) => "memory",
        };
        f.debug_struct("DiagnosticSink").field("target", &kind).finish()
    }
}

impl Default for DiagnosticSink {
    fn default() -> Self {
        Self::discard()
    }
}
