//! SFTP subsystem listener library.

pub mod config;
pub mod lifecycle;
pub mod net;
pub mod observability;
pub mod server;
pub mod sftp;
pub mod transport;

pub use config::schema::ServerConfig;
pub use lifecycle::{Server, Shutdown};
pub use observability::diagnostics::DiagnosticSink;
