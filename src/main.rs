//! SFTP subsystem listener.
//!
//! Accepts SSH connections, authenticates them against a configured user
//! table, and serves the `sftp` subsystem on `session` channels.
//!
//! # Architecture Overview
//!
//! ```text
//!   TCP client
//!   ─────────────▶ net::listener ──▶ transport::ssh (handshake, auth)
//!                                          │
//!                                          ▼
//!                               server::acceptor ──▶ server::servicer
//!                                                          │ one task per channel
//!                                                          ▼
//!                                                  server::negotiator
//!                                                          │ "subsystem sftp"
//!                                                          ▼
//!                                                  server::binding ──▶ sftp engine
//! ```

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use sftp_listener::config::{self, ServerConfig};
use sftp_listener::lifecycle::{wait_for_signal, Server, Shutdown};
use sftp_listener::observability::logging;

#[derive(Parser, Debug)]
#[command(name = "sftp-listener")]
#[command(about = "SSH listener serving the sftp subsystem", long_about = None)]
struct Cli {
    /// Serve read-only; every mutating request is refused
    #[arg(short = 'R', long)]
    read_only: bool,

    /// Write the negotiation and engine trace to stderr
    #[arg(short = 'e', long)]
    debug_stderr: bool,

    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen address, overrides listener.bind_address
    #[arg(short, long)]
    listen: Option<String>,

    /// Host private key, overrides ssh.host_key_path
    #[arg(short = 'k', long)]
    host_key: Option<String>,

    /// Directory to serve, overrides sftp.root
    #[arg(long)]
    root: Option<String>,
}

impl Cli {
    fn apply(&self, config: &mut ServerConfig) {
        if self.read_only {
            config.sftp.read_only = true;
        }
        if self.debug_stderr {
            config.observability.debug_stderr = true;
        }
        if let Some(listen) = &self.listen {
            config.listener.bind_address = listen.clone();
        }
        if let Some(host_key) = &self.host_key {
            config.ssh.host_key_path = host_key.clone();
        }
        if let Some(root) = &self.root {
            config.sftp.root = root.clone();
        }
    }
}

fn load(cli: &Cli) -> Result<ServerConfig, config::ConfigError> {
    let mut config = match &cli.config {
        Some(path) => config::read_config(path)?,
        None => ServerConfig::default(),
    };
    cli.apply(&mut config);
    config::validate_config(&config).map_err(config::ConfigError::Validation)?;
    Ok(config)
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match load(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    logging::init_logging(&config.observability.log_level);
    tracing::info!("sftp-listener v{} starting", env!("CARGO_PKG_VERSION"));
    tracing::info!(
        readonly = config.sftp.read_only,
        debug_stderr = config.observability.debug_stderr,
        "Configuration loaded"
    );

    let server = match Server::build(&config).await {
        Ok(server) => server,
        Err(e) => {
            tracing::error!(error = %e, "Startup failed");
            return ExitCode::FAILURE;
        }
    };

    match server.local_addr() {
        Ok(addr) => tracing::info!(address = %addr, "Listening for connections"),
        Err(e) => tracing::warn!(error = %e, "Could not read listening address"),
    }

    let shutdown = Shutdown::new();
    let running = tokio::spawn(server.run(shutdown.subscribe()));

    let signal = wait_for_signal().await;
    tracing::info!(signal = %signal, "Shutdown requested");
    shutdown.trigger();

    if let Err(e) = running.await {
        tracing::error!(error = %e, "Server task failed");
        return ExitCode::FAILURE;
    }

    tracing::info!("Shutdown complete");
    ExitCode::SUCCESS
}
