//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the server.
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};

/// Root configuration for the SFTP listener.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ServerConfig {
    /// Listener configuration (bind address, admission limits).
    pub listener: ListenerConfig,

    /// Secure transport settings.
    pub ssh: SshConfig,

    /// Accepted credentials.
    pub auth: AuthConfig,

    /// File-transfer engine settings.
    pub sftp: SftpConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,

    /// Graceful shutdown settings.
    pub shutdown: ShutdownConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:2022").
    pub bind_address: String,

    /// Maximum concurrent connections (backpressure).
    pub max_connections: usize,

    /// Maximum concurrently negotiating or bound channels per connection.
    /// Unset means unbounded.
    pub max_channels_per_connection: Option<usize>,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:2022".to_string(),
            max_connections: 1024,
            max_channels_per_connection: None,
        }
    }
}

/// Secure transport configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SshConfig {
    /// Path to the host private key (OpenSSH or PEM).
    pub host_key_path: String,

    /// Deadline for version exchange, key exchange and authentication.
    pub handshake_timeout_secs: u64,

    /// Delay applied to each rejected authentication attempt.
    pub auth_rejection_time_secs: u64,

    /// Close sessions idle for this long. Unset disables the timer.
    pub inactivity_timeout_secs: Option<u64>,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            host_key_path: "id_rsa".to_string(),
            handshake_timeout_secs: 30,
            auth_rejection_time_secs: 1,
            inactivity_timeout_secs: None,
        }
    }
}

/// One accepted user.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct UserCredential {
    pub name: String,
    pub password: String,
}

/// Credential table.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AuthConfig {
    pub users: Vec<UserCredential>,
}

/// Demonstration account shipped in the default config.
pub const DEMO_USER: &str = "testuser";

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            // WARNING: demonstration credentials. Replace them in any real deployment.
            users: vec![UserCredential {
                name: DEMO_USER.to_string(),
                password: "tiger".to_string(),
            }],
        }
    }
}

impl AuthConfig {
    /// True while the demonstration account is configured.
    pub fn uses_demo_account(&self) -> bool {
        self.users.iter().any(|u| u.name == DEMO_USER)
    }
}

/// How the subsystem name is decoded from a `subsystem` request payload.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SubsystemPrefix {
    /// The length prefix must match the number of name bytes.
    #[default]
    Strict,
    /// Skip the 4-byte prefix and take the rest as the name.
    Permissive,
}

/// File-transfer engine configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SftpConfig {
    /// Reject every mutating operation.
    pub read_only: bool,

    /// Directory served to clients.
    pub root: String,

    /// Subsystem payload decoding policy.
    pub subsystem_prefix: SubsystemPrefix,
}

impl Default for SftpConfig {
    fn default() -> Self {
        Self {
            read_only: false,
            root: "/".to_string(),
            subsystem_prefix: SubsystemPrefix::Strict,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Send the negotiation and engine trace to stderr instead of discarding it.
    pub debug_stderr: bool,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            debug_stderr: false,
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9090".to_string(),
        }
    }
}

/// Shutdown configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ShutdownConfig {
    /// How long established sessions may keep running after a stop signal.
    pub drain_timeout_secs: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            drain_timeout_secs: 10,
        }
    }
}
