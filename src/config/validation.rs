//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (timeouts > 0, limits > 0, addresses parse)
//! - Check the credential table is usable
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ServerConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::collections::HashSet;
use std::net::SocketAddr;

use crate::config::schema::ServerConfig;

/// A single semantic problem in a configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// An address field does not parse as `host:port`.
    InvalidAddress { field: &'static str, value: String },
    /// A numeric field must be greater than zero.
    MustBePositive { field: &'static str },
    /// No user may log in.
    NoUsers,
    /// A user entry has an empty name.
    EmptyUserName,
    /// The same user name appears twice.
    DuplicateUser(String),
    /// The served root is empty.
    EmptyRoot,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationError::InvalidAddress { field, value } => {
                write!(f, "{}: invalid socket address {:?}", field, value)
            }
            ValidationError::MustBePositive { field } => {
                write!(f, "{} must be greater than zero", field)
            }
            ValidationError::NoUsers => write!(f, "auth.users must contain at least one user"),
            ValidationError::EmptyUserName => write!(f, "auth.users contains an empty name"),
            ValidationError::DuplicateUser(name) => {
                write!(f, "auth.users lists {:?} more than once", name)
            }
            ValidationError::EmptyRoot => write!(f, "sftp.root must not be empty"),
        }
    }
}

impl std::error::Error for ValidationError {}

/// Validate a parsed configuration.
pub fn validate_config(config: &ServerConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.listener.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::InvalidAddress {
            field: "listener.bind_address",
            value: config.listener.bind_address.clone(),
        });
    }
    if config.listener.max_connections == 0 {
        errors.push(ValidationError::MustBePositive {
            field: "listener.max_connections",
        });
    }
    if config.listener.max_channels_per_connection == Some(0) {
        errors.push(ValidationError::MustBePositive {
            field: "listener.max_channels_per_connection",
        });
    }

    if config.ssh.handshake_timeout_secs == 0 {
        errors.push(ValidationError::MustBePositive {
            field: "ssh.handshake_timeout_secs",
        });
    }
    if config.ssh.inactivity_timeout_secs == Some(0) {
        errors.push(ValidationError::MustBePositive {
            field: "ssh.inactivity_timeout_secs",
        });
    }

    if config.auth.users.is_empty() {
        errors.push(ValidationError::NoUsers);
    }
    let mut seen = HashSet::new();
    for user in &config.auth.users {
        if user.name.is_empty() {
            errors.push(ValidationError::EmptyUserName);
        } else if !seen.insert(user.name.as_str()) {
            errors.push(ValidationError::DuplicateUser(user.name.clone()));
        }
    }

    if config.sftp.root.trim().is_empty() {
        errors.push(ValidationError::EmptyRoot);
    }

    if config.observability.metrics_enabled
        && config.observability.metrics_address.parse::<SocketAddr>().is_err()
    {
        errors.push(ValidationError::InvalidAddress {
            field: "observability.metrics_address",
            value: config.observability.metrics_address.clone(),
        });
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
