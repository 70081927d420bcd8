//! Credential verification.
//!
//! # Responsibilities
//! - Define the synchronous accept/reject contract used during handshakes
//! - Provide a config-backed verifier over a fixed user table

use std::collections::HashMap;

use crate::config::UserCredential;

/// Outcome of a credential check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Accept,
    Reject,
}

/// Checks an `(identity, secret)` pair. Invoked once per authentication attempt.
pub trait CredentialVerifier: Send + Sync + 'static {
    fn verify(&self, identity: &str, secret: &[u8]) -> Verdict;
}

impl<F> CredentialVerifier for F
where
    F: Fn(&str, &[u8]) -> Verdict + Send + Sync + 'static,
{
    fn verify(&self, identity: &str, secret: &[u8]) -> Verdict {
        self(identity, secret)
    }
}

/// Verifier backed by the configured user table.
#[derive(Debug, Clone, Default)]
pub struct StaticCredentials {
    users: HashMap<String, Vec<u8>>,
}

impl StaticCredentials {
    pub fn new(users: &[UserCredential]) -> Self {
        Self {
            users: users
                .iter()
                .map(|u| (u.name.clone(), u.password.as_bytes().to_vec()))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

impl CredentialVerifier for StaticCredentials {
    fn verify(&self, identity: &str, secret: &[u8]) -> Verdict {
        match self.users.get(identity) {
            Some(expected) if constant_time_eq(expected, secret) => Verdict::Accept,
            _ => Verdict::Reject,
        }
    }
}

/// Compare without short-circuiting on the first differing byte.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
