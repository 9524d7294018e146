//! Error types for the verification engine
//!
//! Every variant carries enough context (namespace, resource name, observed
//! vs expected value) to diagnose a failed run from its message alone.

use std::time::Duration;

use thiserror::Error;

use crate::workload::WorkloadKind;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Credential unavailable: secret {secret}: {reason}")]
    CredentialUnavailable { secret: String, reason: String },

    #[error("Credential malformed: secret {secret}, field {field}: {reason}")]
    CredentialMalformed {
        secret: String,
        field: &'static str,
        reason: String,
    },

    #[error("Tunnel setup failed for service {namespace}/{service} port {port}: {reason}")]
    TunnelSetupFailed {
        namespace: String,
        service: String,
        port: u16,
        reason: String,
    },

    #[error("Catalog query to {url} failed: {reason}")]
    QueryTransportError { url: String, reason: String },

    #[error(
        "Timed out after {elapsed:?} waiting for {condition}: expected {expected}, last observed {}",
        .last_observed.as_deref().unwrap_or("nothing (no check completed)")
    )]
    DeadlineExceeded {
        condition: String,
        elapsed: Duration,
        expected: String,
        last_observed: Option<String>,
    },

    #[error("Failed to fetch {kind} {namespace}/{name}: {reason}")]
    WorkloadFetchError {
        kind: WorkloadKind,
        namespace: String,
        name: String,
        reason: String,
    },

    #[error("{kind} {namespace}/{name} failed: {reason}")]
    WorkloadFailed {
        kind: WorkloadKind,
        namespace: String,
        name: String,
        reason: String,
    },

    #[error("Invalid poll spec: {0}")]
    InvalidPollSpec(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl Error {
    /// True for the single expected terminal failure of a poll loop
    pub fn is_deadline(&self) -> bool {
        matches!(self, Error::DeadlineExceeded { .. })
    }

    /// Setup-phase errors are fatal to the calling scenario.
    ///
    /// The engine never retries these; re-running the whole verification
    /// with a fresh tunnel is the caller's decision.
    pub fn is_setup(&self) -> bool {
        matches!(
            self,
            Error::CredentialUnavailable { .. }
                | Error::CredentialMalformed { .. }
                | Error::TunnelSetupFailed { .. }
        )
    }

    /// Configuration mistakes made by the caller, not runtime failures
    pub fn is_config(&self) -> bool {
        matches!(self, Error::InvalidPollSpec(_) | Error::InvalidConfig(_))
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
