use std::{io, net::AddrParseError};

/// Errors common to every core component.
///
/// Mirrors the taxonomy in the error-handling design: validation and
/// precondition failures are reported immediately with no side effects,
/// conflicts are retryable by the caller, and everything else carries
/// enough context for the orchestrator to decide whether to retry.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid CIDR {0:?}: {1}")]
    InvalidCidr(String, ipnet::AddrParseError),

    #[error("invalid endpoint {0:?}")]
    InvalidEndpoint(String),

    #[error("invalid WireGuard key: {0}")]
    InvalidKey(#[from] wireguard_control::InvalidKey),

    #[error("no available /24 subnet in {0}")]
    SubnetsExhausted(ipnet::Ipv4Net),

    #[error("network {network:?} already initialized with {field} {existing}")]
    AlreadyInitialized {
        network: String,
        field: &'static str,
        existing: String,
    },

    #[error("network {new:?} CIDR {new_cidr} overlaps with network {existing:?}")]
    CidrOverlap {
        new: String,
        new_cidr: String,
        existing: String,
    },

    #[error("network already uses CIDR {existing}, requested {requested}")]
    CidrMismatch { existing: String, requested: String },

    #[error("registry conflict: row was modified concurrently")]
    Conflict,

    #[error("registry request failed: {0}")]
    Registry(#[from] reqwest::Error),

    #[error("registry returned malformed event: {0}")]
    RegistryProtocol(String),

    #[error("docker error: {0}")]
    Docker(#[from] bollard::errors::Error),

    #[error(transparent)]
    Database(#[from] rusqlite::Error),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("ssh to {host} failed: {detail}")]
    Ssh { host: String, detail: String },

    #[error("precondition failed: {0}")]
    Precondition(String),

    #[error("{0}")]
    Other(String),
}

impl From<AddrParseError> for Error {
    fn from(e: AddrParseError) -> Self {
        Error::InvalidEndpoint(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
