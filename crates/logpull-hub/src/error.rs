//! Error types for the hub.

use std::net::IpAddr;

use thiserror::Error;

/// Result type for hub operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in hub operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Link, framing or streaming failure
    #[error(transparent)]
    Transfer(#[from] logpull_transfer::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// No session for this identity
    #[error("Unknown client: {0}")]
    UnknownClient(IpAddr),

    /// A transfer is already in flight on this session
    #[error("Client {0} is busy")]
    Busy(IpAddr),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(String),
}
