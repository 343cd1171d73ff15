//! Error types for logpull-transfer.

use std::path::PathBuf;

use thiserror::Error;

/// Result type for transfer and link operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by peer links, command framing and artifact streaming.
#[derive(Debug, Error)]
pub enum Error {
    /// Socket or file I/O failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The link has no live socket (never connected, closed or faulted).
    #[error("link is closed")]
    LinkClosed,

    /// The remote side closed the stream before the declared length arrived.
    #[error("remote disconnected after {received} of {expected} bytes")]
    Disconnected { expected: u64, received: u64 },

    /// The remote side closed the stream inside a fixed-size frame.
    #[error("stream closed inside {what} ({got} of {want} bytes)")]
    Truncated {
        what: &'static str,
        got: usize,
        want: usize,
    },

    /// The artifact to send does not exist on disk.
    #[error("artifact missing: {0}")]
    ArtifactMissing(PathBuf),

    /// The destination artifact could not be created or written.
    #[error("destination {path} unwritable: {source}")]
    Destination {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A configuration file could not be read, parsed or written.
    #[error("config error ({path}): {reason}")]
    Config { path: PathBuf, reason: String },
}

impl Error {
    /// Network faults that a reconnect or listener restart can recover from.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Io(_)
            | Error::LinkClosed
            | Error::Disconnected { .. }
            | Error::Truncated { .. } => true,
            Error::ArtifactMissing(_) | Error::Destination { .. } | Error::Config { .. } => false,
        }
    }
}
