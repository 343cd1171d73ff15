//! Error types for the agent.

use thiserror::Error;

/// Result type for agent operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that end an agent session.
#[derive(Debug, Error)]
pub enum Error {
    /// Link, framing or streaming failure
    #[error(transparent)]
    Transfer(#[from] logpull_transfer::Error),

    /// The artifact could not be produced after repeated attempts
    #[error("artifact unavailable after {attempts} attempt(s): {reason}")]
    ArtifactUnavailable { attempts: u32, reason: String },

    /// The periodic self-probe found the hub link dead
    #[error("link to hub lost")]
    LinkLost,

    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    Config(String),
}
