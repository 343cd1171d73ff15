//! Logpull Agent
//!
//! Runs on each monitored machine. Keeps one connection to the hub, waits for
//! commands and, on `RequestLogs`, bundles the local log directories and
//! streams the bundle back over the same link.

pub mod artifact;
pub mod config;
pub mod error;
pub mod node;
pub mod session;

pub use artifact::{Artifact, ArtifactSource, LogBundle};
pub use config::AgentConfig;
pub use error::{Error, Result};
pub use node::AgentNode;
pub use session::{AgentSession, AgentState, SessionEnd, MAX_BUILD_ATTEMPTS};
