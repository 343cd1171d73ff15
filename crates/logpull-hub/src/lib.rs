//! Logpull Hub - pull log bundles from connected agents
//!
//! Agents keep a persistent TCP link to the hub. On request the hub sends
//! `RequestLogs` to a selection of agents, each of which streams back one
//! bundle that is stored under the configured save directory.
//!
//! # Architecture
//!
//! - **Registry**: one session per agent IP, duplicate links rejected
//! - **Session**: hub side of the command/transfer exchange
//! - **Orchestrator**: concurrent requests with per-round completion counting
//! - **Node**: listener with fault and on-request restart, liveness prober
//! - **Admin Socket**: Unix socket for local operator commands (logpull-admin CLI)
//!
//! # Example
//!
//! ```no_run
//! use logpull_hub::{HubConfig, HubContext, HubNode};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let node = HubNode::new(HubConfig::load()?, HubContext::new());
//!     node.run().await?;
//!     Ok(())
//! }
//! ```

pub mod admin_socket;
pub mod config;
pub mod context;
pub mod error;
pub mod node;
pub mod orchestrator;
pub mod registry;
pub mod session;

pub use config::HubConfig;
pub use context::{HubContext, HubEvent, HubSessionState, SessionInfo, StatusLevel};
pub use error::{Error, Result};
pub use node::{HubNode, ListenerControl};
pub use orchestrator::{Orchestrator, RequestRound, RoundStatus, SkipReason};
pub use registry::{ClientRegistry, ClientSession, Registration, UNKNOWN_HOST};
pub use session::artifact_path;
