//! Logpull Transfer - peer links and artifact streaming
//!
//! This crate provides the protocol core shared by the hub and its agents:
//! - [`PeerLink`]: one TCP connection with connect/accept, liveness probing and
//!   idempotent close
//! - [`Command`]: the fixed-frame command vocabulary (`RequestLogs`,
//!   `CheckStatus`, anything else ends the session)
//! - [`streaming`]: 8-byte length header followed by the raw payload, moved in
//!   5 MiB chunks with per-chunk progress
//! - [`Signal`]: a single-slot completion hand-off between tasks
//!
//! # Example
//!
//! ```rust,ignore
//! use logpull_transfer::{streaming, Command, PeerLink, Signal};
//!
//! let mut link = PeerLink::connect("127.0.0.1:60100".parse()?, None).await?;
//! match link.recv_command().await? {
//!     Command::RequestLogs => {
//!         let report = streaming::send_artifact(link.stream()?, &path, &observer).await?;
//!     }
//!     Command::CheckStatus => {}
//!     Command::Other(_) => link.close(),
//! }
//! ```

pub mod command;
pub mod config;
pub mod error;
pub mod signal;
pub mod streaming;
pub mod transport;
pub mod types;

// Re-export main types at crate root
pub use command::{Command, CommandReader};
pub use error::{Error, Result};
pub use signal::Signal;
pub use streaming::{ByteCounter, NoProgress, ProgressObserver};
pub use transport::{bind_listener, LinkMonitor, PeerLink, DEFAULT_RECONNECT_DELAY};
pub use types::{
    LinkState, TransferReport, CHUNK_SIZE, COMMAND_FRAME_LEN, DEFAULT_PORT, HEADER_LEN,
    LISTEN_BACKLOG,
};
