//! Core types and wire constants for the logpull protocol

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Default TCP port shared by hub and agent.
pub const DEFAULT_PORT: u16 = 60100;

/// Chunk size for reading and writing artifact payloads (5 MiB).
pub const CHUNK_SIZE: usize = 5 * 1024 * 1024;

/// Size of the little-endian length header preceding every payload.
pub const HEADER_LEN: usize = 8;

/// Size of a NUL-padded command frame.
pub const COMMAND_FRAME_LEN: usize = 64;

/// Pending connection queue length for the hub listener.
pub const LISTEN_BACKLOG: i32 = 100;

/// Connection state of a [`PeerLink`](crate::PeerLink).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkState {
    /// No socket held
    Disconnected,
    /// Connect in progress
    Connecting,
    /// Socket held and usable
    Connected,
    /// Socket was released after an I/O error
    Faulted,
}

impl LinkState {
    /// Whether the link currently owns a socket.
    pub fn holds_socket(self) -> bool {
        matches!(self, LinkState::Connected)
    }
}

/// Outcome of a completed artifact transfer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferReport {
    /// Length announced by the header
    pub expected: u64,
    /// Bytes actually moved
    pub received: u64,
    /// Where the artifact was read from or written to
    pub path: PathBuf,
}

impl TransferReport {
    /// Announced size in MiB, rounded to two decimals.
    pub fn size_mib(&self) -> f64 {
        mib(self.expected)
    }
}

/// Convert a byte count to MiB rounded to two decimals.
pub fn mib(bytes: u64) -> f64 {
    (bytes as f64 / 1024.0 / 1024.0 * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mib_rounding() {
        assert_eq!(mib(0), 0.0);
        assert_eq!(mib(12_582_912), 12.0);
        assert_eq!(mib(1_572_864), 1.5);
        assert_eq!(mib(1_000_000), 0.95);
    }

    #[test]
    fn test_only_connected_holds_socket() {
        assert!(LinkState::Connected.holds_socket());
        assert!(!LinkState::Connecting.holds_socket());
        assert!(!LinkState::Faulted.holds_socket());
        assert!(!LinkState::Disconnected.holds_socket());
    }
}
