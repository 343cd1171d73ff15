//! Command vocabulary exchanged before a transfer.
//!
//! Commands are short UTF-8 tokens carried in fixed [`COMMAND_FRAME_LEN`]
//! frames, NUL-padded. The receiver trims the padding and compares
//! case-insensitively.

use std::fmt;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};
use crate::types::COMMAND_FRAME_LEN;

/// Token asking the agent to build and send its artifact.
pub const REQUEST_LOGS: &str = "RequestLogs";

/// Keepalive token; the agent goes back to waiting.
pub const CHECK_STATUS: &str = "CheckStatus";

/// Phrase sent to a duplicate connection before it is closed.
pub const ALREADY_CONNECTED: &str = "AlreadyConnected";

/// A decoded command frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    RequestLogs,
    CheckStatus,
    /// Anything else ends the session on the agent side.
    Other(String),
}

impl Command {
    /// Decode a token, ignoring NUL padding, surrounding whitespace and case.
    pub fn parse(raw: &[u8]) -> Self {
        let text = String::from_utf8_lossy(raw);
        let token = text.trim_end_matches('\0').trim();

        if token.eq_ignore_ascii_case(REQUEST_LOGS) {
            Command::RequestLogs
        } else if token.eq_ignore_ascii_case(CHECK_STATUS) {
            Command::CheckStatus
        } else {
            Command::Other(token.to_string())
        }
    }

    /// Wire token for this command.
    pub fn token(&self) -> &str {
        match self {
            Command::RequestLogs => REQUEST_LOGS,
            Command::CheckStatus => CHECK_STATUS,
            Command::Other(text) => text,
        }
    }

    /// Encode into a NUL-padded frame. Tokens longer than a frame are cut.
    pub fn encode(&self) -> [u8; COMMAND_FRAME_LEN] {
        let mut frame = [0u8; COMMAND_FRAME_LEN];
        let token = self.token().as_bytes();
        let len = token.len().min(COMMAND_FRAME_LEN);
        frame[..len].copy_from_slice(&token[..len]);
        frame
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token())
    }
}

/// Write one command frame.
pub async fn write_command<W>(writer: &mut W, command: &Command) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&command.encode()).await?;
    writer.flush().await?;
    Ok(())
}

/// Accumulates one command frame across reads.
///
/// Partial frames survive a dropped `read` future, so a pending read can sit
/// in a `tokio::select!` next to timers without losing bytes.
#[derive(Debug)]
pub struct CommandReader {
    frame: [u8; COMMAND_FRAME_LEN],
    filled: usize,
}

impl Default for CommandReader {
    fn default() -> Self {
        Self {
            frame: [0u8; COMMAND_FRAME_LEN],
            filled: 0,
        }
    }
}

impl CommandReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read until one full frame is buffered, then decode it.
    pub async fn read<R>(&mut self, reader: &mut R) -> Result<Command>
    where
        R: AsyncRead + Unpin,
    {
        while self.filled < COMMAND_FRAME_LEN {
            let n = reader.read(&mut self.frame[self.filled..]).await?;
            if n == 0 {
                let got = std::mem::take(&mut self.filled);
                return Err(Error::Truncated {
                    what: "command frame",
                    got,
                    want: COMMAND_FRAME_LEN,
                });
            }
            self.filled += n;
        }

        self.filled = 0;
        Ok(Command::parse(&self.frame))
    }
}

/// Read exactly one command frame.
pub async fn read_command<R>(reader: &mut R) -> Result<Command>
where
    R: AsyncRead + Unpin,
{
    CommandReader::new().read(reader).await
}
