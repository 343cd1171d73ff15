//! TCP peer links shared by hub and agent
//!
//! A [`PeerLink`] owns at most one live socket to a single remote endpoint:
//! - connect (once, or forever with a fixed backoff) or wrap an accepted stream
//! - framed command send/receive
//! - a non-blocking liveness probe
//! - idempotent orderly close
//!
//! Any transient I/O failure observed through the link releases the socket
//! and leaves the link `Faulted`.

use std::io::ErrorKind;
use std::mem::MaybeUninit;
use std::net::{IpAddr, Shutdown, SocketAddr};
use std::time::Duration;

use socket2::{Domain, Protocol, SockRef, Socket, Type};
use tokio::net::{TcpListener, TcpSocket, TcpStream};

use crate::command::{write_command, Command, CommandReader};
use crate::error::{Error, Result};
use crate::types::LinkState;

/// Default delay between connect attempts.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(3);

/// Bind a TCP listener with a bounded accept backlog.
pub fn bind_listener(addr: SocketAddr, backlog: i32) -> Result<TcpListener> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };

    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;

    // Restarted listeners must not trip over TIME_WAIT entries
    socket.set_reuse_address(true)?;

    socket.bind(&addr.into())?;
    socket.listen(backlog)?;
    socket.set_nonblocking(true)?;

    let std_listener: std::net::TcpListener = socket.into();
    let listener = TcpListener::from_std(std_listener)?;

    tracing::info!("TCP listener bound to {} (backlog={})", addr, backlog);

    Ok(listener)
}

/// Switches a socket to non-blocking mode and restores the prior mode on drop.
struct NonBlockingGuard<'a> {
    socket: &'a Socket,
    was_nonblocking: bool,
}

impl<'a> NonBlockingGuard<'a> {
    fn engage(socket: &'a Socket) -> std::io::Result<Self> {
        let was_nonblocking = socket.nonblocking()?;
        socket.set_nonblocking(true)?;
        Ok(Self {
            socket,
            was_nonblocking,
        })
    }
}

impl Drop for NonBlockingGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.socket.set_nonblocking(self.was_nonblocking) {
            tracing::debug!("Failed to restore socket mode: {}", e);
        }
    }
}

/// Point-to-point byte stream to one remote endpoint.
#[derive(Debug)]
pub struct PeerLink {
    remote: SocketAddr,
    stream: Option<TcpStream>,
    state: LinkState,
    reader: CommandReader,
}

impl PeerLink {
    /// Wrap a stream returned by `accept`.
    pub fn from_stream(stream: TcpStream) -> Result<Self> {
        let remote = stream.peer_addr()?;
        Ok(Self {
            remote,
            stream: Some(stream),
            state: LinkState::Connected,
            reader: CommandReader::new(),
        })
    }

    /// Single connection attempt, optionally from a fixed local address.
    pub async fn connect(remote: SocketAddr, bind_ip: Option<IpAddr>) -> Result<Self> {
        let socket = if remote.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };

        if let Some(ip) = bind_ip {
            socket.bind(SocketAddr::new(ip, 0))?;
        }

        let stream = socket.connect(remote).await?;
        stream.set_nodelay(true)?;

        Ok(Self {
            remote,
            stream: Some(stream),
            state: LinkState::Connected,
            reader: CommandReader::new(),
        })
    }

    /// Connect, retrying after `delay` until the remote accepts. Never gives up.
    pub async fn connect_with_retry(
        remote: SocketAddr,
        bind_ip: Option<IpAddr>,
        delay: Duration,
    ) -> Self {
        let mut attempts: u64 = 0;
        loop {
            attempts += 1;
            match Self::connect(remote, bind_ip).await {
                Ok(link) => {
                    tracing::info!("Connected to {} after {} attempt(s)", remote, attempts);
                    return link;
                }
                Err(e) if attempts == 1 => {
                    tracing::warn!(
                        "Connect to {} failed: {}. Retrying every {:?}",
                        remote,
                        e,
                        delay
                    );
                }
                Err(e) => {
                    tracing::debug!("Connect attempt {} to {} failed: {}", attempts, remote, e);
                }
            }
            tokio::time::sleep(delay).await;
        }
    }

    /// Remote endpoint identity.
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    /// Current connection state.
    pub fn state(&self) -> LinkState {
        self.state
    }

    /// Whether a live socket is held.
    pub fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    /// Borrow the live stream.
    pub fn stream(&mut self) -> Result<&mut TcpStream> {
        self.stream.as_mut().ok_or(Error::LinkClosed)
    }

    /// Pass an operation's result through, faulting the link on network errors.
    pub fn track<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            if e.is_transient() && self.is_open() {
                tracing::debug!("Link to {} faulted: {}", self.remote, e);
                self.fault();
            }
        }
        result
    }

    /// Send one command frame.
    pub async fn send_command(&mut self, command: &Command) -> Result<()> {
        let result = match self.stream.as_mut() {
            Some(stream) => write_command(stream, command).await,
            None => Err(Error::LinkClosed),
        };
        self.track(result)
    }

    /// Wait for one command frame. Cancel-safe.
    pub async fn recv_command(&mut self) -> Result<Command> {
        let result = match self.stream.as_mut() {
            Some(stream) => self.reader.read(stream).await,
            None => Err(Error::LinkClosed),
        };
        self.track(result)
    }

    /// Non-blocking liveness check.
    ///
    /// A zero-length send that succeeds or would block means alive; any other
    /// send error, an orderly EOF seen by a one-byte peek, or a released
    /// socket means dead. Never blocks the caller.
    pub fn probe_alive(&self) -> bool {
        match self.stream.as_ref() {
            Some(stream) => socket_alive(&SockRef::from(stream), self.remote),
            None => false,
        }
    }

    /// Duplicate of the socket that stays usable while another task holds
    /// this link.
    pub fn monitor(&self) -> Result<LinkMonitor> {
        let stream = self.stream.as_ref().ok_or(Error::LinkClosed)?;
        Ok(LinkMonitor {
            socket: SockRef::from(stream).try_clone()?,
            remote: self.remote,
        })
    }

    /// Release the socket after a failure.
    pub fn fault(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = SockRef::from(&stream).shutdown(Shutdown::Both);
        }
        self.reader = CommandReader::new();
        self.state = LinkState::Faulted;
    }

    /// Orderly shutdown of both directions, then release. Idempotent.
    pub fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            if let Err(e) = SockRef::from(&stream).shutdown(Shutdown::Both) {
                tracing::debug!("Shutdown of link to {} failed: {}", self.remote, e);
            }
            tracing::debug!("Link to {} closed", self.remote);
        }
        if self.state != LinkState::Faulted {
            self.state = LinkState::Disconnected;
        }
    }
}

impl Drop for PeerLink {
    fn drop(&mut self) {
        self.close();
    }
}

/// Second descriptor for a link's socket.
///
/// Shares the connection with the [`PeerLink`] it came from, so it can check
/// liveness or force a shutdown while the link itself is borrowed by an
/// exchange. A shutdown wakes that exchange with an error.
#[derive(Debug)]
pub struct LinkMonitor {
    socket: Socket,
    remote: SocketAddr,
}

impl LinkMonitor {
    /// Same check as [`PeerLink::probe_alive`].
    pub fn is_alive(&self) -> bool {
        socket_alive(&self.socket, self.remote)
    }

    /// Shut down both directions of the shared connection.
    pub fn shutdown(&self) {
        if let Err(e) = self.socket.shutdown(Shutdown::Both) {
            tracing::debug!("Forced shutdown of {} failed: {}", self.remote, e);
        }
    }
}

fn socket_alive(sock: &Socket, remote: SocketAddr) -> bool {
    let _guard = match NonBlockingGuard::engage(sock) {
        Ok(guard) => guard,
        Err(e) => {
            tracing::debug!("Liveness check of {} could not switch mode: {}", remote, e);
            return false;
        }
    };

    match sock.send(&[]) {
        Ok(_) => {}
        Err(e) if e.kind() == ErrorKind::WouldBlock => return true,
        Err(e) => {
            tracing::debug!("Zero-length send to {} failed: {}", remote, e);
            return false;
        }
    }

    let mut byte = [MaybeUninit::<u8>::uninit(); 1];
    match sock.peek(&mut byte) {
        Ok(0) => {
            tracing::debug!("{} reached end of stream", remote);
            false
        }
        Ok(_) => true,
        Err(e) if e.kind() == ErrorKind::WouldBlock => true,
        Err(e) => {
            tracing::debug!("Peek on {} failed: {}", remote, e);
            false
        }
    }
}
