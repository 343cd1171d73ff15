//! Hub event context.
//!
//! Components that report progress or status get a [`HubContext`] at
//! construction and publish [`HubEvent`]s on it. Subscribers (the binary's
//! status renderer, tests) receive every event published after they
//! subscribed.

use std::net::{IpAddr, SocketAddr};

use logpull_transfer::TransferReport;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Events buffered per subscriber before the oldest are dropped.
pub const EVENT_CAPACITY: usize = 1024;

/// Per-session request state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HubSessionState {
    /// Connected, nothing in flight
    Idle,
    /// `RequestLogs` sent, waiting for the length header
    Requested,
    /// Payload bytes arriving
    Receiving,
    /// Artifact fully written
    Done,
}

/// Snapshot of one connected agent.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub identity: IpAddr,
    pub host_name: String,
    pub remote: SocketAddr,
    pub state: HubSessionState,
    pub busy: bool,
    /// RFC 3339 local time of the connection
    pub connected_at: String,
}

/// Severity of a status-line message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusLevel {
    Info,
    Warn,
    Error,
}

#[derive(Clone, Debug)]
pub enum HubEvent {
    SessionAdded(SessionInfo),
    SessionRemoved { identity: IpAddr, reason: String },
    SessionsChanged(Vec<SessionInfo>),
    TransferStarted { identity: IpAddr, expected: u64 },
    Progress { identity: IpAddr, bytes: u64 },
    TransferCompleted { identity: IpAddr, report: TransferReport },
    TransferFailed { identity: IpAddr, error: String },
    Status { level: StatusLevel, text: String },
}

/// Cloneable handle for publishing hub events.
#[derive(Clone, Debug)]
pub struct HubContext {
    events: broadcast::Sender<HubEvent>,
}

impl Default for HubContext {
    fn default() -> Self {
        Self::new()
    }
}

impl HubContext {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self { events }
    }

    /// Receive events published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<HubEvent> {
        self.events.subscribe()
    }

    /// Publish an event. Having no subscribers is fine.
    pub fn publish(&self, event: HubEvent) {
        let _ = self.events.send(event);
    }

    /// Publish a status-line message.
    pub fn status(&self, level: StatusLevel, text: impl Into<String>) {
        self.publish(HubEvent::Status {
            level,
            text: text.into(),
        });
    }
}

/// Render one event as a log line.
pub fn log_event(event: &HubEvent) {
    match event {
        HubEvent::SessionAdded(info) => {
            tracing::info!("Client connected: {} ({})", info.identity, info.host_name);
        }
        HubEvent::SessionRemoved { identity, reason } => {
            tracing::info!("Client removed: {} ({})", identity, reason);
        }
        HubEvent::SessionsChanged(sessions) => {
            tracing::debug!("{} client(s) connected", sessions.len());
        }
        HubEvent::TransferStarted { identity, expected } => {
            tracing::info!(
                "Receiving {:.2} MiB from {}",
                logpull_transfer::types::mib(*expected),
                identity
            );
        }
        HubEvent::Progress { identity, bytes } => {
            tracing::debug!("{}: +{} bytes", identity, bytes);
        }
        HubEvent::TransferCompleted { identity, report } => {
            tracing::info!(
                "Logs from {} saved to {:?} ({} bytes)",
                identity,
                report.path,
                report.received
            );
        }
        HubEvent::TransferFailed { identity, error } => {
            tracing::error!("Transfer from {} failed: {}", identity, error);
        }
        HubEvent::Status { level, text } => match level {
            StatusLevel::Info => tracing::info!("{}", text),
            StatusLevel::Warn => tracing::warn!("{}", text),
            StatusLevel::Error => tracing::error!("{}", text),
        },
    }
}
