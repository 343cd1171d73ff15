//! Connected-agent registry.
//!
//! Keyed by remote IP. A reconnect from an identity that is already present
//! is rejected while the existing session still probes alive, and replaces
//! it otherwise. Every mutation happens under the single write lock.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use logpull_transfer::{LinkMonitor, PeerLink};
use tokio::sync::{Mutex, RwLock};

use crate::context::{HubContext, HubEvent, HubSessionState, SessionInfo};

/// Hub-side record of one agent connection.
#[derive(Debug)]
pub struct ClientSession {
    identity: IpAddr,
    host_name: String,
    remote: SocketAddr,
    connected_at: String,
    /// Holding the guard makes the holder the only user of the socket
    link: Mutex<PeerLink>,
    /// Reaches the socket while the guard is held elsewhere
    monitor: Option<LinkMonitor>,
    busy: AtomicBool,
    state: AtomicU8,
}

impl ClientSession {
    pub fn new(link: PeerLink, host_name: impl Into<String>) -> Self {
        let remote = link.remote_addr();
        let monitor = match link.monitor() {
            Ok(monitor) => Some(monitor),
            Err(e) => {
                tracing::debug!("No monitor for {}: {}", remote, e);
                None
            }
        };
        Self {
            identity: remote.ip(),
            host_name: host_name.into(),
            remote,
            connected_at: Local::now().to_rfc3339(),
            link: Mutex::new(link),
            monitor,
            busy: AtomicBool::new(false),
            state: AtomicU8::new(state_to_u8(HubSessionState::Idle)),
        }
    }

    pub fn identity(&self) -> IpAddr {
        self.identity
    }

    pub fn host_name(&self) -> &str {
        &self.host_name
    }

    pub fn link(&self) -> &Mutex<PeerLink> {
        &self.link
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    /// Mark the session busy. Returns false if it already was.
    pub fn try_claim(&self) -> bool {
        self.busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn release(&self) {
        self.busy.store(false, Ordering::SeqCst);
    }

    pub fn state(&self) -> HubSessionState {
        state_from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn set_state(&self, state: HubSessionState) {
        self.state.store(state_to_u8(state), Ordering::SeqCst);
    }

    /// Liveness without blocking. A link held by an in-flight exchange is
    /// checked through the monitor descriptor instead.
    pub fn probe_alive(&self) -> bool {
        match self.link.try_lock() {
            Ok(link) => link.probe_alive(),
            Err(_) => self.monitor.as_ref().map_or(true, LinkMonitor::is_alive),
        }
    }

    /// Close the link. When an exchange holds it the connection is shut down
    /// underneath, so that exchange fails instead of waiting forever.
    fn shutdown(&self) {
        match (self.link.try_lock(), &self.monitor) {
            (Ok(mut link), _) => link.close(),
            (Err(_), Some(monitor)) => {
                tracing::debug!("Link to {} in use, shutting it down underneath", self.identity);
                monitor.shutdown();
            }
            (Err(_), None) => {
                tracing::debug!("Link to {} in use, left to its owner", self.identity)
            }
        }
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            identity: self.identity,
            host_name: self.host_name.clone(),
            remote: self.remote,
            state: self.state(),
            busy: self.is_busy(),
            connected_at: self.connected_at.clone(),
        }
    }
}

fn state_to_u8(state: HubSessionState) -> u8 {
    match state {
        HubSessionState::Idle => 0,
        HubSessionState::Requested => 1,
        HubSessionState::Receiving => 2,
        HubSessionState::Done => 3,
    }
}

fn state_from_u8(raw: u8) -> HubSessionState {
    match raw {
        1 => HubSessionState::Requested,
        2 => HubSessionState::Receiving,
        3 => HubSessionState::Done,
        _ => HubSessionState::Idle,
    }
}

/// Host name shown when reverse lookup gives nothing useful.
pub const UNKNOWN_HOST: &str = "Unknown";

/// Admission waits no longer than this for a host name.
pub const HOST_LOOKUP_TIMEOUT: Duration = Duration::from_millis(500);

/// Best-effort reverse lookup of an agent address. Never fails.
pub async fn resolve_host_name(ip: IpAddr) -> String {
    let lookup = tokio::task::spawn_blocking(move || dns_lookup::lookup_addr(&ip));
    match tokio::time::timeout(HOST_LOOKUP_TIMEOUT, lookup).await {
        Ok(Ok(answer)) => host_name_or_unknown(ip, answer),
        Ok(Err(e)) => {
            tracing::debug!("Host lookup task for {} failed: {}", ip, e);
            UNKNOWN_HOST.to_string()
        }
        Err(_) => {
            tracing::debug!("Host lookup for {} timed out", ip);
            UNKNOWN_HOST.to_string()
        }
    }
}

fn host_name_or_unknown(ip: IpAddr, answer: std::io::Result<String>) -> String {
    match answer {
        // A numeric answer carries no more than the identity itself
        Ok(name) if !name.is_empty() && name.parse::<IpAddr>().is_err() => name,
        Ok(_) => UNKNOWN_HOST.to_string(),
        Err(e) => {
            tracing::debug!("No host name for {}: {}", ip, e);
            UNKNOWN_HOST.to_string()
        }
    }
}

/// Result of [`ClientRegistry::register`].
#[derive(Debug)]
pub enum Registration {
    /// New identity
    Added(Arc<ClientSession>),
    /// A dead session for the identity was replaced
    Replaced(Arc<ClientSession>),
    /// The identity is connected and alive; the new link is handed back
    /// so the caller can notify and close it.
    Rejected(PeerLink),
}

/// Set of connected agents.
#[derive(Debug)]
pub struct ClientRegistry {
    sessions: RwLock<HashMap<IpAddr, Arc<ClientSession>>>,
    context: HubContext,
}

impl ClientRegistry {
    pub fn new(context: HubContext) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            context,
        }
    }

    /// Add a freshly accepted link, de-duplicating by remote IP.
    pub async fn register(&self, link: PeerLink, host_name: impl Into<String>) -> Registration {
        let identity = link.remote_addr().ip();
        let host_name = host_name.into();
        let mut sessions = self.sessions.write().await;

        if sessions.get(&identity).is_some_and(|existing| existing.probe_alive()) {
            tracing::info!(
                "{} ({}) is already connected, rejecting new link",
                identity,
                host_name
            );
            return Registration::Rejected(link);
        }

        let replaced = sessions.remove(&identity);

        if let Some(stale) = &replaced {
            tracing::info!("{} ({}) reconnected, replacing stale session", identity, host_name);
            stale.shutdown();
            self.context.publish(HubEvent::SessionRemoved {
                identity,
                reason: "replaced by reconnect".to_string(),
            });
        }

        let session = Arc::new(ClientSession::new(link, host_name));
        sessions.insert(identity, Arc::clone(&session));
        self.context.publish(HubEvent::SessionAdded(session.info()));
        self.context.publish(HubEvent::SessionsChanged(snapshot(&sessions)));

        if replaced.is_some() {
            Registration::Replaced(session)
        } else {
            Registration::Added(session)
        }
    }

    /// Remove and close a session. Idempotent.
    pub async fn unregister(&self, identity: IpAddr, reason: &str) -> bool {
        let mut sessions = self.sessions.write().await;
        let Some(session) = sessions.remove(&identity) else {
            return false;
        };

        session.shutdown();
        self.context.publish(HubEvent::SessionRemoved {
            identity,
            reason: reason.to_string(),
        });
        self.context.publish(HubEvent::SessionsChanged(snapshot(&sessions)));
        true
    }

    /// Evict every session whose link probes dead, busy or not.
    pub async fn evict_dead(&self) -> Vec<IpAddr> {
        let mut sessions = self.sessions.write().await;
        let dead: Vec<IpAddr> = sessions
            .values()
            .filter(|s| !s.probe_alive())
            .map(|s| s.identity())
            .collect();

        for identity in &dead {
            if let Some(session) = sessions.remove(identity) {
                session.shutdown();
                self.context.publish(HubEvent::SessionRemoved {
                    identity: *identity,
                    reason: "link dead".to_string(),
                });
            }
        }
        if !dead.is_empty() {
            self.context.publish(HubEvent::SessionsChanged(snapshot(&sessions)));
        }
        dead
    }

    pub async fn get(&self, identity: IpAddr) -> Option<Arc<ClientSession>> {
        self.sessions.read().await.get(&identity).cloned()
    }

    /// Sessions sorted by identity.
    pub async fn sessions(&self) -> Vec<Arc<ClientSession>> {
        let mut all: Vec<_> = self.sessions.read().await.values().cloned().collect();
        all.sort_by_key(|s| s.identity());
        all
    }

    pub async fn list(&self) -> Vec<SessionInfo> {
        snapshot(&*self.sessions.read().await)
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    /// Close every link and empty the registry.
    pub async fn clear(&self) {
        let mut sessions = self.sessions.write().await;
        for (_, session) in sessions.drain() {
            session.shutdown();
        }
        self.context.publish(HubEvent::SessionsChanged(Vec::new()));
    }
}

fn snapshot(sessions: &HashMap<IpAddr, Arc<ClientSession>>) -> Vec<SessionInfo> {
    let mut infos: Vec<SessionInfo> = sessions.values().map(|s| s.info()).collect();
    infos.sort_by_key(|i| i.identity);
    infos
}
