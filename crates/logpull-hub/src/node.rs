//! Hub Node - the main application entry point.
//!
//! Architecture:
//! - TCP listener accepting agent links, rebuilt after any fault or on request
//! - Prober task evicting dead sessions
//! - Unix admin socket for local operator commands (logpull-admin CLI)

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use logpull_transfer::command::ALREADY_CONNECTED;
use logpull_transfer::{bind_listener, Command, PeerLink, Signal, LISTEN_BACKLOG};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use crate::admin_socket::AdminSocket;
use crate::config::HubConfig;
use crate::context::{HubContext, StatusLevel};
use crate::error::{Error, Result};
use crate::orchestrator::Orchestrator;
use crate::registry::{resolve_host_name, ClientRegistry, Registration};

/// Listener settings plus the wake-up that makes the listener rebind.
#[derive(Debug)]
pub struct ListenerControl {
    settings: RwLock<HubConfig>,
    /// Re-read on every restart request when set
    config_path: Option<PathBuf>,
    restart: Signal,
}

impl ListenerControl {
    fn new(config: HubConfig, config_path: Option<PathBuf>) -> Self {
        Self {
            settings: RwLock::new(config),
            config_path,
            restart: Signal::new(),
        }
    }

    /// Settings the next bind will use.
    pub async fn settings(&self) -> HubConfig {
        self.settings.read().await.clone()
    }

    /// Reload the config file if there is one, then drop the current
    /// listener and bind again. Returns the address of the new listener.
    ///
    /// Only the listen address and restart delay take effect; sessions stay
    /// connected.
    pub async fn request_restart(&self) -> Result<SocketAddr> {
        if let Some(path) = &self.config_path {
            let reloaded = HubConfig::load_from(path)
                .map_err(|e| Error::Config(format!("reload of {:?} failed: {}", path, e)))?;
            *self.settings.write().await = reloaded;
        }

        let addr = self.settings.read().await.listen_addr();
        tracing::info!("Listener restart requested, next bind on {}", addr);
        self.restart.set();
        Ok(addr)
    }
}

/// A hub instance.
pub struct HubNode {
    config: HubConfig,
    context: HubContext,
    registry: Arc<ClientRegistry>,
    orchestrator: Arc<Orchestrator>,
    listener: Arc<ListenerControl>,
    shutdown: Arc<Signal>,
}

impl HubNode {
    pub fn new(config: HubConfig, context: HubContext) -> Self {
        let registry = Arc::new(ClientRegistry::new(context.clone()));
        let orchestrator = Arc::new(Orchestrator::new(
            Arc::clone(&registry),
            context.clone(),
            config.save_dir.clone(),
        ));
        let listener = Arc::new(ListenerControl::new(config.clone(), None));

        Self {
            config,
            context,
            registry,
            orchestrator,
            listener,
            shutdown: Arc::new(Signal::new()),
        }
    }

    /// Reload listener settings from `path` on every restart request.
    pub fn with_config_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.listener = Arc::new(ListenerControl::new(self.config.clone(), Some(path.into())));
        self
    }

    /// Configuration the node was started with.
    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    pub fn context(&self) -> &HubContext {
        &self.context
    }

    pub fn registry(&self) -> Arc<ClientRegistry> {
        Arc::clone(&self.registry)
    }

    pub fn orchestrator(&self) -> Arc<Orchestrator> {
        Arc::clone(&self.orchestrator)
    }

    pub fn listener_control(&self) -> Arc<ListenerControl> {
        Arc::clone(&self.listener)
    }

    /// Handle that stops [`run`](Self::run) when set.
    pub fn shutdown_handle(&self) -> Arc<Signal> {
        Arc::clone(&self.shutdown)
    }

    /// Run the hub (starts admin socket, prober and listener) until shutdown.
    pub async fn run(&self) -> Result<()> {
        tracing::info!("Hub starting");
        tracing::info!("  Listen: {}", self.config.listen_addr());
        tracing::info!("  Save dir: {:?}", self.config.save_dir);
        tracing::info!("  Admin: {:?}", self.config.admin_socket);

        let admin = AdminSocket::new(self.orchestrator(), self.config.admin_socket.clone())
            .with_listener_control(self.listener_control());
        let admin_task = tokio::spawn(async move {
            if let Err(e) = admin.run().await {
                tracing::error!("Admin socket error: {}", e);
            }
        });
        let prober = self.spawn_prober();

        tokio::select! {
            _ = self.listen_forever() => {}
            _ = self.shutdown.wait() => {
                tracing::info!("Hub shutting down");
            }
        }

        prober.abort();
        admin_task.abort();
        self.registry.clear().await;
        Ok(())
    }

    /// Bind and serve; rebuild the listener after every fault and whenever a
    /// restart is requested.
    async fn listen_forever(&self) {
        loop {
            // Requests made before this bind are satisfied by it
            self.listener.restart.reset();
            let settings = self.listener.settings().await;
            let addr = settings.listen_addr();

            let fault = match bind_listener(addr, LISTEN_BACKLOG) {
                Ok(listener) => tokio::select! {
                    fault = self.serve(listener) => Some(fault),
                    _ = self.listener.restart.wait() => None,
                },
                Err(e) => Some(e.into()),
            };

            let Some(fault) = fault else {
                self.context
                    .status(StatusLevel::Info, format!("Listener on {} restarting", addr));
                continue;
            };

            let delay = settings.restart_delay();
            tracing::error!("Listener on {} failed: {}. Restarting in {:?}", addr, fault, delay);
            self.context
                .status(StatusLevel::Error, format!("Listener restarting: {}", fault));

            // An operator restart cuts the pause short
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.listener.restart.wait() => {}
            }
        }
    }

    /// Accept agents on `listener` until accept fails.
    pub async fn serve(&self, listener: TcpListener) -> Error {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    tracing::debug!("Accepted connection from {}", addr);
                    self.admit(stream).await;
                }
                Err(e) => return e.into(),
            }
        }
    }

    async fn admit(&self, stream: TcpStream) {
        let link = match PeerLink::from_stream(stream) {
            Ok(link) => link,
            Err(e) => {
                tracing::warn!("Dropping accepted connection: {}", e);
                return;
            }
        };
        let host_name = resolve_host_name(link.remote_addr().ip()).await;

        match self.registry.register(link, host_name).await {
            Registration::Added(session) | Registration::Replaced(session) => {
                self.context.status(
                    StatusLevel::Info,
                    format!("{} ({}) connected", session.identity(), session.host_name()),
                );
            }
            Registration::Rejected(mut link) => {
                let reply = Command::Other(ALREADY_CONNECTED.to_string());
                if let Err(e) = link.send_command(&reply).await {
                    tracing::debug!("Could not notify duplicate {}: {}", link.remote_addr(), e);
                }
                link.close();
            }
        }
    }

    /// Periodically evict sessions whose links probe dead.
    pub fn spawn_prober(&self) -> JoinHandle<()> {
        let registry = Arc::clone(&self.registry);
        let context = self.context.clone();
        let period = self.config.probe_interval();
        tokio::spawn(probe_loop(registry, context, period))
    }
}

async fn probe_loop(registry: Arc<ClientRegistry>, context: HubContext, period: Duration) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        let evicted = registry.evict_dead().await;
        for identity in evicted {
            tracing::warn!("Client {} stopped responding, removed", identity);
            context.status(StatusLevel::Warn, format!("{} disconnected", identity));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::HubEvent;
    use tokio::sync::broadcast::Receiver;

    fn test_config(dir: &std::path::Path) -> HubConfig {
        HubConfig {
            bind_ip: "127.0.0.1".parse().unwrap(),
            port: 0,
            save_dir: dir.join("logs"),
            admin_socket: dir.join("admin.sock"),
            probe_interval_ms: 30,
            restart_delay_ms: 20,
        }
    }

    #[tokio::test]
    async fn test_duplicate_gets_already_connected() {
        let dir = tempfile::tempdir().unwrap();
        let node = Arc::new(HubNode::new(test_config(dir.path()), HubContext::new()));
        let listener = bind_listener("127.0.0.1:0".parse().unwrap(), LISTEN_BACKLOG).unwrap();
        let addr = listener.local_addr().unwrap();
        {
            let node = Arc::clone(&node);
            tokio::spawn(async move { node.serve(listener).await });
        }

        let _first = PeerLink::connect(addr, None).await.unwrap();
        let mut second = PeerLink::connect(addr, None).await.unwrap();

        let reply = second.recv_command().await.unwrap();
        assert_eq!(reply, Command::Other(ALREADY_CONNECTED.to_string()));
        assert_eq!(node.registry().len().await, 1);
    }

    #[tokio::test]
    async fn test_prober_evicts_dead_session() {
        let dir = tempfile::tempdir().unwrap();
        let node = Arc::new(HubNode::new(test_config(dir.path()), HubContext::new()));
        let listener = bind_listener("127.0.0.1:0".parse().unwrap(), LISTEN_BACKLOG).unwrap();
        let addr = listener.local_addr().unwrap();
        {
            let node = Arc::clone(&node);
            tokio::spawn(async move { node.serve(listener).await });
        }
        let prober = node.spawn_prober();

        let mut agent = PeerLink::connect(addr, None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(node.registry().len().await, 1);

        agent.close();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(node.registry().is_empty().await);
        prober.abort();
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let node = HubNode::new(test_config(dir.path()), HubContext::new());
        let shutdown = node.shutdown_handle();

        let stopper = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            shutdown.set();
        });

        tokio::time::timeout(Duration::from_secs(2), node.run()).await.unwrap().unwrap();
        stopper.await.unwrap();
    }

    /// A loopback port that was free a moment ago.
    fn free_port() -> u16 {
        let reserved = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        reserved.local_addr().unwrap().port()
    }

    async fn wait_for_len(node: &HubNode, len: usize) {
        for _ in 0..300 {
            if node.registry().len().await == len {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("registry never reached {} session(s)", len);
    }

    async fn wait_for_status(events: &mut Receiver<HubEvent>, level: StatusLevel, needle: &str) {
        let found = tokio::time::timeout(Duration::from_secs(3), async {
            loop {
                if let Ok(HubEvent::Status { level: seen, text }) = events.recv().await {
                    if seen == level && text.contains(needle) {
                        return;
                    }
                }
            }
        })
        .await;
        assert!(found.is_ok(), "no {:?} status containing {:?}", level, needle);
    }

    #[tokio::test]
    async fn test_listener_rebinds_after_bind_fault() {
        let dir = tempfile::tempdir().unwrap();
        // Another socket owns the port, so the first bind fails
        let blocker = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = blocker.local_addr().unwrap();
        let config = HubConfig {
            port: addr.port(),
            restart_delay_ms: 30,
            ..test_config(dir.path())
        };
        let node = Arc::new(HubNode::new(config, HubContext::new()));
        let mut events = node.context().subscribe();
        let running = {
            let node = Arc::clone(&node);
            tokio::spawn(async move { node.run().await })
        };

        wait_for_status(&mut events, StatusLevel::Error, "Listener restarting").await;
        assert!(node.registry().is_empty().await);
        drop(blocker);

        let _agent = PeerLink::connect_with_retry(addr, None, Duration::from_millis(10)).await;
        wait_for_len(&node, 1).await;

        node.shutdown_handle().set();
        running.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_restart_request_rebinds_and_keeps_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let config = HubConfig {
            port: free_port(),
            ..test_config(dir.path())
        };
        let addr = config.listen_addr();
        let node = Arc::new(HubNode::new(config, HubContext::new()));
        let mut events = node.context().subscribe();
        let running = {
            let node = Arc::clone(&node);
            tokio::spawn(async move { node.run().await })
        };

        let retry = Duration::from_millis(10);
        let first_ip = Some("127.0.0.2".parse().unwrap());
        let _first = PeerLink::connect_with_retry(addr, first_ip, retry).await;
        wait_for_len(&node, 1).await;

        assert_eq!(node.listener_control().request_restart().await.unwrap(), addr);
        wait_for_status(&mut events, StatusLevel::Info, "restarting").await;

        let second_ip = Some("127.0.0.3".parse().unwrap());
        let _second = PeerLink::connect_with_retry(addr, second_ip, retry).await;
        wait_for_len(&node, 2).await;

        node.shutdown_handle().set();
        running.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_restart_reloads_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hub.json");
        let port = free_port();
        std::fs::write(&path, format!(r#"{{"bind_ip": "127.0.0.1", "port": {}}}"#, port)).unwrap();

        let node = HubNode::new(test_config(dir.path()), HubContext::new()).with_config_path(&path);
        let control = node.listener_control();

        let addr = control.request_restart().await.unwrap();
        assert_eq!(addr, SocketAddr::new("127.0.0.1".parse().unwrap(), port));
        assert_eq!(control.settings().await.port, port);
        assert!(control.restart.is_set());
    }

    #[tokio::test]
    async fn test_bad_config_keeps_listener() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hub.json");
        std::fs::write(&path, "{ not json").unwrap();

        let config = test_config(dir.path());
        let node = HubNode::new(config.clone(), HubContext::new()).with_config_path(&path);
        let control = node.listener_control();

        assert!(matches!(control.request_restart().await, Err(Error::Config(_))));
        assert!(!control.restart.is_set());
        assert_eq!(control.settings().await, config);
    }
}
