//! Harness for end-to-end tests: a real hub and real agents over loopback.
//!
//! Each agent binds its own loopback address (`127.0.0.x`) so several agent
//! identities can share one machine.

use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use logpull_agent::{AgentConfig, AgentNode, Artifact, ArtifactSource};
use logpull_hub::{HubConfig, HubContext, HubNode};
use logpull_transfer::{bind_listener, ByteCounter, Signal, LISTEN_BACKLOG};
use tokio::task::JoinHandle;

/// Artifact of fixed size and deterministic content.
pub struct FixedArtifact {
    dir: PathBuf,
    len: usize,
    builds: AtomicU32,
    cleanups: AtomicU32,
}

impl FixedArtifact {
    pub fn new(dir: &Path, len: usize) -> Arc<Self> {
        Arc::new(Self {
            dir: dir.to_path_buf(),
            len,
            builds: AtomicU32::new(0),
            cleanups: AtomicU32::new(0),
        })
    }

    pub fn content(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 253) as u8).collect()
    }

    pub fn builds(&self) -> u32 {
        self.builds.load(Ordering::SeqCst)
    }

    pub fn cleanups(&self) -> u32 {
        self.cleanups.load(Ordering::SeqCst)
    }
}

impl ArtifactSource for FixedArtifact {
    fn build(&self) -> std::io::Result<Artifact> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        std::fs::create_dir_all(&self.dir)?;
        let path = self.dir.join("artifact.bin");
        std::fs::write(&path, Self::content(self.len))?;
        Ok(Artifact {
            path,
            len: self.len as u64,
        })
    }

    fn cleanup(&self) -> std::io::Result<()> {
        self.cleanups.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// A hub serving on an ephemeral loopback port.
pub struct TestHub {
    pub node: Arc<HubNode>,
    pub addr: SocketAddr,
    tasks: Vec<JoinHandle<()>>,
}

impl TestHub {
    pub async fn start(dir: &Path) -> Self {
        let config = HubConfig {
            bind_ip: "127.0.0.1".parse().unwrap(),
            port: 0,
            save_dir: dir.join("saved"),
            admin_socket: dir.join("admin.sock"),
            probe_interval_ms: 100,
            restart_delay_ms: 50,
        };
        let node = Arc::new(HubNode::new(config, HubContext::new()));
        let listener = bind_listener("127.0.0.1:0".parse().unwrap(), LISTEN_BACKLOG).unwrap();
        let addr = listener.local_addr().unwrap();

        let serving = {
            let node = Arc::clone(&node);
            tokio::spawn(async move {
                let fault = node.serve(listener).await;
                tracing::error!("Test hub listener stopped: {}", fault);
            })
        };
        let prober = node.spawn_prober();

        Self {
            node,
            addr,
            tasks: vec![serving, prober],
        }
    }

    pub fn save_dir(&self) -> PathBuf {
        self.node.config().save_dir.clone()
    }

    /// Wait until exactly the given identities are registered.
    ///
    /// Admission includes a bounded host-name lookup per agent, so allow a
    /// few seconds.
    pub async fn wait_for_clients(&self, identities: &[IpAddr]) {
        let registry = self.node.registry();
        let mut want = identities.to_vec();
        want.sort();

        for _ in 0..500 {
            let have: Vec<IpAddr> =
                registry.list().await.into_iter().map(|i| i.identity).collect();
            if have == want {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("clients {:?} never registered", want);
    }
}

impl Drop for TestHub {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// An agent process bound to its own loopback address.
pub struct TestAgent {
    pub ip: IpAddr,
    pub progress: Arc<ByteCounter>,
    shutdown: Arc<Signal>,
    task: JoinHandle<()>,
}

impl TestAgent {
    pub fn start(hub: SocketAddr, ip: &str, source: Arc<dyn ArtifactSource>) -> Self {
        let ip: IpAddr = ip.parse().unwrap();
        let config = AgentConfig {
            hub_ip: hub.ip(),
            hub_port: hub.port(),
            bind_ip: Some(ip),
            reconnect_delay_ms: 50,
            probe_interval_ms: 100,
            ..AgentConfig::default()
        };

        let progress = Arc::new(ByteCounter::new());
        let node = AgentNode::new(config, source, progress.clone());
        let shutdown = node.shutdown_handle();
        let task = tokio::spawn(async move { node.run().await });

        Self {
            ip,
            progress,
            shutdown,
            task,
        }
    }

    pub async fn stop(self) {
        self.shutdown.set();
        let _ = tokio::time::timeout(Duration::from_secs(2), self.task).await;
    }
}
