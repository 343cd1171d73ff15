//! Hub configuration.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use logpull_transfer::config::{env_override, load_or_create};
use logpull_transfer::DEFAULT_PORT;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Configuration for a hub.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// Listen address
    pub bind_ip: IpAddr,

    /// Listen port
    pub port: u16,

    /// Where received bundles are stored
    pub save_dir: PathBuf,

    /// Admin socket path (for the logpull-admin CLI)
    pub admin_socket: PathBuf,

    /// Interval of the session liveness prober
    pub probe_interval_ms: u64,

    /// Pause before rebuilding a faulted listener
    pub restart_delay_ms: u64,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
            save_dir: PathBuf::from("./logpull-data/logs"),
            admin_socket: PathBuf::from("./logpull-data/admin.sock"),
            probe_interval_ms: 10_000,
            restart_delay_ms: 3_000,
        }
    }
}

impl HubConfig {
    /// Location of `hub.json`: `LOGPULL_HUB_CONFIG` or `./logpull-data/hub.json`.
    pub fn path() -> PathBuf {
        std::env::var("LOGPULL_HUB_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./logpull-data/hub.json"))
    }

    /// Load `hub.json` (created with defaults when missing), then apply
    /// environment overrides.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::path())
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let config: Self = load_or_create(path)?;
        config.with_env()
    }

    /// Apply `LOGPULL_BIND_IP`, `LOGPULL_PORT`, `LOGPULL_SAVE_DIR` and
    /// `LOGPULL_ADMIN_SOCKET`.
    pub fn with_env(mut self) -> Result<Self> {
        self.bind_ip = env_override("LOGPULL_BIND_IP", self.bind_ip)?;
        self.port = env_override("LOGPULL_PORT", self.port)?;
        self.save_dir = env_override("LOGPULL_SAVE_DIR", self.save_dir)?;
        self.admin_socket = env_override("LOGPULL_ADMIN_SOCKET", self.admin_socket)?;
        Ok(self)
    }

    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_ip, self.port)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms.max(1))
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }
}
