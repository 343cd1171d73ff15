//! Agent configuration.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use logpull_transfer::config::{env_override, load_or_create};
use logpull_transfer::DEFAULT_PORT;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Configuration for an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Hub address to connect to
    pub hub_ip: IpAddr,

    /// Hub port
    pub hub_port: u16,

    /// Local address to connect from (the agent's identity on the hub)
    pub bind_ip: Option<IpAddr>,

    /// Delay between connect attempts and after a session ends
    pub reconnect_delay_ms: u64,

    /// Interval of the self-probe while waiting for commands
    pub probe_interval_ms: u64,

    /// Directories bundled into the artifact
    pub log_dirs: Vec<PathBuf>,

    /// Where the artifact is staged before sending
    pub staging_dir: PathBuf,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            hub_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            hub_port: DEFAULT_PORT,
            bind_ip: None,
            reconnect_delay_ms: 3_000,
            probe_interval_ms: 10_000,
            log_dirs: vec![PathBuf::from("./log"), PathBuf::from("./conf")],
            staging_dir: std::env::temp_dir().join("logpull-staging"),
        }
    }
}

impl AgentConfig {
    /// Load `agent.json` (created with defaults when missing), then apply
    /// environment overrides.
    pub fn load() -> Result<Self> {
        let path = std::env::var("LOGPULL_AGENT_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./logpull-data/agent.json"));

        let config: Self = load_or_create(&path)?;
        config.with_env()
    }

    /// Apply `LOGPULL_HUB_IP`, `LOGPULL_HUB_PORT` and `LOGPULL_AGENT_BIND_IP`.
    pub fn with_env(mut self) -> Result<Self> {
        self.hub_ip = env_override("LOGPULL_HUB_IP", self.hub_ip)?;
        self.hub_port = env_override("LOGPULL_HUB_PORT", self.hub_port)?;
        if let Ok(raw) = std::env::var("LOGPULL_AGENT_BIND_IP") {
            let ip = raw.trim().parse().map_err(|e| {
                crate::Error::Config(format!("LOGPULL_AGENT_BIND_IP {:?}: {}", raw, e))
            })?;
            self.bind_ip = Some(ip);
        }
        Ok(self)
    }

    /// Hub endpoint.
    pub fn hub_addr(&self) -> SocketAddr {
        SocketAddr::new(self.hub_ip, self.hub_port)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_point_at_local_hub() {
        let config = AgentConfig::default();
        assert_eq!(config.hub_addr(), "127.0.0.1:60100".parse().unwrap());
        assert_eq!(config.reconnect_delay(), Duration::from_secs(3));
        assert!(config.bind_ip.is_none());
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let config: AgentConfig = serde_json::from_str(r#"{"hub_ip": "10.0.0.5"}"#).unwrap();
        assert_eq!(config.hub_addr(), "10.0.0.5:60100".parse().unwrap());
        assert_eq!(config.probe_interval(), Duration::from_secs(10));
    }
}
