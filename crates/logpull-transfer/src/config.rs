//! JSON configuration files shared by hub and agent.

use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Error, Result};

/// Load a config file, or write the defaults there and return them.
pub fn load_or_create<T>(path: &Path) -> Result<T>
where
    T: Serialize + DeserializeOwned + Default,
{
    let config_err = |reason: String| Error::Config {
        path: path.to_path_buf(),
        reason,
    };

    if path.exists() {
        let raw = std::fs::read_to_string(path).map_err(|e| config_err(e.to_string()))?;
        let config = serde_json::from_str(&raw).map_err(|e| config_err(e.to_string()))?;
        tracing::info!("Configuration loaded from {:?}", path);
        return Ok(config);
    }

    let config = T::default();
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| config_err(e.to_string()))?;
    }
    let raw = serde_json::to_string_pretty(&config).map_err(|e| config_err(e.to_string()))?;
    std::fs::write(path, raw + "\n").map_err(|e| config_err(e.to_string()))?;
    tracing::warn!("No configuration found, defaults written to {:?}", path);

    Ok(config)
}

/// Parse an environment variable, keeping `current` when unset.
pub fn env_override<T>(name: &str, current: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw.trim().parse().map_err(|e: T::Err| Error::Config {
            path: name.into(),
            reason: format!("invalid value {:?}: {}", raw, e),
        }),
        Err(_) => Ok(current),
    }
}
