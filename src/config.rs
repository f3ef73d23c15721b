//! Configuration for the rendezvous daemon and mesh nodes.
//!
//! One TOML file carries three sections: `[rendezvous]`, `[node]` and
//! `[logging]`. Every field has a default, so a partial file is valid.

use crate::error::AppError;
use crate::types::Identity;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

const IDENTITY_FILE: &str = "identity.json";

/// Platform-specific data directory for imp-mesh
pub fn get_data_dir() -> PathBuf {
    if cfg!(windows) {
        // Windows: %APPDATA%\imp-mesh
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("imp-mesh")
    } else {
        // Linux/Mac: ~/.imp-mesh
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".imp-mesh")
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub rendezvous: RendezvousConfig,
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RendezvousConfig {
    #[serde(default = "default_rendezvous_listen")]
    pub listen_address: String,
    /// Depth of the roster actor's command queue
    #[serde(default = "default_command_buffer")]
    pub command_buffer: usize,
}

fn default_rendezvous_listen() -> String {
    "0.0.0.0:10000".to_string()
}

fn default_command_buffer() -> usize {
    1024
}

impl Default for RendezvousConfig {
    fn default() -> Self {
        Self {
            listen_address: default_rendezvous_listen(),
            command_buffer: default_command_buffer(),
        }
    }
}

impl RendezvousConfig {
    /// Listen address with the port replaced by `$PORT` when it is set.
    pub fn effective_listen_address(&self) -> Result<String, AppError> {
        match std::env::var("PORT") {
            Ok(port) if !port.trim().is_empty() => with_port(&self.listen_address, port.trim()),
            _ => Ok(self.listen_address.clone()),
        }
    }
}

/// Replace the port of `listen` with `port`.
pub fn with_port(listen: &str, port: &str) -> Result<String, AppError> {
    let port: u16 = port
        .parse()
        .map_err(|_| AppError::Config(format!("invalid port '{}'", port)))?;
    let addr: SocketAddr = listen
        .parse()
        .map_err(|_| AppError::Config(format!("invalid listen address '{}'", listen)))?;
    Ok(SocketAddr::new(addr.ip(), port).to_string())
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeConfig {
    #[serde(default = "default_rendezvous_address")]
    pub rendezvous_address: String,
    /// Where this node accepts peer links
    #[serde(default = "default_node_listen")]
    pub listen_address: String,
    /// Endpoint announced to the roster; defaults to the bound listener address
    #[serde(default)]
    pub advertise_address: Option<String>,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_register_timeout")]
    pub register_timeout_secs: u64,
    #[serde(default = "default_dedup_capacity")]
    pub dedup_capacity: usize,
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

fn default_rendezvous_address() -> String {
    "127.0.0.1:10000".to_string()
}

fn default_node_listen() -> String {
    "127.0.0.1:0".to_string()
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_register_timeout() -> u64 {
    10
}

fn default_dedup_capacity() -> usize {
    10_000
}

fn default_event_buffer() -> usize {
    256
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            rendezvous_address: default_rendezvous_address(),
            listen_address: default_node_listen(),
            advertise_address: None,
            connect_timeout_secs: default_connect_timeout(),
            register_timeout_secs: default_register_timeout(),
            dedup_capacity: default_dedup_capacity(),
            event_buffer: default_event_buffer(),
        }
    }
}

impl NodeConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs.max(1))
    }

    pub fn register_timeout(&self) -> Duration {
        Duration::from_secs(self.register_timeout_secs.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// "pretty" or "json"
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Config {
    pub fn load_from_file(path: &str) -> Result<Self, AppError> {
        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Load `path`, writing the defaults there first if it does not exist.
    pub fn load_or_create(path: &str) -> Result<Self, AppError> {
        if fs::metadata(path).is_ok() {
            return Self::load_from_file(path);
        }

        if let Some(parent) = Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let config = Config::default();
        config.save_to_file(path)?;
        tracing::info!("📝 Wrote default configuration to {}", path);
        Ok(config)
    }

    pub fn save_to_file(&self, path: &str) -> Result<(), AppError> {
        let contents = toml::to_string_pretty(self)?;
        fs::write(path, contents)?;
        Ok(())
    }
}

/// Identity chosen on a previous run, if one was stored under `dir`.
pub fn load_identity(dir: &Path) -> Result<Option<Identity>, AppError> {
    let path = dir.join(IDENTITY_FILE);
    if !path.exists() {
        return Ok(None);
    }
    let contents = fs::read_to_string(&path)?;
    let mut identity: Identity = serde_json::from_str(&contents)
        .map_err(|e| AppError::Config(format!("corrupt {}: {}", path.display(), e)))?;
    // Keys are per session
    identity.public_key = None;
    Ok(Some(identity))
}

pub fn save_identity(dir: &Path, identity: &Identity) -> Result<(), AppError> {
    fs::create_dir_all(dir)?;
    let mut stored = identity.clone();
    stored.public_key = None;
    let contents = serde_json::to_string_pretty(&stored)
        .map_err(|e| AppError::Config(format!("failed to encode identity: {}", e)))?;
    fs::write(dir.join(IDENTITY_FILE), contents)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_load_or_create_writes_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("imp.toml");
        let path = path.to_str().unwrap();

        let created = Config::load_or_create(path).unwrap();
        assert_eq!(created, Config::default());

        let reloaded = Config::load_from_file(path).unwrap();
        assert_eq!(reloaded, created);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("imp.toml");
        fs::write(
            &path,
            "[node]\nrendezvous_address = \"10.0.0.1:10000\"\nconnect_timeout_secs = 3\n",
        )
        .unwrap();

        let config = Config::load_from_file(path.to_str().unwrap()).unwrap();
        assert_eq!(config.node.rendezvous_address, "10.0.0.1:10000");
        assert_eq!(config.node.connect_timeout(), Duration::from_secs(3));
        assert_eq!(config.node.dedup_capacity, 10_000);
        assert_eq!(config.rendezvous.listen_address, "0.0.0.0:10000");
        assert_eq!(config.logging.format, "pretty");
    }

    #[test]
    fn test_bad_toml_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("imp.toml");
        fs::write(&path, "[node\n").unwrap();
        assert!(matches!(
            Config::load_from_file(path.to_str().unwrap()),
            Err(AppError::Toml(_))
        ));
    }

    #[test]
    fn test_with_port() {
        assert_eq!(with_port("0.0.0.0:10000", "8080").unwrap(), "0.0.0.0:8080");
        assert!(with_port("0.0.0.0:10000", "http").is_err());
        assert!(with_port("not-an-addr", "8080").is_err());
    }

    #[test]
    fn test_identity_round_trips_without_key() {
        let dir = TempDir::new().unwrap();
        assert!(load_identity(dir.path()).unwrap().is_none());

        let mut identity = Identity::new("Alice Smith", "alice.png");
        identity.public_key = Some("session-key".to_string());
        save_identity(dir.path(), &identity).unwrap();

        let loaded = load_identity(dir.path()).unwrap().unwrap();
        assert_eq!(loaded.id, "alice_smith");
        assert_eq!(loaded.avatar_ref, "alice.png");
        assert!(loaded.public_key.is_none());
    }
}
