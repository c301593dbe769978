// Configuration for the p2pcat CLI
//
// Optional JSON file, by default at:
// - macOS: ~/Library/Application Support/p2pcat/config.json
// - Linux: ~/.config/p2pcat/config.json
// - Windows: %APPDATA%\p2pcat\config.json
//
// A missing file means defaults; nothing is written back.

use anyhow::{Context, Result};
use p2pcat_core::{Multiaddr, NodeConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Addresses the responder listens on
    pub listen_addrs: Vec<String>,

    /// Seconds an unused connection is kept open
    pub idle_connection_timeout_secs: u64,

    /// Log filter used when neither RUST_LOG nor -v is given
    pub log_filter: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addrs: NodeConfig::default_listen_addrs()
                .iter()
                .map(ToString::to_string)
                .collect(),
            idle_connection_timeout_secs: NodeConfig::DEFAULT_IDLE_CONNECTION_TIMEOUT.as_secs(),
            log_filter: "warn".to_string(),
        }
    }
}

impl Config {
    /// Default config file path (cross-platform)
    pub fn default_path() -> Result<PathBuf> {
        Ok(dirs::config_dir()
            .context("Failed to determine config directory")?
            .join("p2pcat")
            .join("config.json"))
    }

    /// Load from `path`, or from the default location when `None`. Without a
    /// config directory there is no default file, so defaults apply.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_or_default(path, Self::default_path().ok())
    }

    fn load_or_default(path: Option<&Path>, default_path: Option<PathBuf>) -> Result<Self> {
        match (path, default_path) {
            (Some(path), _) => Self::load_from(path),
            (None, Some(default_path)) => Self::load_from(&default_path),
            (None, None) => Ok(Self::default()),
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    /// Node settings for one role. Only a listening node uses `listen_addrs`.
    pub fn node_config(&self, listening: bool, routed: bool) -> Result<NodeConfig> {
        let listen_addrs = if listening {
            self.listen_addrs
                .iter()
                .map(|addr| {
                    addr.parse::<Multiaddr>()
                        .with_context(|| format!("Invalid listen address in config: {}", addr))
                })
                .collect::<Result<Vec<_>>>()?
        } else {
            Vec::new()
        };

        Ok(NodeConfig {
            listen_addrs,
            routing: routed,
            idle_connection_timeout: Duration::from_secs(self.idle_connection_timeout_secs),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_yields_defaults_without_creating_it() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");

        let config = Config::load(Some(&path)).unwrap();

        assert_eq!(config, Config::default());
        assert!(!path.exists());
    }

    #[test]
    fn test_no_config_directory_yields_defaults() {
        let config = Config::load_or_default(None, None).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_explicit_path_wins_over_default_location() {
        let dir = TempDir::new().unwrap();
        let explicit = dir.path().join("explicit.json");
        let default = dir.path().join("default.json");
        std::fs::write(&explicit, r#"{ "log_filter": "debug" }"#).unwrap();
        std::fs::write(&default, r#"{ "log_filter": "trace" }"#).unwrap();

        let config = Config::load_or_default(Some(&explicit), Some(default.clone())).unwrap();
        assert_eq!(config.log_filter, "debug");

        let config = Config::load_or_default(None, Some(default)).unwrap();
        assert_eq!(config.log_filter, "trace");
    }

    #[test]
    fn test_partial_file_fills_in_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{ "log_filter": "debug" }"#).unwrap();

        let config = Config::load_from(&path).unwrap();

        assert_eq!(config.log_filter, "debug");
        assert_eq!(config.listen_addrs, Config::default().listen_addrs);
        assert_eq!(config.idle_connection_timeout_secs, 60);
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{ not json").unwrap();

        assert!(Config::load_from(&path).is_err());
    }

    #[test]
    fn test_node_config_for_each_role() {
        let config = Config {
            listen_addrs: vec!["/ip4/127.0.0.1/tcp/4001".to_string()],
            idle_connection_timeout_secs: 5,
            ..Config::default()
        };

        let listening = config.node_config(true, true).unwrap();
        assert_eq!(listening.listen_addrs.len(), 1);
        assert!(listening.routing);
        assert_eq!(listening.idle_connection_timeout, Duration::from_secs(5));

        let outbound = config.node_config(false, false).unwrap();
        assert!(outbound.listen_addrs.is_empty());
        assert!(!outbound.routing);
    }

    #[test]
    fn test_bad_listen_address_rejected() {
        let config = Config {
            listen_addrs: vec!["not-a-multiaddr".to_string()],
            ..Config::default()
        };

        assert!(config.node_config(true, false).is_err());
        // Unused by an outbound-only node
        assert!(config.node_config(false, false).is_ok());
    }
}
