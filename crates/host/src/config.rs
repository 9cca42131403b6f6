//! Configuration for the docsync host
//!
//! Reads config from ~/.config/docsync/config.toml. Missing keys fall back
//! to the defaults below.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("failed to write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Listener settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_string(),
            port: 9100,
        }
    }
}

/// Per-document authority lifecycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthorityConfig {
    /// Seconds without requests before an authority is compacted
    /// into a snapshot; 0 keeps authorities forever
    pub idle_timeout_secs: u64,
    pub sweep_interval_secs: u64,
    pub mailbox_capacity: usize,
}

impl Default for AuthorityConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 600,
            sweep_interval_secs: 60,
            mailbox_capacity: 256,
        }
    }
}

impl AuthorityConfig {
    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_secs > 0).then(|| Duration::from_secs(self.idle_timeout_secs))
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

/// Per-connection limits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub heartbeat_interval_secs: u64,
    pub heartbeat_timeout_secs: u64,
    /// Token bucket size
    pub rate_burst: f64,
    /// Tokens refilled per second
    pub rate_per_sec: f64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: 30,
            heartbeat_timeout_secs: 300,
            rate_burst: 1000.0,
            rate_per_sec: 100.0,
        }
    }
}

impl ConnectionConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }
}

/// Full host configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub authority: AuthorityConfig,
    pub connection: ConnectionConfig,
}

const DEFAULT_CONFIG: &str = r#"# docsync host configuration

[server]
bind = "127.0.0.1"
port = 9100

[authority]
# Seconds of inactivity before a document is compacted (0 = never)
idle_timeout_secs = 600
sweep_interval_secs = 60
mailbox_capacity = 256

[connection]
heartbeat_interval_secs = 30
heartbeat_timeout_secs = 300
rate_burst = 1000.0
rate_per_sec = 100.0
"#;

impl Config {
    /// Load from the default path, or defaults if there is no file
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::default_config_path();
        if path.exists() {
            Self::load_from_path(&path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("docsync")
            .join("config.toml")
    }

    pub fn load_from_path(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Write the commented default file if nothing is there yet
    pub fn create_default_if_missing(path: &Path) -> Result<bool, ConfigError> {
        if path.exists() {
            return Ok(false);
        }
        let write_err = |source: std::io::Error| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(write_err)?;
        }
        std::fs::write(path, DEFAULT_CONFIG).map_err(write_err)?;
        Ok(true)
    }

    /// `bind:port` for the listener
    pub fn addr(&self) -> String {
        format!("{}:{}", self.server.bind, self.server.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.server.port, 9100);
        assert_eq!(config.addr(), "127.0.0.1:9100");
        assert_eq!(
            config.authority.idle_timeout(),
            Some(Duration::from_secs(600))
        );
    }

    #[test]
    fn test_default_file_matches_defaults() {
        let parsed: Config = toml::from_str(DEFAULT_CONFIG).unwrap();
        assert_eq!(parsed, Config::default());
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let parsed: Config = toml::from_str("[server]\nport = 7000\n\n[authority]\nidle_timeout_secs = 0\n").unwrap();
        assert_eq!(parsed.server.port, 7000);
        assert_eq!(parsed.server.bind, "127.0.0.1");
        assert_eq!(parsed.authority.idle_timeout(), None);
        assert_eq!(parsed.connection, ConnectionConfig::default());
    }

    #[test]
    fn test_create_and_load_from_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("docsync").join("config.toml");

        assert!(Config::create_default_if_missing(&path).unwrap());
        assert!(!Config::create_default_if_missing(&path).unwrap());
        assert_eq!(Config::load_from_path(&path).unwrap(), Config::default());
    }

    #[test]
    fn test_bad_file_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[server]\nport = \"nope\"\n").unwrap();

        let err = Config::load_from_path(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().contains("config.toml"));
    }
}
