//! Client and server configuration.
//!
//! Configuration lives in a small YAML document shared between a model server and the clients
//! that talk to it. The server writes it once it is listening; clients read it to find out where
//! to connect, which species the model supports and how far its influence reaches.
//!
//! # Layout
//!
//! ```yaml
//! server:
//!   host: 127.0.0.1
//!   port: 12345
//!   timeout_send_ms: 15000
//!   timeout_recv_ms: 15000
//!   connection: persistent
//! model:
//!   species: [He]
//!   influence_distance: 2.6
//! protocol: ip
//! protocol_version: 1
//! ```
//!
//! A timeout of `0` disables it. Older files name the model block `global` and its species list
//! `elements`; both spellings are accepted. Keys this crate does not know about are ignored.
//!
//! # Locating the file
//!
//! [`KuspConfig::locate`] checks, in order, an explicit path, the `KUSP_CONFIG` and
//! `KUSP_SERVER_CONFIG` environment variables and finally `./kusp_config.yaml`.
use std::{
    env, fs, io,
    path::{Path, PathBuf},
    time::Duration,
};

use log::{debug, info};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::protocol::{Endpoint, ReusePolicy};

/// Configuration key controlling the send timeout.
pub const SEND_TIMEOUT_KEY: &str = "server.timeout_send_ms";
/// Configuration key controlling the receive timeout.
pub const RECV_TIMEOUT_KEY: &str = "server.timeout_recv_ms";

pub const CONFIG_ENV: &str = "KUSP_CONFIG";
pub const LEGACY_CONFIG_ENV: &str = "KUSP_SERVER_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "./kusp_config.yaml";

pub const PROTOCOL: &str = "ip";
pub const PROTOCOL_VERSION: u32 = 1;

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 12345;
const DEFAULT_TIMEOUT_MS: u64 = 15_000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config '{}': {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to write config '{}': {source}", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("unsupported protocol '{0}', only '{expected}' is available", expected = PROTOCOL)]
    UnsupportedProtocol(String),

    #[error("unsupported protocol version {0}, expected {expected}", expected = PROTOCOL_VERSION)]
    UnsupportedVersion(u32),

    #[error("invalid value for '{key}': {reason}")]
    Invalid { key: &'static str, reason: String },
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_timeout_ms")]
    pub timeout_send_ms: u64,
    #[serde(default = "default_timeout_ms")]
    pub timeout_recv_ms: u64,
    #[serde(default)]
    pub connection: ReusePolicy,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            timeout_send_ms: DEFAULT_TIMEOUT_MS,
            timeout_recv_ms: DEFAULT_TIMEOUT_MS,
            connection: ReusePolicy::default(),
        }
    }
}

impl ServerConfig {
    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(self.host.clone(), self.port)
            .with_send_timeout(timeout_from_millis(self.timeout_send_ms))
            .with_recv_timeout(timeout_from_millis(self.timeout_recv_ms))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct ModelConfig {
    #[serde(default, alias = "elements")]
    pub species: Vec<String>,
    #[serde(default)]
    pub influence_distance: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct KuspConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default, alias = "global")]
    pub model: ModelConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol_version: Option<u32>,
}

impl KuspConfig {
    /// Configuration a server publishes for its clients.
    pub fn for_server(host: impl Into<String>, port: u16, model: ModelConfig) -> Self {
        Self {
            server: ServerConfig {
                host: host.into(),
                port,
                ..ServerConfig::default()
            },
            model,
            protocol: Some(PROTOCOL.to_string()),
            protocol_version: Some(PROTOCOL_VERSION),
        }
    }

    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_yaml(&self) -> Result<String, ConfigError> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        debug!("reading config from {}", path.display());
        let yaml = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&yaml)
    }

    /// Loads the file found by [`locate`](Self::locate).
    pub fn load_default(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        Self::load(&Self::locate(explicit))
    }

    pub fn locate(explicit: Option<&Path>) -> PathBuf {
        if let Some(path) = explicit {
            return path.to_path_buf();
        }
        [CONFIG_ENV, LEGACY_CONFIG_ENV]
            .into_iter()
            .find_map(|var| env::var_os(var).filter(|v| !v.is_empty()))
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
    }

    /// Writes the configuration next to `path` first and renames it into place, so readers
    /// never observe a half-written file.
    pub fn write(&self, path: &Path) -> Result<(), ConfigError> {
        let yaml = self.to_yaml()?;
        let write_error = |source: io::Error| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(write_error)?;
        }

        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        fs::write(&tmp, yaml).map_err(write_error)?;
        fs::rename(&tmp, path).map_err(write_error)?;

        info!("config written to {}", path.display());
        Ok(())
    }

    pub fn endpoint(&self) -> Endpoint {
        self.server.endpoint()
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if let Some(protocol) = &self.protocol {
            if protocol != PROTOCOL {
                return Err(ConfigError::UnsupportedProtocol(protocol.clone()));
            }
        }
        if let Some(version) = self.protocol_version {
            if version != PROTOCOL_VERSION {
                return Err(ConfigError::UnsupportedVersion(version));
            }
        }
        if self.server.host.trim().is_empty() {
            return Err(ConfigError::Invalid {
                key: "server.host",
                reason: "empty host".to_string(),
            });
        }
        if self.server.port == 0 {
            return Err(ConfigError::Invalid {
                key: "server.port",
                reason: "port 0 cannot be connected to".to_string(),
            });
        }
        let distance = self.model.influence_distance;
        if !distance.is_finite() || distance < 0.0 {
            return Err(ConfigError::Invalid {
                key: "model.influence_distance",
                reason: format!("{distance} is not a non-negative distance"),
            });
        }
        Ok(())
    }
}

/// `0` means the operation may block forever.
pub fn timeout_from_millis(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

fn default_host() -> String {
    DEFAULT_HOST.to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT_MS
}

#[cfg(test)]
mod tests {
    use tempdir::TempDir;

    use crate::protocol::DEFAULT_TIMEOUT;

    use super::*;

    #[test]
    fn parses_full_config() {
        let yaml = r#"
kusp_version: 2.0.0
protocol: ip
protocol_version: 1
server:
  host: 10.0.0.2
  port: 4000
  timeout_send_ms: 2500
  timeout_recv_ms: 0
  connection: per_call
model:
  species: [Si, O]
  influence_distance: 5.5
meta:
  pid: 42
"#;
        let config = KuspConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.server.host, "10.0.0.2");
        assert_eq!(config.server.connection, ReusePolicy::PerCall);
        assert_eq!(config.model.species, vec!["Si", "O"]);
        assert_eq!(config.model.influence_distance, 5.5);

        let endpoint = config.endpoint();
        assert_eq!(endpoint.port, 4000);
        assert_eq!(endpoint.send_timeout, Some(Duration::from_millis(2500)));
        assert_eq!(endpoint.recv_timeout, None);
    }

    #[test]
    fn accepts_legacy_layout() {
        let yaml = r#"
server:
  host: 127.0.0.1
  port: 12345
global:
  influence_distance: 2.6
  elements: [He]
"#;
        let config = KuspConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.model.species, vec!["He"]);
        assert_eq!(config.model.influence_distance, 2.6);
        assert_eq!(config.server.connection, ReusePolicy::Persistent);

        let endpoint = config.endpoint();
        assert_eq!(endpoint.send_timeout, Some(DEFAULT_TIMEOUT));
        assert_eq!(endpoint.recv_timeout, Some(DEFAULT_TIMEOUT));
    }

    #[test]
    fn rejects_other_protocols() {
        let err = KuspConfig::from_yaml("protocol: shmem\n").unwrap_err();
        assert!(matches!(err, ConfigError::UnsupportedProtocol(p) if p == "shmem"));

        let err = KuspConfig::from_yaml("protocol_version: 2\n").unwrap_err();
        assert!(matches!(err, ConfigError::UnsupportedVersion(2)));
    }

    #[test]
    fn rejects_invalid_values() {
        let err = KuspConfig::from_yaml("server:\n  port: 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "server.port", .. }));

        let err = KuspConfig::from_yaml("model:\n  influence_distance: -1.0\n").unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                key: "model.influence_distance",
                ..
            }
        ));
    }

    #[test]
    fn write_then_load() {
        let temp = TempDir::new("config").unwrap();
        let path = temp.path().join("nested").join("kusp_config.yaml");
        let model = ModelConfig {
            species: vec!["He".to_string()],
            influence_distance: 2.6,
        };
        let config = KuspConfig::for_server("127.0.0.1", 23456, model);

        config.write(&path).unwrap();
        assert!(!path.with_extension("yaml.tmp").exists());

        let loaded = KuspConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
        assert_eq!(loaded.protocol_version, Some(PROTOCOL_VERSION));
    }

    #[test]
    fn missing_file_is_read_error() {
        let temp = TempDir::new("config").unwrap();
        let err = KuspConfig::load(&temp.path().join("absent.yaml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn explicit_path_wins() {
        let path = Path::new("/tmp/explicit.yaml");
        assert_eq!(KuspConfig::locate(Some(path)), path);
    }

    #[test]
    fn zero_disables_timeouts() {
        assert_eq!(timeout_from_millis(0), None);
        assert_eq!(timeout_from_millis(1500), Some(Duration::from_millis(1500)));
    }
}
