//! Configuration for the alumchat client.
//!
//! Loaded from `config.toml` under the platform config directory
//! (`~/.config/alumchat/config.toml` on Linux). Every section has
//! defaults, so a missing file is not an error.

use std::path::PathBuf;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to determine platform config directory")]
    NoConfigDir,

    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to write config file {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

/// The fixed service the client talks to.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Account domain.
    pub domain: String,
    /// MUC conference domain.
    pub conference_domain: String,
    /// Server host to dial (defaults to the domain).
    pub server: Option<String>,
    /// Server port.
    pub port: u16,
    /// Connection-level I/O timeout in seconds.
    pub timeout_seconds: u32,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            domain: "alumchat.xyz".into(),
            conference_domain: "conference.alumchat.xyz".into(),
            server: None,
            port: 5222,
            timeout_seconds: 30,
        }
    }
}

/// Presence probe timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PresenceConfig {
    /// How long a probe waits for an answer before assuming Offline.
    pub probe_timeout_ms: u64,
    /// Extra debounce after a matching answer, against flapping.
    pub settle_delay_ms: u64,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            probe_timeout_ms: 2000,
            settle_delay_ms: 500,
        }
    }
}

/// File transfer tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// In-band bytestream block size in bytes.
    pub block_size: u16,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self { block_size: 4096 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub service: ServiceConfig,
    pub presence: PresenceConfig,
    pub transfer: TransferConfig,
}

impl Config {
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::config_file_path()?;
        Self::load_from(&path)
    }

    pub fn load_from(path: &PathBuf) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("no config file found, using defaults");
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;
        let config = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.clone(),
            source,
        })?;
        tracing::info!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    pub fn save(&self) -> Result<(), ConfigError> {
        let path = Self::config_file_path()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| ConfigError::Write {
                path: path.clone(),
                source,
            })?;
        }

        // to_string_pretty only fails on non-serializable values, which the
        // config structs cannot contain.
        let content = toml::to_string_pretty(self).unwrap_or_default();
        std::fs::write(&path, content).map_err(|source| ConfigError::Write {
            path: path.clone(),
            source,
        })?;
        Ok(())
    }

    pub fn config_file_path() -> Result<PathBuf, ConfigError> {
        let dirs =
            ProjectDirs::from("xyz", "alumchat", "alumchat").ok_or(ConfigError::NoConfigDir)?;
        Ok(dirs.config_dir().join("config.toml"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_point_at_alumchat() {
        let config = Config::default();
        assert_eq!(config.service.domain, "alumchat.xyz");
        assert_eq!(config.service.conference_domain, "conference.alumchat.xyz");
        assert_eq!(config.service.port, 5222);
        assert_eq!(config.presence.probe_timeout_ms, 2000);
        assert_eq!(config.presence.settle_delay_ms, 500);
        assert_eq!(config.transfer.block_size, 4096);
    }

    #[test]
    fn config_round_trips_through_toml() {
        let config = Config::default();
        let text = toml::to_string_pretty(&config).unwrap();
        let parsed: Config = toml::from_str(&text).unwrap();
        assert_eq!(parsed.service.domain, config.service.domain);
        assert_eq!(parsed.transfer.block_size, config.transfer.block_size);
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let parsed: Config = toml::from_str("[service]\ndomain = \"example.org\"\n").unwrap();
        assert_eq!(parsed.service.domain, "example.org");
        assert_eq!(parsed.service.port, 5222);
        assert_eq!(parsed.presence.settle_delay_ms, 500);
    }

    #[test]
    fn missing_file_loads_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.toml");
        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.service.domain, "alumchat.xyz");
    }

    #[test]
    fn malformed_file_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "service = 3").unwrap();
        let error = Config::load_from(&path).unwrap_err();
        assert!(matches!(error, ConfigError::Parse { .. }));
    }
}
