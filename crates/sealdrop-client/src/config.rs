//! Client configuration

use sealdrop_core::{EngineConfig, Identity, TransferSettings};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Data directory path
    pub data_dir: String,

    /// Identity seed file, relative to the data directory unless absolute
    pub identity_file: String,

    /// Connection link configuration
    pub link: LinkConfig,

    /// Transfer configuration
    pub transfer: TransferConfig,

    /// Signaling configuration
    pub signaling: SignalingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Lifetime of generated links in seconds
    pub expiry_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Bytes per hashed chunk
    pub chunk_size: u64,
    /// Bytes per encrypted data frame
    pub slice_size: u64,
    /// Buffered bytes above which the sender backs off
    pub buffer_threshold: usize,
    /// Retries per chunk before giving up
    pub max_retries: u32,
    pub idle_timeout_secs: u64,
    pub handshake_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalingConfig {
    /// STUN/TURN URLs handed to the transport
    pub ice_servers: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: "~/.sealdrop".to_string(),
            identity_file: "identity.key".to_string(),
            link: LinkConfig::default(),
            transfer: TransferConfig::default(),
            signaling: SignalingConfig::default(),
        }
    }
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            ice_servers: sealdrop_core::DEFAULT_ICE_SERVERS
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self { expiry_secs: 3600 }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        let defaults = TransferSettings::default();
        Self {
            chunk_size: defaults.chunk_size,
            slice_size: defaults.slice_size,
            buffer_threshold: defaults.buffer_threshold,
            max_retries: defaults.max_retries,
            idle_timeout_secs: defaults.idle_timeout.as_secs(),
            handshake_timeout_secs: defaults.handshake_timeout.as_secs(),
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load from `path`, falling back to defaults when the file is absent
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Expand ~ in data_dir path
    pub fn data_dir(&self) -> PathBuf {
        expand_path(&self.data_dir)
    }

    pub fn identity_path(&self) -> PathBuf {
        let path = expand_path(&self.identity_file);
        if path.is_absolute() {
            path
        } else {
            self.data_dir().join(path)
        }
    }

    pub fn transfer_settings(&self) -> anyhow::Result<TransferSettings> {
        let t = &self.transfer;
        let settings = TransferSettings {
            chunk_size: t.chunk_size,
            slice_size: t.slice_size,
            buffer_threshold: t.buffer_threshold,
            max_retries: t.max_retries,
            idle_timeout: Duration::from_secs(t.idle_timeout_secs),
            handshake_timeout: Duration::from_secs(t.handshake_timeout_secs),
            ..TransferSettings::default()
        };
        settings.validate()?;
        Ok(settings)
    }

    pub fn host_engine_config(&self, identity: Identity) -> anyhow::Result<EngineConfig> {
        Ok(EngineConfig::host(identity)
            .with_transfer(self.transfer_settings()?)
            .with_ice_servers(self.signaling.ice_servers.clone()))
    }

    pub fn peer_engine_config(
        &self,
        identity: Identity,
        link: impl Into<String>,
    ) -> anyhow::Result<EngineConfig> {
        Ok(EngineConfig::peer(identity, link)
            .with_transfer(self.transfer_settings()?)
            .with_ice_servers(self.signaling.ice_servers.clone()))
    }
}

/// Expand a leading `~/` to the home directory
pub fn expand_path(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_round_trips_through_toml() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = Config::default();
        config.link.expiry_secs = 120;
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.link.expiry_secs, 120);
        assert_eq!(loaded.transfer.chunk_size, sealdrop_core::CHUNK_SIZE);
        assert_eq!(loaded.signaling.ice_servers.len(), 1);
    }

    #[test]
    fn test_ice_servers_reach_engine_config() {
        let mut config = Config::default();
        config.signaling.ice_servers = vec!["turn:relay.example:3478".to_string()];
        let engine = config
            .host_engine_config(Identity::generate(sealdrop_core::Role::Host))
            .unwrap();
        assert_eq!(engine.ice_servers, config.signaling.ice_servers);

        // An empty [signaling] table keeps the default server
        let parsed: Config = toml::from_str("[signaling]\n").unwrap();
        assert_eq!(parsed.signaling.ice_servers.len(), 1);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[transfer]\nmax_retries = 2\n").unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.transfer.max_retries, 2);
        assert_eq!(config.transfer.slice_size, sealdrop_core::SLICE_SIZE);
        assert_eq!(config.identity_file, "identity.key");
    }

    #[test]
    fn test_missing_file_falls_back_to_default() {
        let dir = TempDir::new().unwrap();
        let config = Config::load_or_default(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.link.expiry_secs, 3600);
    }

    #[test]
    fn test_identity_path_resolution() {
        let config = Config {
            data_dir: "/var/lib/sealdrop".to_string(),
            ..Config::default()
        };
        assert_eq!(
            config.identity_path(),
            PathBuf::from("/var/lib/sealdrop/identity.key")
        );

        let config = Config {
            identity_file: "/etc/sealdrop.key".to_string(),
            ..config
        };
        assert_eq!(config.identity_path(), PathBuf::from("/etc/sealdrop.key"));
    }

    #[test]
    fn test_transfer_settings_are_validated() {
        let mut config = Config::default();
        config.transfer.idle_timeout_secs = 5;
        let settings = config.transfer_settings().unwrap();
        assert_eq!(settings.idle_timeout, Duration::from_secs(5));

        config.transfer.slice_size = config.transfer.chunk_size + 1;
        assert!(config.transfer_settings().is_err());
    }
}
