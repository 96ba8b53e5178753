//! Service configuration using Figment.
//!
//! Configuration is loaded from:
//! 1. built-in defaults,
//! 2. an optional `echem_box.toml` file (path overridable on the CLI),
//! 3. environment variables prefixed with `BOX_` (e.g. `BOX_SERVER__BIND_ADDR`).
//!
//! This covers process-level settings only. The remote-storage configuration
//! is deliberately *not* part of [`Settings`]: it is persisted separately by
//! the storage sync manager and reloaded before every operation so that
//! out-of-band changes take effect without a restart.

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Configuration error types.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration load error: {0}")]
    LoadError(#[from] figment::Error),
}

/// Top-level service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// HTTP server settings
    #[serde(default)]
    pub server: ServerSettings,
    /// Run storage settings
    #[serde(default)]
    pub storage: StorageSettings,
    /// Remote storage sync settings
    #[serde(default)]
    pub sync: SyncSettings,
    /// Device discovery settings
    #[serde(default)]
    pub discovery: DiscoverySettings,
}

/// HTTP server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    /// Socket address the API listens on
    #[serde(default = "default_bind_addr")]
    pub bind_addr: SocketAddr,
    /// Optional API key; when set, every request must carry it in `X-API-Key`
    #[serde(default)]
    pub api_key: Option<String>,
    /// Identifier of this instrument box, echoed by `/health`
    #[serde(default)]
    pub box_id: String,
}

/// Run storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSettings {
    /// Root directory under which all run directories are created
    #[serde(default = "default_runs_root")]
    pub runs_root: PathBuf,
}

/// Remote storage sync configuration (process-level part).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSettings {
    /// Path of the persisted remote-storage configuration record
    #[serde(default = "default_sync_config_path")]
    pub config_path: PathBuf,
    /// Path of the credentials file written during setup (0600)
    #[serde(default = "default_credentials_path")]
    pub credentials_path: PathBuf,
    /// Root under which remote shares are mounted
    #[serde(default = "default_mount_root")]
    pub mount_root: PathBuf,
    /// Transport used to reach the remote storage
    #[serde(default)]
    pub transport: TransportKind,
    /// Interval between retention passes
    #[serde(with = "humantime_serde", default = "default_retention_interval")]
    pub retention_interval: Duration,
}

/// Selects the mechanism used to move run trees to remote storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// CIFS/SMB mount plus local rsync
    #[default]
    Smb,
    /// ssh + rsync with a provisioned key
    Ssh,
}

/// Device discovery configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoverySettings {
    /// Number of mock devices bound at startup when no hardware factory is wired
    #[serde(default = "default_mock_devices")]
    pub mock_devices: usize,
}

fn default_bind_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

fn default_runs_root() -> PathBuf {
    PathBuf::from("runs")
}

fn default_sync_config_path() -> PathBuf {
    PathBuf::from("nas_config.json")
}

fn default_credentials_path() -> PathBuf {
    PathBuf::from(".nas_credentials")
}

fn default_mount_root() -> PathBuf {
    PathBuf::from("/mnt/nas_box")
}

fn default_retention_interval() -> Duration {
    Duration::from_secs(6 * 3600)
}

fn default_mock_devices() -> usize {
    2
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            api_key: None,
            box_id: String::new(),
        }
    }
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            runs_root: default_runs_root(),
        }
    }
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            config_path: default_sync_config_path(),
            credentials_path: default_credentials_path(),
            mount_root: default_mount_root(),
            transport: TransportKind::default(),
            retention_interval: default_retention_interval(),
        }
    }
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self {
            mock_devices: default_mock_devices(),
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerSettings::default(),
            storage: StorageSettings::default(),
            sync: SyncSettings::default(),
            discovery: DiscoverySettings::default(),
        }
    }
}

impl Settings {
    /// Load configuration from defaults, an optional TOML file and `BOX_`
    /// environment variables (later sources win).
    pub fn load(config_file: Option<&Path>) -> Result<Self, ConfigError> {
        let mut figment = Figment::from(Serialized::defaults(Settings::default()));
        figment = match config_file {
            Some(path) => figment.merge(Toml::file(path)),
            None => figment.merge(Toml::file("echem_box.toml")),
        };
        let settings = figment
            .merge(Env::prefixed("BOX_").split("__"))
            .extract()?;
        Ok(settings)
    }
}
