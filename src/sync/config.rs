//! Persisted remote-storage configuration record.
//!
//! This record - not the process [`crate::config::Settings`] - is the single
//! source of truth for where completed runs are mirrored. It is written
//! atomically with restrictive permissions and loaded fresh before every
//! health check and upload, so out-of-band edits take effect without a
//! restart.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Connection parameters and retention policy for the remote storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Remote host name or address
    pub host: String,
    /// SMB share name (unused by the ssh transport)
    #[serde(default)]
    pub share: String,
    /// Account used to reach the remote storage
    pub username: String,
    /// Credentials reference: SMB credentials file or ssh private key
    pub cred_path: PathBuf,
    /// Base directory below the share (SMB) or absolute remote base (ssh)
    #[serde(default)]
    pub base_subdir: String,
    /// Local root under which shares are mounted
    pub mount_root: PathBuf,
    /// Minimum age after successful upload before local deletion, in days
    #[serde(default = "default_retention_days")]
    pub retention_days: i64,
    /// SMB protocol version passed to mount
    #[serde(default = "default_cifs_vers")]
    pub cifs_vers: String,
    /// Optional SMB domain
    #[serde(default)]
    pub domain: Option<String>,
    /// ssh port (unused by the SMB transport)
    #[serde(default = "default_ssh_port")]
    pub ssh_port: u16,
}

pub(crate) fn default_retention_days() -> i64 {
    14
}

fn default_cifs_vers() -> String {
    "3.0".to_string()
}

fn default_ssh_port() -> u16 {
    22
}

#[cfg(test)]
impl SyncConfig {
    /// Minimal config for unit tests.
    pub fn for_tests(host: &str, share: &str) -> Self {
        Self {
            host: host.to_string(),
            share: share.to_string(),
            username: "labuser".to_string(),
            cred_path: PathBuf::from("/tmp/creds"),
            base_subdir: String::new(),
            mount_root: PathBuf::from("/mnt/nas_box"),
            retention_days: default_retention_days(),
            cifs_vers: default_cifs_vers(),
            domain: None,
            ssh_port: default_ssh_port(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_round_trips_with_defaults() {
        let raw = r#"{
            "host": "nas.local",
            "username": "labuser",
            "cred_path": "/opt/box/.creds",
            "mount_root": "/mnt/nas_box"
        }"#;
        let cfg: SyncConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(cfg.retention_days, 14);
        assert_eq!(cfg.cifs_vers, "3.0");
        assert_eq!(cfg.ssh_port, 22);
        assert!(cfg.share.is_empty());
    }
}
