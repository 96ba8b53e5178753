//! Asynchronous mirroring of completed runs to network storage.
//!
//! The [`StorageSyncManager`] moves a finished run's directory tree to remote
//! storage effectively-once and reclaims local disk space after a retention
//! window, without ever blocking the job-completion path. All transfer
//! mechanics live behind the [`SyncTransport`] abstraction so the policy here
//! - config reloads, enqueue dedup, verification, markers, retention - is
//! written and tested once.
//!
//! Outcomes are recorded as marker files inside the run directory itself:
//! `UPLOAD_DONE` (completion timestamp) on verified success, `upload_failed`
//! (free-text reason) otherwise. Retention is upload-gated: a directory
//! without `UPLOAD_DONE` is never deleted, regardless of age.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{AppResult, BoxError};
use crate::storage::RunDirectoryIndex;

mod config;
pub mod transport;

pub use config::SyncConfig;
pub use transport::{
    count_local_files, RemoteSession, SmbMountTransport, SshTransport, SyncTransport,
};

/// Name of the success marker written into an uploaded run directory.
pub const UPLOAD_DONE_MARKER: &str = "UPLOAD_DONE";
/// Name of the failure marker carrying the free-text reason.
pub const UPLOAD_FAILED_MARKER: &str = "upload_failed";

const INITIAL_PROBE_ATTEMPTS: u32 = 3;
const INITIAL_PROBE_DELAY: Duration = Duration::from_secs(5);

/// Parameters accepted by [`StorageSyncManager::setup`].
#[derive(Debug, Clone, Deserialize)]
pub struct SetupParams {
    pub host: String,
    #[serde(default)]
    pub share: String,
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub base_subdir: String,
    #[serde(default = "config::default_retention_days")]
    pub retention_days: i64,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default = "default_setup_port")]
    pub port: u16,
}

fn default_setup_port() -> u16 {
    22
}

/// Result of a setup attempt; probe failures are a negative result, not an
/// error.
#[derive(Debug, Clone, Serialize)]
pub struct SetupOutcome {
    pub ok: bool,
    pub message: String,
}

/// Process-wide record of the last connectivity probe.
#[derive(Debug, Clone, Serialize)]
pub struct HealthState {
    pub ok: bool,
    pub last_checked: Option<DateTime<Utc>>,
    pub message: String,
}

impl Default for HealthState {
    fn default() -> Self {
        Self {
            ok: false,
            last_checked: None,
            message: "not checked".to_string(),
        }
    }
}

/// Owns the remote-storage lifecycle: setup, health, uploads, retention.
/// Cloning yields another handle to the same state.
#[derive(Clone)]
pub struct StorageSyncManager {
    core: Arc<SyncCore>,
}

struct SyncCore {
    index: Arc<RunDirectoryIndex>,
    config_path: PathBuf,
    credentials_path: PathBuf,
    mount_root: PathBuf,
    retention_interval: Duration,
    transport: Arc<dyn SyncTransport>,
    /// Serializes connect/disconnect so uploads never race on a mount point
    mount_lock: Mutex<()>,
    /// Runs with an upload currently in flight
    uploading: Mutex<HashSet<String>>,
    health: Mutex<HealthState>,
}

impl StorageSyncManager {
    pub fn new(
        index: Arc<RunDirectoryIndex>,
        config_path: PathBuf,
        credentials_path: PathBuf,
        mount_root: PathBuf,
        retention_interval: Duration,
        transport: Arc<dyn SyncTransport>,
    ) -> Self {
        Self {
            core: Arc::new(SyncCore {
                index,
                config_path,
                credentials_path,
                mount_root,
                retention_interval,
                transport,
                mount_lock: Mutex::new(()),
                uploading: Mutex::new(HashSet::new()),
                health: Mutex::new(HealthState::default()),
            }),
        }
    }

    /// Load the persisted configuration, or `None` when not configured.
    pub fn load_config(&self) -> Option<SyncConfig> {
        self.core.load_config()
    }

    /// Persist credentials and configuration, then probe connectivity and
    /// ensure the remote base directory exists.
    pub async fn setup(&self, params: SetupParams) -> AppResult<SetupOutcome> {
        self.core.setup(params).await
    }

    /// Reload the configuration and run a short read-only probe, recording
    /// the outcome as process-wide state.
    pub async fn health(&self) -> HealthState {
        self.core.health().await
    }

    /// Last recorded health state without probing.
    pub async fn last_health(&self) -> HealthState {
        self.core.health.lock().await.clone()
    }

    /// Queue an upload for a run. Returns false when an upload for the same
    /// run is already in flight - the only retry path is a later re-enqueue.
    pub async fn enqueue_upload(&self, run_id: &str) -> bool {
        {
            let mut uploading = self.core.uploading.lock().await;
            if !uploading.insert(run_id.to_string()) {
                debug!(run_id, "upload already in flight, not enqueued");
                return false;
            }
        }
        let core = Arc::clone(&self.core);
        let run_id = run_id.to_string();
        tokio::spawn(async move {
            core.upload_worker(&run_id).await;
            core.uploading.lock().await.remove(&run_id);
        });
        true
    }

    /// Whether an upload for the run is currently in flight.
    pub async fn is_uploading(&self, run_id: &str) -> bool {
        self.core.uploading.lock().await.contains(run_id)
    }

    /// Start the singleton background tasks: one initial health probe and
    /// the retention loop. Called once at process startup.
    pub fn start_background(&self) {
        {
            let core = Arc::clone(&self.core);
            tokio::spawn(async move { core.initial_health_probe().await });
        }
        {
            let core = Arc::clone(&self.core);
            tokio::spawn(async move { core.retention_loop().await });
        }
    }
}

impl SyncCore {
    // ---------- Config ----------

    /// Read fresh before every operation so out-of-band edits apply.
    fn load_config(&self) -> Option<SyncConfig> {
        let raw = match std::fs::read_to_string(&self.config_path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return None,
            Err(err) => {
                warn!(error = %err, "failed to read sync config");
                return None;
            }
        };
        match serde_json::from_str(&raw) {
            Ok(cfg) => Some(cfg),
            Err(err) => {
                warn!(error = %err, "failed to parse sync config");
                None
            }
        }
    }

    fn write_config(&self, cfg: &SyncConfig) -> AppResult<()> {
        if let Some(parent) = self.config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.config_path.with_extension("tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(cfg)?)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600))?;
        }
        std::fs::rename(&tmp, &self.config_path)?;
        Ok(())
    }

    // ---------- Setup ----------

    async fn setup(&self, params: SetupParams) -> AppResult<SetupOutcome> {
        if params.host.is_empty() || params.username.is_empty() || params.password.is_empty() {
            return Err(BoxError::InvalidSyncRequest(
                "host/username/password are required".to_string(),
            ));
        }
        if self.transport.name() == "smb" && params.share.is_empty() {
            return Err(BoxError::InvalidSyncRequest(
                "share is required for SMB storage".to_string(),
            ));
        }

        let cfg = SyncConfig {
            host: params.host,
            share: params.share,
            username: params.username.clone(),
            cred_path: self.credentials_path.clone(),
            base_subdir: params.base_subdir.trim_matches('/').to_string(),
            mount_root: self.mount_root.clone(),
            retention_days: if params.retention_days > 0 {
                params.retention_days
            } else {
                config::default_retention_days()
            },
            cifs_vers: "3.0".to_string(),
            domain: params.domain,
            ssh_port: params.port,
        };

        self.transport
            .prepare_credentials(&cfg, &params.username, &params.password)
            .await
            .map_err(|err| BoxError::InvalidSyncRequest(err.to_string()))?;
        self.write_config(&cfg)?;

        let (ok, message) = self.probe(&cfg, true).await;
        let message = if message.is_empty() {
            if ok {
                format!("{} storage OK", self.transport.name())
            } else {
                "probe failed".to_string()
            }
        } else {
            message
        };
        Ok(SetupOutcome { ok, message })
    }

    // ---------- Health ----------

    async fn health(&self) -> HealthState {
        let state = match self.load_config() {
            None => HealthState {
                ok: false,
                last_checked: Some(Utc::now()),
                message: "not configured".to_string(),
            },
            Some(cfg) => {
                let (ok, message) = self.probe(&cfg, false).await;
                HealthState {
                    ok,
                    last_checked: Some(Utc::now()),
                    message,
                }
            }
        };
        *self.health.lock().await = state.clone();
        state
    }

    /// Connect read-only, optionally create the base directory, check it
    /// exists, disconnect. Never raises: failures come back as `(false, msg)`.
    async fn probe(&self, cfg: &SyncConfig, ensure_base: bool) -> (bool, String) {
        let session = {
            let _guard = self.mount_lock.lock().await;
            match self.transport.connect(cfg, "health", true).await {
                Ok(session) => session,
                Err(err) => return (false, format!("probe error: {err}")),
            }
        };

        let result = async {
            if ensure_base {
                self.transport.ensure_base(cfg, &session).await?;
            }
            self.transport.base_exists(cfg, &session).await
        }
        .await;

        self.disconnect_quietly(cfg, &session).await;

        match result {
            Ok(true) => (true, "ok".to_string()),
            Ok(false) => (false, "base path not present".to_string()),
            Err(err) => (false, format!("probe error: {err}")),
        }
    }

    async fn disconnect_quietly(&self, cfg: &SyncConfig, session: &RemoteSession) {
        let _guard = self.mount_lock.lock().await;
        if let Err(err) = self.transport.disconnect(cfg, session).await {
            warn!(error = %err, "disconnect failed");
        }
    }

    // ---------- Upload ----------

    async fn upload_worker(&self, run_id: &str) {
        let Some(cfg) = self.load_config() else {
            warn!(run_id, "upload skipped: remote storage not configured");
            return;
        };

        let run_dir = match self.index.resolve(run_id) {
            Ok(dir) => dir,
            Err(err) => {
                warn!(run_id, error = %err, "upload skipped: run directory unresolvable");
                return;
            }
        };

        let session = {
            let _guard = self.mount_lock.lock().await;
            match self.transport.connect(&cfg, "upload", false).await {
                Ok(session) => session,
                Err(err) => {
                    self.mark_failed(&run_dir, &format!("connect failed: {err}"))
                        .await;
                    return;
                }
            }
        };

        let rel = run_dir
            .strip_prefix(self.index.root())
            .map(|p| p.to_string_lossy().replace('\\', "/"))
            .unwrap_or_else(|_| run_id.to_string());

        match self.transfer_and_verify(&cfg, &session, &run_dir, &rel).await {
            Ok(()) => {
                info!(run_id, dest = %rel, "upload verified");
            }
            Err(reason) => {
                self.mark_failed(&run_dir, &reason).await;
            }
        }

        self.disconnect_quietly(&cfg, &session).await;
    }

    /// Push the tree and verify by file count; success writes `UPLOAD_DONE`.
    async fn transfer_and_verify(
        &self,
        cfg: &SyncConfig,
        session: &RemoteSession,
        run_dir: &Path,
        rel: &str,
    ) -> Result<(), String> {
        self.transport
            .push_tree(cfg, session, run_dir, rel)
            .await
            .map_err(|err| format!("transfer failed: {err}"))?;

        let local_dir = run_dir.to_path_buf();
        let local_count = tokio::task::spawn_blocking(move || count_local_files(&local_dir))
            .await
            .map_err(|err| format!("count failed: {err}"))?;
        let remote_count = self
            .transport
            .remote_file_count(cfg, session, rel)
            .await
            .map_err(|err| format!("remote count failed: {err}"))?;

        if remote_count < local_count {
            return Err(format!(
                "verify mismatch local={local_count} remote={remote_count}"
            ));
        }

        tokio::fs::write(run_dir.join(UPLOAD_DONE_MARKER), Utc::now().to_rfc3339())
            .await
            .map_err(|err| format!("failed to write completion marker: {err}"))?;
        Ok(())
    }

    async fn mark_failed(&self, run_dir: &Path, reason: &str) {
        warn!(dir = %run_dir.display(), reason, "upload failed");
        if let Err(err) = tokio::fs::write(run_dir.join(UPLOAD_FAILED_MARKER), reason).await {
            warn!(error = %err, "failed to write failure marker");
        }
    }

    // ---------- Retention & background ----------

    async fn initial_health_probe(&self) {
        let Some(cfg) = self.load_config() else {
            return;
        };
        for _ in 0..INITIAL_PROBE_ATTEMPTS {
            let (ok, message) = self.probe(&cfg, false).await;
            *self.health.lock().await = HealthState {
                ok,
                last_checked: Some(Utc::now()),
                message,
            };
            if ok {
                break;
            }
            tokio::time::sleep(INITIAL_PROBE_DELAY).await;
        }
    }

    async fn retention_loop(&self) {
        loop {
            if let Some(cfg) = self.load_config() {
                let root = self.index.root().to_path_buf();
                let cutoff = Utc::now() - ChronoDuration::days(cfg.retention_days);
                let result =
                    tokio::task::spawn_blocking(move || retention_pass(&root, cutoff)).await;
                match result {
                    Ok(deleted) if deleted > 0 => {
                        info!(deleted, "retention pass removed uploaded runs")
                    }
                    Ok(_) => {}
                    Err(err) => warn!(error = %err, "retention pass failed"),
                }
            }
            tokio::time::sleep(self.retention_interval).await;
        }
    }
}

/// One retention sweep: delete directories whose `UPLOAD_DONE` marker is
/// older than the cutoff. Directories without the marker are never touched.
pub fn retention_pass(runs_root: &Path, cutoff: DateTime<Utc>) -> usize {
    let mut candidates: Vec<PathBuf> = Vec::new();
    for entry in walkdir::WalkDir::new(runs_root)
        .into_iter()
        .filter_map(Result::ok)
    {
        if !entry.file_type().is_dir() {
            continue;
        }
        let dir = entry.path();
        let marker = dir.join(UPLOAD_DONE_MARKER);
        if !marker.exists() {
            continue;
        }
        let stamp = marker
            .metadata()
            .and_then(|m| m.modified())
            .or_else(|_| dir.metadata().and_then(|m| m.modified()))
            .map(DateTime::<Utc>::from);
        match stamp {
            Ok(stamp) if stamp <= cutoff => candidates.push(dir.to_path_buf()),
            _ => {}
        }
    }

    let mut deleted = 0;
    for dir in candidates {
        // a marked parent may already have taken nested candidates with it
        if !dir.exists() {
            continue;
        }
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => {
                info!(dir = %dir.display(), "local retention delete");
                deleted += 1;
            }
            Err(err) => warn!(dir = %dir.display(), error = %err, "retention delete failed"),
        }
    }
    deleted
}
