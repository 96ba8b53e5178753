//! Upload, verification and dedup tests for the storage sync manager, using
//! a local-filesystem transport double in place of SMB/ssh.

use anyhow::Result;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use echem_box::storage::RunDirectoryIndex;
use echem_box::sync::{
    count_local_files, RemoteSession, StorageSyncManager, SyncConfig, SyncTransport,
    UPLOAD_DONE_MARKER, UPLOAD_FAILED_MARKER,
};

/// Transport double copying trees into a local "remote" directory. Can be
/// told to silently drop files to provoke verification mismatches, or gated
/// on a semaphore to hold an upload in flight deterministically.
struct LocalTransport {
    remote_root: PathBuf,
    drop_files: usize,
    gate: Option<Arc<tokio::sync::Semaphore>>,
}

impl LocalTransport {
    fn new(remote_root: PathBuf) -> Self {
        Self {
            remote_root,
            drop_files: 0,
            gate: None,
        }
    }

    fn dropping(remote_root: PathBuf, drop_files: usize) -> Self {
        Self {
            drop_files,
            ..Self::new(remote_root)
        }
    }

    fn gated(remote_root: PathBuf, gate: Arc<tokio::sync::Semaphore>) -> Self {
        Self {
            gate: Some(gate),
            ..Self::new(remote_root)
        }
    }
}

#[async_trait]
impl SyncTransport for LocalTransport {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn prepare_credentials(
        &self,
        _cfg: &SyncConfig,
        _username: &str,
        _password: &str,
    ) -> Result<()> {
        Ok(())
    }

    async fn connect(
        &self,
        _cfg: &SyncConfig,
        _purpose: &str,
        _read_only: bool,
    ) -> Result<RemoteSession> {
        Ok(RemoteSession { mount_point: None })
    }

    async fn disconnect(&self, _cfg: &SyncConfig, _session: &RemoteSession) -> Result<()> {
        Ok(())
    }

    async fn ensure_base(&self, _cfg: &SyncConfig, _session: &RemoteSession) -> Result<()> {
        std::fs::create_dir_all(&self.remote_root)?;
        Ok(())
    }

    async fn base_exists(&self, _cfg: &SyncConfig, _session: &RemoteSession) -> Result<bool> {
        Ok(self.remote_root.is_dir())
    }

    async fn push_tree(
        &self,
        _cfg: &SyncConfig,
        _session: &RemoteSession,
        local: &Path,
        rel: &str,
    ) -> Result<()> {
        if let Some(gate) = &self.gate {
            gate.acquire().await?.forget();
        }
        let dest = self.remote_root.join(rel);
        let mut skipped = 0;
        for entry in walkdir::WalkDir::new(local)
            .into_iter()
            .filter_map(std::result::Result::ok)
        {
            let target = dest.join(entry.path().strip_prefix(local)?);
            if entry.file_type().is_dir() {
                std::fs::create_dir_all(&target)?;
            } else if entry.file_type().is_file() {
                if skipped < self.drop_files {
                    skipped += 1;
                    continue;
                }
                if let Some(parent) = target.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::copy(entry.path(), &target)?;
            }
        }
        Ok(())
    }

    async fn remote_file_count(
        &self,
        _cfg: &SyncConfig,
        _session: &RemoteSession,
        rel: &str,
    ) -> Result<usize> {
        Ok(count_local_files(&self.remote_root.join(rel)))
    }
}

struct Harness {
    _tmp: TempDir,
    manager: StorageSyncManager,
    index: Arc<RunDirectoryIndex>,
    remote_root: PathBuf,
}

fn harness(transport: impl Fn(PathBuf) -> LocalTransport) -> Harness {
    let tmp = TempDir::new().unwrap();
    let runs_root = tmp.path().join("runs");
    let remote_root = tmp.path().join("remote");
    let config_path = tmp.path().join("nas_config.json");

    let cfg = SyncConfig {
        host: "nas.local".to_string(),
        share: "experiments".to_string(),
        username: "labuser".to_string(),
        cred_path: tmp.path().join(".creds"),
        base_subdir: String::new(),
        mount_root: tmp.path().join("mnt"),
        retention_days: 14,
        cifs_vers: "3.0".to_string(),
        domain: None,
        ssh_port: 22,
    };
    std::fs::write(&config_path, serde_json::to_string_pretty(&cfg).unwrap()).unwrap();

    let index = Arc::new(RunDirectoryIndex::new(&runs_root).unwrap());
    let manager = StorageSyncManager::new(
        Arc::clone(&index),
        config_path,
        tmp.path().join(".creds"),
        tmp.path().join("mnt"),
        Duration::from_secs(3600),
        Arc::new(transport(remote_root.clone())),
    );
    Harness {
        _tmp: tmp,
        manager,
        index,
        remote_root,
    }
}

fn seed_run(harness: &Harness, run_id: &str, files: &[&str]) -> PathBuf {
    let run_dir = harness.index.root().join("exp").join(run_id);
    for file in files {
        let path = run_dir.join(file);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "data").unwrap();
    }
    harness.index.record(run_id, &run_dir).unwrap();
    run_dir
}

async fn wait_upload_settled(manager: &StorageSyncManager, run_id: &str) {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if !manager.is_uploading(run_id).await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("upload did not settle in time");
}

#[tokio::test]
async fn test_upload_mirrors_tree_and_writes_done_marker() {
    let h = harness(LocalTransport::new);
    let run_dir = seed_run(&h, "run_ok", &["Wells/slot01/CV/a.csv", "Wells/slot01/CV/a.png"]);

    assert!(h.manager.enqueue_upload("run_ok").await);
    wait_upload_settled(&h.manager, "run_ok").await;

    assert!(run_dir.join(UPLOAD_DONE_MARKER).is_file());
    assert!(!run_dir.join(UPLOAD_FAILED_MARKER).exists());
    // destination mirrors the path relative to the runs root
    assert!(h
        .remote_root
        .join("exp/run_ok/Wells/slot01/CV/a.csv")
        .is_file());
}

#[tokio::test]
async fn test_verification_mismatch_marks_failure_not_success() {
    let h = harness(|root| LocalTransport::dropping(root, 1));
    let run_dir = seed_run(&h, "run_short", &["a.csv", "b.csv", "c.csv"]);

    assert!(h.manager.enqueue_upload("run_short").await);
    wait_upload_settled(&h.manager, "run_short").await;

    assert!(!run_dir.join(UPLOAD_DONE_MARKER).exists());
    let reason = std::fs::read_to_string(run_dir.join(UPLOAD_FAILED_MARKER)).unwrap();
    assert!(reason.contains("verify mismatch"), "got: {reason}");
}

#[tokio::test]
async fn test_enqueue_deduplicates_in_flight_uploads() {
    let gate = Arc::new(tokio::sync::Semaphore::new(0));
    let h = {
        let gate = Arc::clone(&gate);
        harness(move |root| LocalTransport::gated(root, Arc::clone(&gate)))
    };
    let run_dir = seed_run(&h, "run_dup", &["a.csv"]);

    // first enqueue is accepted and blocks inside the transport
    assert!(h.manager.enqueue_upload("run_dup").await);
    tokio::time::timeout(Duration::from_secs(5), async {
        while !h.manager.is_uploading("run_dup").await {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    // a second enqueue for the same in-flight run is a no-op
    assert!(!h.manager.enqueue_upload("run_dup").await);

    gate.add_permits(1);
    wait_upload_settled(&h.manager, "run_dup").await;
    assert!(run_dir.join(UPLOAD_DONE_MARKER).is_file());

    // a settled upload can be re-triggered manually
    gate.add_permits(1);
    assert!(h.manager.enqueue_upload("run_dup").await);
    wait_upload_settled(&h.manager, "run_dup").await;
}

#[tokio::test]
async fn test_upload_unknown_run_aborts_silently() {
    let h = harness(LocalTransport::new);
    assert!(h.manager.enqueue_upload("ghost").await);
    wait_upload_settled(&h.manager, "ghost").await;
    // nothing mirrored, nothing marked
    assert!(!h.remote_root.join("ghost").exists());
}

#[tokio::test]
async fn test_upload_without_config_is_skipped() {
    let h = harness(LocalTransport::new);
    let run_dir = seed_run(&h, "run_nocfg", &["a.csv"]);
    // remove the config record: manager must treat this as "not configured"
    std::fs::remove_file(h._tmp.path().join("nas_config.json")).unwrap();

    assert!(h.manager.enqueue_upload("run_nocfg").await);
    wait_upload_settled(&h.manager, "run_nocfg").await;
    assert!(!run_dir.join(UPLOAD_DONE_MARKER).exists());
    assert!(!run_dir.join(UPLOAD_FAILED_MARKER).exists());
}

#[tokio::test]
async fn test_health_reports_not_configured_distinctly() {
    let h = harness(LocalTransport::new);
    std::fs::remove_file(h._tmp.path().join("nas_config.json")).unwrap();

    let state = h.manager.health().await;
    assert!(!state.ok);
    assert_eq!(state.message, "not configured");
    assert!(state.last_checked.is_some());
}

#[tokio::test]
async fn test_health_probe_succeeds_with_reachable_remote() {
    let h = harness(LocalTransport::new);
    std::fs::create_dir_all(&h.remote_root).unwrap();

    let state = h.manager.health().await;
    assert!(state.ok, "message: {}", state.message);
    assert_eq!(state.message, "ok");
    assert!(h.manager.last_health().await.ok);
}
