//! Pluggable transports for moving run trees to remote storage.
//!
//! The sync manager owns all policy (config reloads, dedup, verification,
//! markers, retention); a [`SyncTransport`] only knows how to reach the
//! remote side. Two implementations mirror the two ways the lab NAS is
//! reachable: a CIFS/SMB mount plus local rsync, and ssh plus rsync with a
//! provisioned key. Both transfers are incremental and idempotent - re-running
//! after a partial failure resumes rather than duplicating data.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Output;
use tokio::process::Command;
use tracing::debug;

use super::config::SyncConfig;

/// Handle for one established remote connection.
///
/// SMB connections carry their mount point; ssh connections are stateless.
#[derive(Debug, Clone)]
pub struct RemoteSession {
    pub mount_point: Option<PathBuf>,
}

/// Connection and transfer mechanics for one remote-storage flavor.
#[async_trait]
pub trait SyncTransport: Send + Sync {
    /// Short transport name used in logs and health messages.
    fn name(&self) -> &'static str;

    /// Persist or verify the credential material `setup` received.
    async fn prepare_credentials(
        &self,
        cfg: &SyncConfig,
        username: &str,
        password: &str,
    ) -> Result<()>;

    /// Establish a connection; `purpose` keys the local mount point so
    /// health probes and uploads never share one.
    async fn connect(&self, cfg: &SyncConfig, purpose: &str, read_only: bool)
        -> Result<RemoteSession>;

    /// Tear the connection down. Must be safe to call after a failed
    /// connect.
    async fn disconnect(&self, cfg: &SyncConfig, session: &RemoteSession) -> Result<()>;

    /// Create the remote base directory if it does not exist.
    async fn ensure_base(&self, cfg: &SyncConfig, session: &RemoteSession) -> Result<()>;

    /// Whether the remote base directory exists.
    async fn base_exists(&self, cfg: &SyncConfig, session: &RemoteSession) -> Result<bool>;

    /// Copy a local tree to `<base>/<rel>`, creating directories as needed.
    /// Incremental and idempotent.
    async fn push_tree(
        &self,
        cfg: &SyncConfig,
        session: &RemoteSession,
        local: &Path,
        rel: &str,
    ) -> Result<()>;

    /// Count files below `<base>/<rel>` on the remote side.
    async fn remote_file_count(
        &self,
        cfg: &SyncConfig,
        session: &RemoteSession,
        rel: &str,
    ) -> Result<usize>;
}

async fn run_command(program: &str, args: &[String]) -> Result<Output> {
    debug!(%program, ?args, "running command");
    Command::new(program)
        .args(args)
        .output()
        .await
        .with_context(|| format!("failed to spawn {program}"))
}

fn stderr_text(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).trim().to_string()
}

/// Count regular files below a local directory.
pub fn count_local_files(dir: &Path) -> usize {
    walkdir::WalkDir::new(dir)
        .into_iter()
        .filter_map(std::result::Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .count()
}

// ============================================================================
// SMB / CIFS mount transport
// ============================================================================

/// Mounts the share below the configured mount root and moves data with a
/// local rsync into the mounted tree.
pub struct SmbMountTransport;

impl SmbMountTransport {
    fn unc(cfg: &SyncConfig) -> String {
        format!(
            "//{}/{}",
            cfg.host.trim_matches('/'),
            cfg.share.trim_matches('/')
        )
    }

    fn base_path(cfg: &SyncConfig, session: &RemoteSession) -> Result<PathBuf> {
        let mount = session
            .mount_point
            .as_ref()
            .ok_or_else(|| anyhow!("smb session has no mount point"))?;
        let sub = cfg.base_subdir.trim_matches('/');
        Ok(if sub.is_empty() {
            mount.clone()
        } else {
            mount.join(sub)
        })
    }

    async fn umount(mount_point: &Path) -> Result<()> {
        if mount_point.exists() {
            // lazy unmount in case of lingering handles
            let args = vec!["-l".to_string(), mount_point.to_string_lossy().into_owned()];
            run_command("umount", &args).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl SyncTransport for SmbMountTransport {
    fn name(&self) -> &'static str {
        "smb"
    }

    async fn prepare_credentials(
        &self,
        cfg: &SyncConfig,
        username: &str,
        password: &str,
    ) -> Result<()> {
        let mut lines = vec![
            format!("username={username}"),
            format!("password={password}"),
        ];
        if let Some(domain) = &cfg.domain {
            lines.push(format!("domain={domain}"));
        }
        if let Some(parent) = cfg.cred_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&cfg.cred_path, lines.join("\n") + "\n").await?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&cfg.cred_path, std::fs::Permissions::from_mode(0o600))
                .await?;
        }
        Ok(())
    }

    async fn connect(
        &self,
        cfg: &SyncConfig,
        purpose: &str,
        read_only: bool,
    ) -> Result<RemoteSession> {
        let mount_point = cfg.mount_root.join(purpose);
        tokio::fs::create_dir_all(&mount_point).await?;

        // unmount a stale mount first so reconnects start clean
        let _ = Self::umount(&mount_point).await;

        let mut opts = vec![
            format!("credentials={}", cfg.cred_path.display()),
            format!("vers={}", cfg.cifs_vers),
            "iocharset=utf8".to_string(),
            "file_mode=0644".to_string(),
            "dir_mode=0755".to_string(),
            "noserverino".to_string(),
        ];
        if read_only {
            opts.push("ro".to_string());
        }
        let args = vec![
            "-t".to_string(),
            "cifs".to_string(),
            Self::unc(cfg),
            mount_point.to_string_lossy().into_owned(),
            "-o".to_string(),
            opts.join(","),
        ];
        let output = run_command("mount", &args).await?;
        if !output.status.success() {
            bail!(
                "mount failed rc={} err={}",
                output.status.code().unwrap_or(-1),
                stderr_text(&output)
            );
        }
        Ok(RemoteSession {
            mount_point: Some(mount_point),
        })
    }

    async fn disconnect(&self, _cfg: &SyncConfig, session: &RemoteSession) -> Result<()> {
        if let Some(mount_point) = &session.mount_point {
            Self::umount(mount_point).await?;
        }
        Ok(())
    }

    async fn ensure_base(&self, cfg: &SyncConfig, session: &RemoteSession) -> Result<()> {
        let base = Self::base_path(cfg, session)?;
        tokio::fs::create_dir_all(&base).await?;
        Ok(())
    }

    async fn base_exists(&self, cfg: &SyncConfig, session: &RemoteSession) -> Result<bool> {
        Ok(Self::base_path(cfg, session)?.exists())
    }

    async fn push_tree(
        &self,
        cfg: &SyncConfig,
        session: &RemoteSession,
        local: &Path,
        rel: &str,
    ) -> Result<()> {
        let dest = Self::base_path(cfg, session)?.join(rel);
        tokio::fs::create_dir_all(&dest).await?;
        let args = vec![
            "-a".to_string(),
            "--partial".to_string(),
            format!("{}/", local.display()),
            format!("{}/", dest.display()),
        ];
        let output = run_command("rsync", &args).await?;
        if !output.status.success() {
            bail!(
                "rsync rc={} err={}",
                output.status.code().unwrap_or(-1),
                stderr_text(&output)
            );
        }
        Ok(())
    }

    async fn remote_file_count(
        &self,
        cfg: &SyncConfig,
        session: &RemoteSession,
        rel: &str,
    ) -> Result<usize> {
        let dest = Self::base_path(cfg, session)?.join(rel);
        let count = tokio::task::spawn_blocking(move || count_local_files(&dest)).await?;
        Ok(count)
    }
}

// ============================================================================
// ssh + rsync transport
// ============================================================================

/// Key-based ssh transport; the configured credential path is the private
/// key, which must be provisioned out of band.
pub struct SshTransport;

impl SshTransport {
    fn ssh_args(cfg: &SyncConfig) -> Vec<String> {
        vec![
            "-i".to_string(),
            cfg.cred_path.to_string_lossy().into_owned(),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=no".to_string(),
            "-p".to_string(),
            cfg.ssh_port.to_string(),
        ]
    }

    fn target(cfg: &SyncConfig) -> String {
        format!("{}@{}", cfg.username, cfg.host)
    }

    fn remote_base(cfg: &SyncConfig) -> String {
        cfg.base_subdir.trim_end_matches('/').to_string()
    }

    fn remote_dest(cfg: &SyncConfig, rel: &str) -> String {
        format!("{}/{rel}", Self::remote_base(cfg))
    }

    async fn ssh(cfg: &SyncConfig, remote_args: &[String]) -> Result<Output> {
        let mut args = Self::ssh_args(cfg);
        args.push(Self::target(cfg));
        args.extend_from_slice(remote_args);
        run_command("ssh", &args).await
    }
}

#[async_trait]
impl SyncTransport for SshTransport {
    fn name(&self) -> &'static str {
        "ssh"
    }

    async fn prepare_credentials(
        &self,
        cfg: &SyncConfig,
        _username: &str,
        _password: &str,
    ) -> Result<()> {
        if !cfg.cred_path.is_file() {
            bail!(
                "ssh key not found at {}; provision one before setup",
                cfg.cred_path.display()
            );
        }
        Ok(())
    }

    async fn connect(
        &self,
        cfg: &SyncConfig,
        _purpose: &str,
        _read_only: bool,
    ) -> Result<RemoteSession> {
        let output = Self::ssh(cfg, &["true".to_string()]).await?;
        if !output.status.success() {
            bail!(
                "ssh probe failed (rc={})",
                output.status.code().unwrap_or(-1)
            );
        }
        Ok(RemoteSession { mount_point: None })
    }

    async fn disconnect(&self, _cfg: &SyncConfig, _session: &RemoteSession) -> Result<()> {
        Ok(())
    }

    async fn ensure_base(&self, cfg: &SyncConfig, _session: &RemoteSession) -> Result<()> {
        let output = Self::ssh(
            cfg,
            &[
                "mkdir".to_string(),
                "-p".to_string(),
                Self::remote_base(cfg),
            ],
        )
        .await?;
        if !output.status.success() {
            bail!("remote mkdir failed (rc={})", output.status.code().unwrap_or(-1));
        }
        Ok(())
    }

    async fn base_exists(&self, cfg: &SyncConfig, _session: &RemoteSession) -> Result<bool> {
        let output = Self::ssh(
            cfg,
            &["test".to_string(), "-d".to_string(), Self::remote_base(cfg)],
        )
        .await?;
        Ok(output.status.success())
    }

    async fn push_tree(
        &self,
        cfg: &SyncConfig,
        _session: &RemoteSession,
        local: &Path,
        rel: &str,
    ) -> Result<()> {
        let dest = Self::remote_dest(cfg, rel);
        let output = Self::ssh(cfg, &["mkdir".to_string(), "-p".to_string(), dest.clone()]).await?;
        if !output.status.success() {
            bail!("remote mkdir failed (rc={})", output.status.code().unwrap_or(-1));
        }

        let ssh_cmd = format!(
            "ssh -i {} -o BatchMode=yes -o StrictHostKeyChecking=no -p {}",
            cfg.cred_path.display(),
            cfg.ssh_port
        );
        let args = vec![
            "-a".to_string(),
            "--partial".to_string(),
            "--append-verify".to_string(),
            "-e".to_string(),
            ssh_cmd,
            format!("{}/", local.display()),
            format!("{}:{dest}/", Self::target(cfg)),
        ];
        let output = run_command("rsync", &args).await?;
        if !output.status.success() {
            bail!("rsync rc={}", output.status.code().unwrap_or(-1));
        }
        Ok(())
    }

    async fn remote_file_count(
        &self,
        cfg: &SyncConfig,
        _session: &RemoteSession,
        rel: &str,
    ) -> Result<usize> {
        let dest = Self::remote_dest(cfg, rel);
        let output = Self::ssh(
            cfg,
            &[
                "sh".to_string(),
                "-c".to_string(),
                format!("find '{dest}' -type f | wc -l"),
            ],
        )
        .await?;
        if !output.status.success() {
            bail!("remote count failed (rc={})", output.status.code().unwrap_or(-1));
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        stdout
            .trim()
            .parse::<usize>()
            .with_context(|| format!("unparsable remote count: {stdout:?}"))
    }
}
