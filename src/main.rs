//! echem_box server binary.
//!
//! Wires the long-lived service objects together (device directory, run
//! index, sync manager, job manager), starts the background sync tasks and
//! serves the HTTP API until interrupted.

use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use echem_box::config::{Settings, TransportKind};
use echem_box::driver::{DeviceDirectory, DriverFactory, MockDriverFactory};
use echem_box::jobs::JobManager;
use echem_box::plot::NoopPlotRenderer;
use echem_box::server::{self, AppState};
use echem_box::storage::RunDirectoryIndex;
use echem_box::sync::{SmbMountTransport, SshTransport, StorageSyncManager, SyncTransport};

#[derive(Parser, Debug)]
#[command(name = "echem_box", about = "Potentiostat box API server")]
struct Cli {
    /// Path of the TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the listen address from the configuration
    #[arg(long)]
    bind: Option<SocketAddr>,

    /// Override the number of mock devices bound at startup
    #[arg(long)]
    mock_devices: Option<usize>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let mut settings = Settings::load(cli.config.as_deref()).context("failed to load settings")?;
    if let Some(bind) = cli.bind {
        settings.server.bind_addr = bind;
    }
    if let Some(mock_devices) = cli.mock_devices {
        settings.discovery.mock_devices = mock_devices;
    }
    let settings = Arc::new(settings);

    let index = Arc::new(
        RunDirectoryIndex::new(&settings.storage.runs_root)
            .context("failed to open run directory index")?,
    );

    let transport: Arc<dyn SyncTransport> = match settings.sync.transport {
        TransportKind::Smb => Arc::new(SmbMountTransport),
        TransportKind::Ssh => Arc::new(SshTransport),
    };
    let sync = StorageSyncManager::new(
        Arc::clone(&index),
        settings.sync.config_path.clone(),
        settings.sync.credentials_path.clone(),
        settings.sync.mount_root.clone(),
        settings.sync.retention_interval,
        transport,
    );
    sync.start_background();

    let devices = Arc::new(DeviceDirectory::new());
    let factory: Arc<dyn DriverFactory> =
        Arc::new(MockDriverFactory::new(settings.discovery.mock_devices));
    let slots = devices
        .rescan(factory.as_ref())
        .await
        .context("initial device scan failed")?;
    info!(?slots, "devices bound");

    let jobs = JobManager::new(
        Arc::clone(&devices),
        Arc::clone(&index),
        sync.clone(),
        Arc::new(NoopPlotRenderer),
    );

    let state = AppState {
        settings: Arc::clone(&settings),
        devices: Arc::clone(&devices),
        factory,
        jobs,
        index,
        sync,
    };

    let listener = tokio::net::TcpListener::bind(settings.server.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", settings.server.bind_addr))?;
    info!(addr = %settings.server.bind_addr, "listening");

    axum::serve(listener, server::router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    devices.close_all().await;
    info!("shut down");
    Ok(())
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_err() {
        // with no signal handler we would never shut down cleanly; just return
    }
}
