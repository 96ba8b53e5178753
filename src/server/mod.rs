//! HTTP API veneer.
//!
//! A thin axum routing layer over the service objects; every handler
//! delegates to [`JobManager`], [`DeviceDirectory`], [`RunDirectoryIndex`] or
//! [`StorageSyncManager`] and converts typed errors into the stable
//! `{code, message, hint}` wire shape. No orchestration logic lives here.

use axum::{
    extract::{Path as UrlPath, Query, Request, State},
    http::{header, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::io::Cursor;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

use crate::config::Settings;
use crate::driver::{DeviceDirectory, DriverFactory};
use crate::error::BoxError;
use crate::jobs::{BulkStatusRequest, JobManager, JobRequest, StateFilter};
use crate::storage::RunDirectoryIndex;
use crate::sync::{SetupParams, StorageSyncManager};
use crate::validation::validate_mode_payload;

/// Wire version of the API, independent of the crate version.
pub const API_VERSION: &str = "1.0";

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub devices: Arc<DeviceDirectory>,
    pub factory: Arc<dyn DriverFactory>,
    pub jobs: JobManager,
    pub index: Arc<RunDirectoryIndex>,
    pub sync: StorageSyncManager,
}

/// Error body carried by every rejected request.
#[derive(Debug, Serialize)]
struct ErrorBody {
    code: String,
    message: String,
    hint: String,
}

/// Wrapper turning [`BoxError`] into an HTTP response.
pub struct ApiError(BoxError);

impl From<BoxError> for ApiError {
    fn from(err: BoxError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            BoxError::EmptyModes | BoxError::MissingModeParams(_) => StatusCode::UNPROCESSABLE_ENTITY,
            BoxError::InvalidDevices
            | BoxError::MissingRunIds
            | BoxError::EmptySegment { .. }
            | BoxError::InvalidSegment { .. }
            | BoxError::ModeParameter(_)
            | BoxError::InvalidSyncRequest(_) => StatusCode::BAD_REQUEST,
            BoxError::NoDevicesRegistered => StatusCode::SERVICE_UNAVAILABLE,
            BoxError::RunIdConflict(_) | BoxError::SlotsBusy(_) => StatusCode::CONFLICT,
            BoxError::JobNotFound(_)
            | BoxError::UnknownRunIds(_)
            | BoxError::RunNotFound(_)
            | BoxError::FileNotFound
            | BoxError::UnsupportedMode(_) => StatusCode::NOT_FOUND,
            BoxError::Unauthorized => StatusCode::UNAUTHORIZED,
            BoxError::Io(_) | BoxError::Json(_) | BoxError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        if status == StatusCode::UNPROCESSABLE_ENTITY {
            info!(code = self.0.code(), message = %self.0, "validation failed");
        }
        let body = ErrorBody {
            code: self.0.code().to_string(),
            message: self.0.to_string(),
            hint: self.0.hint().unwrap_or_default().to_string(),
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

/// Build the router with every endpoint mounted.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/version", get(version_info))
        .route("/health", get(health))
        .route("/devices", get(list_devices))
        .route("/modes", get(list_modes))
        .route("/modes/{mode}/params", get(mode_params))
        .route("/modes/{mode}/validate", post(validate_mode))
        .route("/jobs", post(start_job).get(list_jobs))
        .route("/jobs/status", post(jobs_bulk_status))
        .route("/jobs/{run_id}", get(job_status))
        .route("/jobs/{run_id}/cancel", post(cancel_job))
        .route("/runs/{run_id}/files", get(list_run_files))
        .route("/runs/{run_id}/file", get(get_run_file))
        .route("/runs/{run_id}/zip", get(get_run_zip))
        .route("/runs/{run_id}/upload", post(upload_run))
        .route("/nas/setup", post(nas_setup))
        .route("/nas/health", get(nas_health))
        .route("/admin/rescan", post(rescan))
        .layer(middleware::from_fn_with_state(state.clone(), require_api_key))
        .with_state(state)
}

/// Reject requests without the configured API key. A missing configuration
/// disables the check entirely.
async fn require_api_key(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    if let Some(expected) = state
        .settings
        .server
        .api_key
        .as_deref()
        .filter(|key| !key.is_empty())
    {
        let provided = request
            .headers()
            .get("x-api-key")
            .and_then(|value| value.to_str().ok());
        if provided != Some(expected) {
            return ApiError(BoxError::Unauthorized).into_response();
        }
    }
    next.run(request).await
}

// ---------- Introspection ----------

#[derive(Serialize)]
struct VersionInfo {
    api: &'static str,
    build: &'static str,
}

async fn version_info() -> Json<VersionInfo> {
    Json(VersionInfo {
        api: API_VERSION,
        build: option_env!("BOX_BUILD").unwrap_or(env!("CARGO_PKG_VERSION")),
    })
}

#[derive(Serialize)]
struct HealthInfo {
    ok: bool,
    devices: usize,
    box_id: String,
}

async fn health(State(state): State<AppState>) -> Json<HealthInfo> {
    Json(HealthInfo {
        ok: true,
        devices: state.devices.len().await,
        box_id: state.settings.server.box_id.clone(),
    })
}

async fn list_devices(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.devices.devices().await)
}

async fn list_modes(State(state): State<AppState>) -> ApiResult<Json<Vec<String>>> {
    // the bank is homogeneously configured: any bound device answers
    let driver = state
        .devices
        .first_driver()
        .await
        .ok_or(BoxError::NoDevicesRegistered)?;
    let modes = driver
        .available_modes()
        .await
        .map_err(|err| BoxError::Internal(err.to_string()))?;
    Ok(Json(modes))
}

async fn mode_params(
    State(state): State<AppState>,
    UrlPath(mode): UrlPath<String>,
) -> ApiResult<impl IntoResponse> {
    let driver = state
        .devices
        .first_driver()
        .await
        .ok_or(BoxError::NoDevicesRegistered)?;
    let params = driver
        .mode_params(&mode)
        .await
        .map_err(|err| BoxError::ModeParameter(err.to_string()))?;
    Ok(Json(params))
}

async fn validate_mode(
    UrlPath(mode): UrlPath<String>,
    Json(params): Json<Map<String, Value>>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(validate_mode_payload(&mode, &params)?))
}

async fn rescan(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    let slots = state
        .devices
        .rescan(state.factory.as_ref())
        .await
        .map_err(|err| BoxError::Internal(err.to_string()))?;
    Ok(Json(serde_json::json!({ "devices": slots })))
}

// ---------- Jobs ----------

async fn start_job(
    State(state): State<AppState>,
    Json(req): Json<JobRequest>,
) -> ApiResult<impl IntoResponse> {
    let snapshot = state.jobs.start_job(req).await?;
    Ok(Json(snapshot))
}

#[derive(Deserialize)]
struct ListJobsParams {
    state: Option<StateFilter>,
    group_id: Option<String>,
}

async fn list_jobs(
    State(state): State<AppState>,
    Query(params): Query<ListJobsParams>,
) -> impl IntoResponse {
    Json(
        state
            .jobs
            .list_jobs(params.state, params.group_id.as_deref())
            .await,
    )
}

async fn jobs_bulk_status(
    State(state): State<AppState>,
    Json(req): Json<BulkStatusRequest>,
) -> ApiResult<impl IntoResponse> {
    let snapshots = state.jobs.bulk_snapshots(&req.run_ids).await?;
    debug!(count = snapshots.len(), "bulk status lookup");
    Ok(Json(snapshots))
}

async fn job_status(
    State(state): State<AppState>,
    UrlPath(run_id): UrlPath<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.jobs.snapshot(&run_id).await?))
}

async fn cancel_job(
    State(state): State<AppState>,
    UrlPath(run_id): UrlPath<String>,
) -> ApiResult<impl IntoResponse> {
    let response = state.jobs.cancel_job(&run_id).await?;
    Ok((StatusCode::ACCEPTED, Json(response)))
}

// ---------- Run files ----------

async fn list_run_files(
    State(state): State<AppState>,
    UrlPath(run_id): UrlPath<String>,
) -> ApiResult<impl IntoResponse> {
    let run_dir = state.index.resolve(&run_id)?;
    if !run_dir.is_dir() {
        return Err(BoxError::RunNotFound(run_id).into());
    }
    let files = tokio::task::spawn_blocking(move || {
        let mut files: Vec<String> = WalkDir::new(&run_dir)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|entry| entry.file_type().is_file())
            .filter_map(|entry| {
                entry
                    .path()
                    .strip_prefix(&run_dir)
                    .ok()
                    .map(|rel| rel.to_string_lossy().replace('\\', "/"))
            })
            .collect();
        files.sort();
        files
    })
    .await
    .map_err(|err| BoxError::Internal(err.to_string()))?;
    info!(%run_id, count = files.len(), "listed run files");
    Ok(Json(serde_json::json!({ "files": files })))
}

#[derive(Deserialize)]
struct FileQuery {
    path: String,
}

async fn get_run_file(
    State(state): State<AppState>,
    UrlPath(run_id): UrlPath<String>,
    Query(query): Query<FileQuery>,
) -> ApiResult<Response> {
    let run_dir = state.index.resolve(&run_id)?;
    if !run_dir.is_dir() {
        return Err(BoxError::RunNotFound(run_id).into());
    }
    if query.path.is_empty() {
        return Err(BoxError::FileNotFound.into());
    }

    let run_root = tokio::fs::canonicalize(&run_dir)
        .await
        .map_err(|_| BoxError::RunNotFound(run_id.clone()))?;
    let target: PathBuf = tokio::fs::canonicalize(run_dir.join(&query.path))
        .await
        .map_err(|_| BoxError::FileNotFound)?;

    // reject anything resolving outside the run root
    let rel = target
        .strip_prefix(&run_root)
        .map_err(|_| BoxError::FileNotFound)?
        .to_path_buf();
    if !target.is_file() {
        return Err(BoxError::FileNotFound.into());
    }

    let bytes = tokio::fs::read(&target)
        .await
        .map_err(BoxError::from)?;
    let filename = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| run_id.clone());
    info!(%run_id, path = %rel.display(), "serving run file");
    Ok((
        [
            (header::CONTENT_TYPE, "application/octet-stream".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{filename}\""),
            ),
        ],
        bytes,
    )
        .into_response())
}

async fn get_run_zip(
    State(state): State<AppState>,
    UrlPath(run_id): UrlPath<String>,
) -> ApiResult<Response> {
    let run_dir = state.index.resolve(&run_id)?;
    if !run_dir.is_dir() {
        return Err(BoxError::RunNotFound(run_id).into());
    }

    let archive_dir = run_dir.clone();
    let bytes = tokio::task::spawn_blocking(move || build_zip(&archive_dir))
        .await
        .map_err(|err| BoxError::Internal(err.to_string()))?
        .map_err(|err| BoxError::Internal(err.to_string()))?;

    info!(%run_id, size = bytes.len(), "serving run archive");
    Ok((
        [
            (header::CONTENT_TYPE, "application/zip".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{run_id}.zip\""),
            ),
        ],
        bytes,
    )
        .into_response())
}

/// Deflate the whole run tree into an in-memory archive.
fn build_zip(run_dir: &std::path::Path) -> anyhow::Result<Vec<u8>> {
    let mut buffer = Cursor::new(Vec::new());
    {
        let mut archive = ZipWriter::new(&mut buffer);
        let options =
            SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);
        for entry in WalkDir::new(run_dir).into_iter().filter_map(Result::ok) {
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = entry
                .path()
                .strip_prefix(run_dir)?
                .to_string_lossy()
                .replace('\\', "/");
            archive.start_file(rel, options)?;
            let mut file = std::fs::File::open(entry.path())?;
            std::io::copy(&mut file, &mut archive)?;
        }
        archive.finish()?;
    }
    Ok(buffer.into_inner())
}

// ---------- Remote storage ----------

async fn nas_setup(
    State(state): State<AppState>,
    Json(params): Json<SetupParams>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.sync.setup(params).await?))
}

async fn nas_health(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.sync.health().await)
}

async fn upload_run(
    State(state): State<AppState>,
    UrlPath(run_id): UrlPath<String>,
) -> impl IntoResponse {
    let enqueued = state.sync.enqueue_upload(&run_id).await;
    Json(serde_json::json!({ "ok": true, "enqueued": enqueued, "run_id": run_id }))
}
