//! Custom error types for the application.
//!
//! This module defines the primary error type, `BoxError`, for the entire
//! service. Using the `thiserror` crate, it provides a centralized and
//! consistent way to handle the different failure classes of the system:
//!
//! - **Admission errors**: rejected job submissions (empty mode list, missing
//!   parameter bundles, busy slots, run-id collisions). These are synchronous
//!   and rolled back atomically before any worker starts.
//! - **Not-found errors**: unknown run identifiers, unknown files, paths
//!   escaping a run root.
//! - **Storage errors**: invalid path segments derived from caller input.
//! - **I/O and serialization faults**: wrapped `std::io::Error` and
//!   `serde_json::Error` for truly unexpected conditions.
//!
//! Every variant carries a stable machine-readable code (see
//! [`BoxError::code`]) surfaced on the wire alongside the human-readable
//! message and an optional remediation hint.

use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, BoxError>;

#[derive(Error, Debug)]
pub enum BoxError {
    #[error("modes must not be empty")]
    EmptyModes,

    #[error("missing params for mode {0}")]
    MissingModeParams(String),

    #[error("no valid devices requested")]
    InvalidDevices,

    #[error("no devices registered")]
    NoDevicesRegistered,

    #[error("run_id already active: {0}")]
    RunIdConflict(String),

    #[error("slots busy: {}", .0.join(", "))]
    SlotsBusy(Vec<String>),

    #[error("unknown run_id: {0}")]
    JobNotFound(String),

    #[error("no run_ids given")]
    MissingRunIds,

    #[error("unknown run_ids: {}", .0.join(", "))]
    UnknownRunIds(Vec<String>),

    #[error("run not found: {0}")]
    RunNotFound(String),

    #[error("file not found")]
    FileNotFound,

    #[error("{field} must not be empty")]
    EmptySegment { field: &'static str },

    #[error("{field} is invalid")]
    InvalidSegment { field: &'static str },

    #[error("unsupported mode '{0}'")]
    UnsupportedMode(String),

    #[error("mode parameter error: {0}")]
    ModeParameter(String),

    #[error("invalid storage sync request: {0}")]
    InvalidSyncRequest(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl BoxError {
    /// Stable machine-readable code for this error, used in API responses.
    pub fn code(&self) -> &'static str {
        match self {
            BoxError::EmptyModes | BoxError::MissingModeParams(_) => "jobs.invalid_request",
            BoxError::InvalidDevices => "jobs.invalid_devices",
            BoxError::NoDevicesRegistered => "devices.unavailable",
            BoxError::RunIdConflict(_) => "jobs.run_id_conflict",
            BoxError::SlotsBusy(_) => "jobs.slots_busy",
            BoxError::JobNotFound(_) => "jobs.not_found",
            BoxError::MissingRunIds => "jobs.missing_run_ids",
            BoxError::UnknownRunIds(_) => "jobs.run_ids_unknown",
            BoxError::RunNotFound(_) => "runs.not_found",
            BoxError::FileNotFound => "runs.file_not_found",
            BoxError::EmptySegment { .. } | BoxError::InvalidSegment { .. } => {
                "storage.invalid_segment"
            }
            BoxError::UnsupportedMode(_) => "modes.not_found",
            BoxError::ModeParameter(_) => "modes.parameter_error",
            BoxError::InvalidSyncRequest(_) => "nas.invalid_request",
            BoxError::Unauthorized => "auth.invalid_api_key",
            BoxError::Io(_) | BoxError::Json(_) | BoxError::Internal(_) => "internal",
        }
    }

    /// Optional remediation hint surfaced to API clients.
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            BoxError::InvalidDevices => Some("Use slots from /devices or \"all\"."),
            BoxError::NoDevicesRegistered => Some("Rescan for devices via /admin/rescan."),
            BoxError::RunIdConflict(_) => {
                Some("Pick another run_id or wait for the active job to finish.")
            }
            BoxError::SlotsBusy(_) => Some("Wait until the named slots are free."),
            BoxError::JobNotFound(_) => Some("Check the run_id or list known jobs via /jobs."),
            BoxError::MissingRunIds => Some("Fill the run_ids field of the request."),
            BoxError::UnknownRunIds(_) => Some("Request known run_ids only."),
            BoxError::RunNotFound(_) => Some("Check the run_id or list existing runs."),
            BoxError::FileNotFound => Some("Give a path relative to the run directory."),
            BoxError::UnsupportedMode(_) => Some("List available modes via /modes."),
            BoxError::ModeParameter(_) => {
                Some("Check the parameters against the mode specification.")
            }
            BoxError::Unauthorized => Some("X-API-Key header is missing or wrong."),
            _ => None,
        }
    }
}
