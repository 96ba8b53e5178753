//! Job and slot state types.
//!
//! A job is one submission: an ordered list of modes run on a set of slots.
//! The stored [`JobStatus`] is mutated only by slot workers and cancellation,
//! always under the job registry lock; status reads hand out deep copies with
//! progress derived on the fly.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

/// Lifecycle state shared by slots and jobs.
///
/// Stored job statuses never hold `Queued` (a job starts `running`); the
/// variant exists for slots and for the overview refinement that reports a
/// job whose slots are all still queued as `queued`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Queued,
    Running,
    Done,
    Failed,
    Cancelled,
}

impl RunState {
    /// Whether this state is terminal (no further transitions).
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Done | RunState::Failed | RunState::Cancelled)
    }
}

/// Point-in-time state of one slot within a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlotStatus {
    /// Slot identifier
    pub slot: String,
    /// Current state
    pub status: RunState,
    /// When the slot worker started, if it has
    pub started_at: Option<DateTime<Utc>>,
    /// When the slot reached a terminal state
    pub ended_at: Option<DateTime<Utc>>,
    /// Human-readable outcome message ("cancelled", or the error text)
    pub message: Option<String>,
    /// Output files, sorted, relative to the run root
    pub files: Vec<String>,
}

impl SlotStatus {
    pub fn queued(slot: impl Into<String>) -> Self {
        Self {
            slot: slot.into(),
            status: RunState::Queued,
            started_at: None,
            ended_at: None,
            message: None,
            files: Vec::new(),
        }
    }
}

/// Full status record of one job.
///
/// `mode` mirrors `current_mode` for wire compatibility with clients that
/// predate multi-mode sequences.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStatus {
    pub run_id: String,
    /// Current mode (legacy alias of `current_mode`)
    pub mode: String,
    pub started_at: DateTime<Utc>,
    pub status: RunState,
    pub ended_at: Option<DateTime<Utc>>,
    pub slots: Vec<SlotStatus>,
    /// Derived on read, never stored
    #[serde(default)]
    pub progress_pct: i64,
    /// Derived on read, never stored
    #[serde(default)]
    pub remaining_s: Option<i64>,
    pub modes: Vec<String>,
    pub current_mode: Option<String>,
    pub remaining_modes: Vec<String>,
}

/// Lightweight listing entry for `GET /jobs`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobOverview {
    pub run_id: String,
    pub mode: String,
    pub status: RunState,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub devices: Vec<String>,
}

/// Target slots of a submission: an explicit list or the keyword `"all"`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SlotSelection {
    Keyword(String),
    Explicit(Vec<String>),
}

/// Job submission request body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRequest {
    /// Target slots, e.g. `["slot01", "slot02"]` or `"all"`
    pub devices: SlotSelection,
    /// Ordered, non-empty list of modes to run on every slot
    pub modes: Vec<String>,
    /// Parameter bundle per mode; required for every listed mode
    #[serde(default)]
    pub params_by_mode: HashMap<String, Map<String, Value>>,
    /// Transimpedance amplifier gain, passed through to the driver
    #[serde(default = "default_tia_gain")]
    pub tia_gain: Option<i64>,
    /// Sampling interval override, passed through to the driver
    #[serde(default)]
    pub sampling_interval: Option<f64>,
    /// Experiment name used for the storage layout
    pub experiment_name: String,
    /// Optional grouping subdirectory
    #[serde(default)]
    pub subdir: Option<String>,
    /// Client timestamp used for directory and file names
    pub client_datetime: String,
    /// Explicit run identifier; generated when absent
    #[serde(default)]
    pub run_name: Option<String>,
    /// Legacy alias for `subdir`, also recorded as the raw group tag
    #[serde(default)]
    pub folder_name: Option<String>,
    /// Whether to render plot artifacts after each successful mode
    #[serde(default = "default_make_plot")]
    pub make_plot: bool,
}

fn default_tia_gain() -> Option<i64> {
    Some(0)
}

fn default_make_plot() -> bool {
    true
}

/// Body of the bulk status lookup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkStatusRequest {
    pub run_ids: Vec<String>,
}

/// Response of the cancel endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelResponse {
    pub run_id: String,
    pub status: RunState,
}

/// Coarse state filter for the overview listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StateFilter {
    Incomplete,
    Completed,
}

/// The job status as a pure function of its slots' statuses.
///
/// Any queued or running slot keeps the job `running`; otherwise `failed`
/// dominates `cancelled` dominates `done`.
pub fn aggregate_state(slots: &[SlotStatus]) -> RunState {
    if slots
        .iter()
        .any(|s| matches!(s.status, RunState::Queued | RunState::Running))
    {
        return RunState::Running;
    }
    if slots.iter().any(|s| s.status == RunState::Failed) {
        RunState::Failed
    } else if slots.iter().any(|s| s.status == RunState::Cancelled) {
        RunState::Cancelled
    } else {
        RunState::Done
    }
}

/// Listing refinement: a job whose slots are all still queued shows as
/// `queued`. Used only for filtering and display, never stored.
pub fn overview_state(job: &JobStatus) -> RunState {
    if !job.slots.is_empty() && job.slots.iter().all(|s| s.status == RunState::Queued) {
        return RunState::Queued;
    }
    job.status
}
