//! Job and slot orchestration.
//!
//! The [`JobManager`] is the central scheduler: it owns the job registry and
//! the slot reservation map, admits submissions (all-or-nothing slot
//! reservation, full rollback on partial setup failure), launches one worker
//! task per slot, recomputes aggregate job state on every slot transition,
//! and hands completed runs to the storage sync tier.
//!
//! The manager is a cheap handle around an `Arc`'d core so request handlers
//! and worker tasks share one set of registries with an explicit lifecycle.
//! Locking: the job registry and the slot reservation map each have their own
//! lock, held only for short bookkeeping sections and never across a hardware
//! or network await. Locks are never nested.

use chrono::Utc;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::driver::DeviceDirectory;
use crate::error::{AppResult, BoxError};
use crate::plot::PlotRenderer;
use crate::progress::{compute_progress, estimate_planned_duration};
use crate::storage::{value_or_none, RunDirectoryIndex, RunStorageInfo};
use crate::sync::StorageSyncManager;

pub mod model;
mod worker;

pub use model::{
    aggregate_state, overview_state, BulkStatusRequest, CancelResponse, JobOverview, JobRequest,
    JobStatus, RunState, SlotSelection, SlotStatus, StateFilter,
};

/// Transient scheduling metadata, dropped once the job is terminal.
struct JobMeta {
    mode: String,
    params: Map<String, Value>,
    planned_duration_s: Option<f64>,
}

/// One registry entry: the shared status record plus transient state.
struct JobEntry {
    status: JobStatus,
    meta: Option<JobMeta>,
    cancel: Option<CancellationToken>,
    /// Raw caller-supplied group identifier
    group_id: Option<String>,
    /// Sanitized storage folder name
    group_folder: Option<String>,
}

/// Outcome of one slot's mode sequence, set by its worker.
pub(crate) enum SlotOutcome {
    Done,
    Failed(String),
    Cancelled,
}

/// The central job/slot scheduler. Cloning yields another handle to the same
/// registries.
#[derive(Clone)]
pub struct JobManager {
    core: Arc<JobCore>,
}

/// Shared state behind the manager handle.
pub(crate) struct JobCore {
    devices: Arc<DeviceDirectory>,
    index: Arc<RunDirectoryIndex>,
    sync: StorageSyncManager,
    plotter: Arc<dyn PlotRenderer>,
    jobs: Mutex<HashMap<String, JobEntry>>,
    slot_runs: Mutex<HashMap<String, String>>,
}

impl JobManager {
    pub fn new(
        devices: Arc<DeviceDirectory>,
        index: Arc<RunDirectoryIndex>,
        sync: StorageSyncManager,
        plotter: Arc<dyn PlotRenderer>,
    ) -> Self {
        Self {
            core: Arc::new(JobCore {
                devices,
                index,
                sync,
                plotter,
                jobs: Mutex::new(HashMap::new()),
                slot_runs: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Admit a job and launch one worker task per reserved slot.
    ///
    /// Validation failures reject before any resource is touched. Slot
    /// reservation is all-or-nothing: either every requested slot is free and
    /// gets reserved, or none are. Any failure after reservation rolls back
    /// every piece of partial state (reservations, job entry, directory-index
    /// mapping). Returns an immediate status snapshot on success.
    pub async fn start_job(&self, req: JobRequest) -> AppResult<JobStatus> {
        let core = &self.core;

        if req.modes.is_empty() {
            return Err(BoxError::EmptyModes);
        }
        for mode in &req.modes {
            if !req.params_by_mode.contains_key(mode) {
                return Err(BoxError::MissingModeParams(mode.clone()));
            }
        }

        let slots = match &req.devices {
            SlotSelection::Keyword(word) if word == "all" => core.devices.slots().await,
            SlotSelection::Keyword(_) => return Err(BoxError::InvalidDevices),
            SlotSelection::Explicit(list) => core.devices.filter_known(list).await,
        };
        if slots.is_empty() {
            return Err(BoxError::InvalidDevices);
        }

        let run_id = match value_or_none(req.run_name.as_deref()) {
            Some(name) => name.to_string(),
            None => generate_run_id(),
        };

        {
            let jobs = core.jobs.lock().await;
            if jobs.contains_key(&run_id) {
                return Err(BoxError::RunIdConflict(run_id));
            }
        }

        {
            let mut slot_runs = core.slot_runs.lock().await;
            let mut busy: Vec<String> = slots
                .iter()
                .filter(|s| slot_runs.contains_key(*s))
                .cloned()
                .collect();
            if !busy.is_empty() {
                busy.sort();
                return Err(BoxError::SlotsBusy(busy));
            }
            for slot in &slots {
                slot_runs.insert(slot.clone(), run_id.clone());
            }
        }

        match core.admit_reserved(core, &req, &run_id, &slots).await {
            Ok(snapshot) => Ok(snapshot),
            Err(err) => {
                core.rollback_admission(&run_id, &slots).await;
                Err(err)
            }
        }
    }

    /// Signal cancellation for a running or queued job.
    ///
    /// Idempotent: already-terminal jobs report their current status; a
    /// second cancel on a running job simply re-signals an already-cancelled
    /// token. Slots that never started are finalized immediately and their
    /// reservations released; running slots observe the token cooperatively.
    pub async fn cancel_job(&self, run_id: &str) -> AppResult<CancelResponse> {
        let core = &self.core;
        let queued_slots: Vec<String>;
        {
            let mut jobs = core.jobs.lock().await;
            let entry = jobs
                .get_mut(run_id)
                .ok_or_else(|| BoxError::JobNotFound(run_id.to_string()))?;

            if entry.status.status.is_terminal() {
                return Ok(CancelResponse {
                    run_id: run_id.to_string(),
                    status: entry.status.status,
                });
            }

            if let Some(token) = &entry.cancel {
                token.cancel();
            }

            let now = Utc::now();
            queued_slots = entry
                .status
                .slots
                .iter_mut()
                .filter(|slot| slot.status == RunState::Queued)
                .map(|slot| {
                    slot.status = RunState::Cancelled;
                    slot.started_at.get_or_insert(now);
                    slot.ended_at = Some(now);
                    slot.message = Some("cancelled".to_string());
                    slot.files.clear();
                    slot.slot.clone()
                })
                .collect();

            JobCore::recompute_locked(entry);
        }

        if !queued_slots.is_empty() {
            let mut slot_runs = core.slot_runs.lock().await;
            for slot in &queued_slots {
                if slot_runs.get(slot).map(String::as_str) == Some(run_id) {
                    slot_runs.remove(slot);
                }
            }
        }

        info!(run_id, queued_slots = queued_slots.len(), "job cancel requested");
        Ok(CancelResponse {
            run_id: run_id.to_string(),
            status: RunState::Cancelled,
        })
    }

    /// Point-in-time snapshot of one job with derived progress.
    pub async fn snapshot(&self, run_id: &str) -> AppResult<JobStatus> {
        let jobs = self.core.jobs.lock().await;
        let entry = jobs
            .get(run_id)
            .ok_or_else(|| BoxError::JobNotFound(run_id.to_string()))?;
        Ok(JobCore::snapshot_entry(entry))
    }

    /// Snapshots for several runs; fails entirely if any id is unknown.
    pub async fn bulk_snapshots(&self, run_ids: &[String]) -> AppResult<Vec<JobStatus>> {
        let requested: Vec<&String> = run_ids.iter().filter(|id| !id.is_empty()).collect();
        if requested.is_empty() {
            return Err(BoxError::MissingRunIds);
        }
        let jobs = self.core.jobs.lock().await;
        let mut missing: Vec<String> = requested
            .iter()
            .filter(|id| !jobs.contains_key(id.as_str()))
            .map(|id| (*id).clone())
            .collect();
        if !missing.is_empty() {
            missing.sort();
            return Err(BoxError::UnknownRunIds(missing));
        }
        Ok(requested
            .iter()
            .filter_map(|id| jobs.get(id.as_str()).map(JobCore::snapshot_entry))
            .collect())
    }

    /// Overview listing with optional coarse-state and group filtering.
    ///
    /// The group filter matches case-insensitively against the job's raw
    /// group tag, its sanitized storage folder, or the second-to-last path
    /// segment of its resolved run directory.
    pub async fn list_jobs(
        &self,
        state: Option<StateFilter>,
        group_id: Option<&str>,
    ) -> Vec<JobOverview> {
        let core = &self.core;
        let group_filter = value_or_none(group_id).map(str::to_lowercase);

        struct ListingRow {
            status: JobStatus,
            group_id: Option<String>,
            group_folder: Option<String>,
        }

        let rows: Vec<ListingRow> = {
            let jobs = core.jobs.lock().await;
            jobs.values()
                .map(|entry| ListingRow {
                    status: entry.status.clone(),
                    group_id: entry.group_id.clone(),
                    group_folder: entry.group_folder.clone(),
                })
                .collect()
        };

        let mut results = Vec::new();
        for row in rows {
            let overview_status = overview_state(&row.status);
            match state {
                Some(StateFilter::Incomplete)
                    if !matches!(overview_status, RunState::Queued | RunState::Running) =>
                {
                    continue
                }
                Some(StateFilter::Completed) if !overview_status.is_terminal() => continue,
                _ => {}
            }

            if let Some(filter) = &group_filter {
                let mut candidates: Vec<String> = Vec::new();
                if let Some(raw) = value_or_none(row.group_id.as_deref()) {
                    candidates.push(raw.to_lowercase());
                }
                if let Some(folder) = value_or_none(row.group_folder.as_deref()) {
                    candidates.push(folder.to_lowercase());
                }
                if let Some(folder) = core.derive_group_folder(&row.status.run_id) {
                    candidates.push(folder.to_lowercase());
                }
                if !candidates.contains(filter) {
                    continue;
                }
            }

            results.push(JobOverview {
                run_id: row.status.run_id.clone(),
                mode: row.status.mode.clone(),
                status: overview_status,
                started_at: Some(row.status.started_at),
                ended_at: row.status.ended_at,
                devices: row.status.slots.iter().map(|s| s.slot.clone()).collect(),
            });
        }

        results.sort_by(|a, b| (b.started_at, &b.run_id).cmp(&(a.started_at, &a.run_id)));
        results
    }

    /// Slots currently bound to an active run, for tests and diagnostics.
    pub async fn reserved_slots(&self) -> Vec<String> {
        let slot_runs = self.core.slot_runs.lock().await;
        let mut slots: Vec<String> = slot_runs.keys().cloned().collect();
        slots.sort();
        slots
    }
}

impl JobCore {
    /// Post-reservation part of admission; every failure here is rolled back
    /// by the caller. `core` is the shared handle the workers will hold.
    async fn admit_reserved(
        &self,
        core: &Arc<JobCore>,
        req: &JobRequest,
        run_id: &str,
        slots: &[String],
    ) -> AppResult<JobStatus> {
        let storage_info = RunStorageInfo::from_request(
            &req.experiment_name,
            req.subdir.as_deref(),
            req.folder_name.as_deref(),
            &req.client_datetime,
        )?;
        let run_dir: PathBuf = self.index.root().join(storage_info.relative_dir());
        tokio::fs::create_dir_all(&run_dir).await?;
        self.index.record(run_id, &run_dir)?;

        // Resolve drivers up front so a concurrent rescan cannot strand a
        // half-started job.
        let mut drivers = Vec::with_capacity(slots.len());
        for slot in slots {
            match self.devices.driver(slot).await {
                Some(driver) => drivers.push(driver),
                None => return Err(BoxError::InvalidDevices),
            }
        }

        let raw_group_id = value_or_none(req.folder_name.as_deref())
            .or_else(|| value_or_none(req.subdir.as_deref()))
            .map(str::to_string);

        let first_mode = req.modes[0].clone();
        let first_params = req
            .params_by_mode
            .get(&first_mode)
            .cloned()
            .unwrap_or_default();
        let planned = estimate_planned_duration(&first_mode, &first_params);

        let job = JobStatus {
            run_id: run_id.to_string(),
            mode: first_mode.clone(),
            started_at: Utc::now(),
            status: RunState::Running,
            ended_at: None,
            slots: slots
                .iter()
                .map(|slot| SlotStatus::queued(slot.clone()))
                .collect(),
            progress_pct: 0,
            remaining_s: None,
            modes: req.modes.clone(),
            current_mode: Some(first_mode.clone()),
            remaining_modes: req.modes[1..].to_vec(),
        };

        let token = CancellationToken::new();
        {
            let mut jobs = self.jobs.lock().await;
            jobs.insert(
                run_id.to_string(),
                JobEntry {
                    status: job,
                    meta: Some(JobMeta {
                        mode: first_mode,
                        params: first_params,
                        planned_duration_s: planned,
                    }),
                    cancel: Some(token.clone()),
                    group_id: raw_group_id.clone(),
                    group_folder: storage_info.subdir.clone(),
                },
            );
        }

        info!(run_id, modes = ?req.modes, slots = ?slots, "job started");
        debug!(
            run_id,
            group_id = raw_group_id.as_deref().unwrap_or("-"),
            folder = storage_info.subdir.as_deref().unwrap_or("-"),
            experiment = %storage_info.experiment,
            "job storage layout"
        );

        for (slot, driver) in slots.iter().zip(drivers) {
            let ctx = worker::SlotWorkerContext {
                core: Arc::clone(core),
                run_id: run_id.to_string(),
                slot: slot.clone(),
                driver,
                run_dir: run_dir.clone(),
                modes: req.modes.clone(),
                params_by_mode: req.params_by_mode.clone(),
                tia_gain: req.tia_gain,
                sampling_interval: req.sampling_interval,
                make_plot: req.make_plot,
                filename_prefix: storage_info.filename_prefix.clone(),
                cancel: token.clone(),
            };
            tokio::spawn(worker::run_slot_sequence(ctx));
        }

        let jobs = self.jobs.lock().await;
        jobs.get(run_id)
            .map(Self::snapshot_entry)
            .ok_or_else(|| BoxError::JobNotFound(run_id.to_string()))
    }

    /// Undo partial admission state after a failure.
    async fn rollback_admission(&self, run_id: &str, slots: &[String]) {
        {
            let mut slot_runs = self.slot_runs.lock().await;
            for slot in slots {
                if slot_runs.get(slot).map(String::as_str) == Some(run_id) {
                    slot_runs.remove(slot);
                }
            }
        }
        {
            let mut jobs = self.jobs.lock().await;
            jobs.remove(run_id);
        }
        if let Err(err) = self.index.forget(run_id) {
            warn!(run_id, error = %err, "failed to roll back run directory mapping");
        }
    }

    /// Second-to-last path segment of the run directory, used as an implicit
    /// group tag for runs created before explicit tags existed.
    fn derive_group_folder(&self, run_id: &str) -> Option<String> {
        let run_dir = self.index.resolve(run_id).ok()?;
        let rel = run_dir.strip_prefix(self.index.root()).ok()?;
        let parts: Vec<String> = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        if parts.len() >= 3 {
            parts.get(parts.len() - 2).cloned()
        } else {
            None
        }
    }

    fn snapshot_entry(entry: &JobEntry) -> JobStatus {
        let mut copy = entry.status.clone();
        let planned = entry.meta.as_ref().and_then(|meta| {
            meta.planned_duration_s
                .or_else(|| estimate_planned_duration(&meta.mode, &meta.params))
        });
        let metrics = compute_progress(
            copy.status,
            &copy.slots,
            Some(copy.started_at),
            planned,
            Utc::now(),
        );
        copy.progress_pct = metrics.progress_pct;
        copy.remaining_s = metrics.remaining_s;
        copy
    }

    /// Recompute the aggregate status after a slot transition. Returns true
    /// when the job transitioned to terminal `done` with this call.
    fn recompute_locked(entry: &mut JobEntry) -> bool {
        let was_terminal = entry.status.status.is_terminal();
        let aggregate = aggregate_state(&entry.status.slots);

        if aggregate == RunState::Running {
            entry.status.status = RunState::Running;
            entry.status.ended_at = None;
            return false;
        }

        entry.status.status = aggregate;
        entry.status.ended_at = Some(Utc::now());
        entry.status.current_mode = None;
        entry.status.remaining_modes.clear();
        // drop transient scheduling state once terminal
        entry.meta = None;
        entry.cancel = None;

        !was_terminal && aggregate == RunState::Done
    }

    /// Publish the current/remaining mode of a sequence into the job record.
    pub(crate) async fn publish_current_mode(&self, run_id: &str, modes: &[String], idx: usize) {
        let mut jobs = self.jobs.lock().await;
        if let Some(entry) = jobs.get_mut(run_id) {
            if let Some(mode) = modes.get(idx) {
                entry.status.mode = mode.clone();
                entry.status.current_mode = Some(mode.clone());
            }
            entry.status.modes = modes.to_vec();
            entry.status.remaining_modes = modes.get(idx + 1..).unwrap_or(&[]).to_vec();
        }
    }

    /// Mark a slot as running at the start of its sequence.
    pub(crate) async fn mark_slot_running(&self, run_id: &str, slot: &str) {
        let mut jobs = self.jobs.lock().await;
        if let Some(entry) = jobs.get_mut(run_id) {
            if let Some(slot_status) = entry.status.slots.iter_mut().find(|s| s.slot == slot) {
                slot_status.status = RunState::Running;
                slot_status.started_at.get_or_insert_with(Utc::now);
                slot_status.message = None;
            }
            entry.status.status = RunState::Running;
            entry.status.ended_at = None;
        }
    }

    /// Record a slot's terminal outcome, recompute the aggregate status, and
    /// release the slot reservation. Hands the run to the storage sync tier
    /// when the whole job finished successfully.
    pub(crate) async fn finalize_slot(
        &self,
        run_id: &str,
        slot: &str,
        outcome: SlotOutcome,
        mut files: Vec<String>,
    ) {
        let became_done = {
            let mut jobs = self.jobs.lock().await;
            match jobs.get_mut(run_id) {
                None => false,
                Some(entry) => {
                    if let Some(slot_status) =
                        entry.status.slots.iter_mut().find(|s| s.slot == slot)
                    {
                        match outcome {
                            SlotOutcome::Done => {
                                slot_status.status = RunState::Done;
                                slot_status.message = None;
                            }
                            SlotOutcome::Failed(message) => {
                                slot_status.status = RunState::Failed;
                                slot_status.message = Some(message);
                            }
                            SlotOutcome::Cancelled => {
                                slot_status.status = RunState::Cancelled;
                                slot_status.message = Some("cancelled".to_string());
                            }
                        }
                        let now = Utc::now();
                        slot_status.started_at.get_or_insert(now);
                        slot_status.ended_at = Some(now);
                        files.sort();
                        slot_status.files = files;
                    }
                    Self::recompute_locked(entry)
                }
            }
        };

        if became_done {
            // enqueue failure is logged inside the sync tier; it never
            // surfaces here or flips the job status
            self.sync.enqueue_upload(run_id).await;
        }

        let mut slot_runs = self.slot_runs.lock().await;
        if slot_runs.get(slot).map(String::as_str) == Some(run_id) {
            slot_runs.remove(slot);
        }
    }

    pub(crate) fn plotter(&self) -> &Arc<dyn PlotRenderer> {
        &self.plotter
    }
}

fn generate_run_id() -> String {
    let stamp = Utc::now().format("%Y%m%dT%H%M%S");
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{stamp}_{}", &suffix[..6])
}

#[cfg(test)]
impl JobManager {
    /// Insert a job whose slots are still queued and reserved, without
    /// spawning workers. Lets tests exercise the pre-start cancellation path
    /// deterministically.
    pub(crate) async fn insert_queued_job_for_tests(&self, run_id: &str, slots: &[&str]) {
        let job = JobStatus {
            run_id: run_id.to_string(),
            mode: "CV".to_string(),
            started_at: Utc::now(),
            status: RunState::Running,
            ended_at: None,
            slots: slots.iter().map(|slot| SlotStatus::queued(*slot)).collect(),
            progress_pct: 0,
            remaining_s: None,
            modes: vec!["CV".to_string()],
            current_mode: Some("CV".to_string()),
            remaining_modes: Vec::new(),
        };
        self.core.jobs.lock().await.insert(
            run_id.to_string(),
            JobEntry {
                status: job,
                meta: None,
                cancel: Some(CancellationToken::new()),
                group_id: None,
                group_folder: None,
            },
        );
        let mut slot_runs = self.core.slot_runs.lock().await;
        for slot in slots {
            slot_runs.insert((*slot).to_string(), run_id.to_string());
        }
    }
}
