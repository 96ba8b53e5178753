//! Per-slot worker: runs one job's mode sequence on one instrument.
//!
//! Each worker owns its slot for the lifetime of the job. Modes run strictly
//! in order; the measurement itself runs on its own task so the worker can
//! await the cancellation token concurrently. On the first observed
//! cancellation during a mode the worker requests a hardware abort exactly
//! once (advisory - an unsupported or failed abort is logged and never
//! retried) and keeps waiting for the measurement task to finish on its own.
//! Cancellation is authoritative at this layer: once signalled, no further
//! mode starts and the slot ends `cancelled` regardless of what the hardware
//! reports.

use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{JobCore, SlotOutcome};
use crate::driver::{AbortOutcome, MeasurementDriver, MeasurementSpec};
use crate::storage::sanitize_path_segment;

/// Everything one slot worker needs, captured at admission time.
pub(crate) struct SlotWorkerContext {
    pub core: Arc<JobCore>,
    pub run_id: String,
    pub slot: String,
    pub driver: Arc<dyn MeasurementDriver>,
    pub run_dir: PathBuf,
    pub modes: Vec<String>,
    pub params_by_mode: HashMap<String, Map<String, Value>>,
    pub tia_gain: Option<i64>,
    pub sampling_interval: Option<f64>,
    pub make_plot: bool,
    pub filename_prefix: String,
    pub cancel: CancellationToken,
}

/// Run the full mode sequence for one slot, then finalize it.
pub(crate) async fn run_slot_sequence(ctx: SlotWorkerContext) {
    let slot_segment = match sanitize_path_segment(&ctx.slot, "slot") {
        Ok(segment) => segment,
        Err(err) => {
            ctx.core
                .finalize_slot(
                    &ctx.run_id,
                    &ctx.slot,
                    SlotOutcome::Failed(err.to_string()),
                    Vec::new(),
                )
                .await;
            return;
        }
    };

    ctx.core.mark_slot_running(&ctx.run_id, &ctx.slot).await;

    let mut files_collected: Vec<String> = Vec::new();
    let mut outcome = SlotOutcome::Done;

    for (idx, mode) in ctx.modes.iter().enumerate() {
        if ctx.cancel.is_cancelled() {
            outcome = SlotOutcome::Cancelled;
            break;
        }

        ctx.core
            .publish_current_mode(&ctx.run_id, &ctx.modes, idx)
            .await;

        let mode_segment = match sanitize_path_segment(mode, "mode") {
            Ok(segment) => segment,
            Err(err) => {
                outcome = SlotOutcome::Failed(err.to_string());
                break;
            }
        };
        let mode_dir = ctx
            .run_dir
            .join("Wells")
            .join(&slot_segment)
            .join(&mode_segment);
        if let Err(err) = tokio::fs::create_dir_all(&mode_dir).await {
            outcome = SlotOutcome::Failed(format!("failed to create output directory: {err}"));
            break;
        }

        let filename = format!("{}_{slot_segment}_{mode_segment}.csv", ctx.filename_prefix);
        let params = ctx.params_by_mode.get(mode).cloned().unwrap_or_default();

        let spec = MeasurementSpec {
            mode: mode.clone(),
            params: params.clone(),
            tia_gain: ctx.tia_gain,
            sampling_interval: ctx.sampling_interval,
            filename: filename.clone(),
            folder: mode_dir.clone(),
        };

        let mut measurement = {
            let driver = Arc::clone(&ctx.driver);
            tokio::spawn(async move { driver.apply_measurement(spec).await })
        };

        let mut abort_requested = false;
        let join_result = loop {
            tokio::select! {
                res = &mut measurement => break res,
                _ = ctx.cancel.cancelled(), if !abort_requested => {
                    abort_requested = true;
                    match ctx.driver.request_abort().await {
                        AbortOutcome::Requested => {
                            debug!(run_id = %ctx.run_id, slot = %ctx.slot, %mode, "abort requested")
                        }
                        AbortOutcome::Unsupported => {
                            debug!(run_id = %ctx.run_id, slot = %ctx.slot, "driver does not support abort")
                        }
                        AbortOutcome::Failed => {
                            warn!(run_id = %ctx.run_id, slot = %ctx.slot, "abort request failed")
                        }
                    }
                }
            }
        };

        if ctx.cancel.is_cancelled() {
            // controller errors during the cancellation window are part of
            // the cancellation flow, not failures
            outcome = SlotOutcome::Cancelled;
            break;
        }

        match join_result {
            Ok(Ok(())) => {
                let csv_path = mode_dir.join(&filename);
                if ctx.make_plot {
                    if let Err(err) = ctx.core.plotter().render(&csv_path, mode, &params) {
                        debug!(run_id = %ctx.run_id, slot = %ctx.slot, error = %err, "plot rendering failed");
                    }
                }
                files_collected
                    .extend(collect_mode_files(&mode_dir, &ctx.run_dir).await);
            }
            Ok(Err(err)) => {
                outcome = SlotOutcome::Failed(err.to_string());
                break;
            }
            Err(join_err) => {
                outcome = SlotOutcome::Failed(format!("measurement task failed: {join_err}"));
                break;
            }
        }
    }

    ctx.core
        .finalize_slot(&ctx.run_id, &ctx.slot, outcome, files_collected)
        .await;
}

/// Files directly inside a mode's output directory, run-root-relative.
async fn collect_mode_files(mode_dir: &Path, run_dir: &Path) -> Vec<String> {
    let mut files = Vec::new();
    let mut entries = match tokio::fs::read_dir(mode_dir).await {
        Ok(entries) => entries,
        Err(_) => return files,
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        if path.is_file() {
            if let Ok(rel) = path.strip_prefix(run_dir) {
                files.push(rel.to_string_lossy().replace('\\', "/"));
            }
        }
    }
    files.sort();
    files
}
