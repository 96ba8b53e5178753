//! Duration estimation and progress computation for measurement jobs.
//!
//! Pure, stateless helpers: [`estimate_planned_duration`] predicts how long a
//! single mode invocation will take from its parameter bundle, and
//! [`compute_progress`] derives an aggregate percent-complete and remaining
//! time from a point-in-time view of a job's slots. Progress is never stored;
//! it is recomputed on every status read against the live clock.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use crate::jobs::model::{RunState, SlotStatus};

/// Fixed per-mode overhead added to every estimate, in seconds.
const SETUP_OVERHEAD_S: f64 = 1.0;

/// Derived progress metrics for one job snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressMetrics {
    /// Overall percent complete, 0-100
    pub progress_pct: i64,
    /// Remaining seconds, when an estimate exists
    pub remaining_s: Option<i64>,
}

fn as_float(value: Option<&Value>) -> Option<f64> {
    let num = match value? {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    if num.is_nan() || num.is_infinite() {
        return None;
    }
    Some(num)
}

fn as_positive_float(value: Option<&Value>) -> Option<f64> {
    as_float(value).filter(|n| *n > 0.0)
}

fn as_positive_int(value: Option<&Value>) -> Option<i64> {
    let num = as_positive_float(value)?;
    let integer = num as i64;
    if integer <= 0 {
        return None;
    }
    Some(integer)
}

fn list_len(value: Option<&Value>) -> Option<usize> {
    match value? {
        Value::Array(items) => Some(items.len()),
        _ => None,
    }
}

/// Estimate the total duration of one mode invocation in seconds.
///
/// Each supported mode has its own closed-form model; all of them add a fixed
/// setup constant. Returns `None` for unsupported modes or when a required
/// numeric field is missing, non-finite, or non-positive where positivity is
/// required - callers treat `None` as "unknown", never as an error.
pub fn estimate_planned_duration(mode: &str, params: &Map<String, Value>) -> Option<f64> {
    if mode.is_empty() || params.is_empty() {
        return None;
    }

    match mode.to_uppercase().as_str() {
        "CV" => {
            let scan_rate = as_positive_float(params.get("scan_rate"))?;
            let cycles = as_positive_float(params.get("cycles"))?;
            let start = as_float(params.get("start"))?;
            let vertex1 = as_float(params.get("vertex1"))?;
            let vertex2 = as_float(params.get("vertex2"))?;
            let end = as_float(params.get("end"))?;
            let sweep = (vertex1 - start).abs() + (vertex2 - vertex1).abs() + (end - vertex2).abs();
            if sweep <= 0.0 {
                return None;
            }
            Some((sweep / scan_rate) * cycles.max(1.0) + SETUP_OVERHEAD_S)
        }
        "CA" | "CP" | "OCP" => {
            let duration = as_positive_float(params.get("duration"))?;
            Some(duration + SETUP_OVERHEAD_S)
        }
        "LSV" => {
            let start = as_float(params.get("start"))?;
            let end = as_float(params.get("end"))?;
            let scan_rate = as_positive_float(params.get("scan_rate"))?;
            Some((end - start).abs() / scan_rate + SETUP_OVERHEAD_S)
        }
        "PSTEP" => {
            let steps = list_len(params.get("potentials")).filter(|n| *n > 0)?;
            let step_duration = as_positive_float(params.get("step_duration"))?;
            Some(steps as f64 * step_duration + SETUP_OVERHEAD_S)
        }
        "GS" => {
            let num_steps = as_positive_int(params.get("num_steps"))?;
            let step_duration = as_positive_float(params.get("step_duration"))?;
            Some(num_steps as f64 * step_duration + SETUP_OVERHEAD_S)
        }
        "GCV" => {
            let num_steps = as_positive_int(params.get("num_steps"))?;
            let step_duration = as_positive_float(params.get("step_duration"))?;
            let cycles = as_positive_int(params.get("cycles"))?;
            Some(num_steps as f64 * step_duration * cycles.max(1) as f64 + SETUP_OVERHEAD_S)
        }
        "STEPSEQ" => {
            let steps = list_len(params.get("currents")).filter(|n| *n > 0)?;
            let step_duration = as_positive_float(params.get("step_duration"))?;
            Some(steps as f64 * step_duration + SETUP_OVERHEAD_S)
        }
        "DC" => {
            let duration = as_positive_float(params.get("duration_s"))?;
            Some(duration + SETUP_OVERHEAD_S)
        }
        "EIS" => estimate_eis(params),
        _ => None,
    }
}

/// EIS sweeps a frequency grid; the time per point is `cycles_per_freq / f`.
fn estimate_eis(params: &Map<String, Value>) -> Option<f64> {
    let start_freq = as_positive_float(params.get("start_freq"))?;
    let end_freq = as_positive_float(params.get("end_freq"))?;
    let points_per_decade = as_positive_float(params.get("points_per_decade"))?;
    let cycles_per_freq = as_positive_float(params.get("cycles_per_freq")).unwrap_or(3.0);

    let spacing = params
        .get("spacing")
        .and_then(Value::as_str)
        .unwrap_or("log")
        .trim()
        .to_lowercase();

    let freqs: Vec<f64> = if ((start_freq - end_freq) / start_freq).abs() < 1e-9 {
        vec![start_freq]
    } else {
        let decades = (end_freq.log10() - start_freq.log10()).abs();
        let points = (((decades * points_per_decade).round() as i64) + 1).max(2) as usize;
        if spacing == "lin" {
            let step = (end_freq - start_freq) / (points - 1) as f64;
            (0..points).map(|i| start_freq + i as f64 * step).collect()
        } else {
            let log_start = start_freq.log10();
            let step_log = (end_freq.log10() - log_start) / (points - 1) as f64;
            (0..points)
                .map(|i| 10f64.powf(log_start + i as f64 * step_log))
                .collect()
        }
    };

    let total: f64 = freqs
        .iter()
        .filter(|f| **f > 0.0)
        .map(|f| cycles_per_freq / f)
        .sum();
    if total <= 0.0 {
        return None;
    }
    Some(total + SETUP_OVERHEAD_S)
}

/// Compute overall progress percentage and remaining seconds for a job.
///
/// Terminal job statuses (`done`, `failed`) always report 100% with nothing
/// remaining. Otherwise each slot contributes 0-100: terminal slots 100,
/// queued slots 0, running slots elapsed/planned capped at 99 (a running slot
/// never reports completion). The overall percentage is the mean of the slot
/// contributions, again capped at 99 while the job is running with at least
/// one actively running slot. Remaining seconds is the worst case over the
/// running slots.
pub fn compute_progress(
    status: RunState,
    slots: &[SlotStatus],
    started_at: Option<DateTime<Utc>>,
    planned_duration_s: Option<f64>,
    now: DateTime<Utc>,
) -> ProgressMetrics {
    if matches!(status, RunState::Done | RunState::Failed) {
        return ProgressMetrics {
            progress_pct: 100,
            remaining_s: Some(0),
        };
    }

    let mut slot_progress: Vec<i64> = Vec::with_capacity(slots.len());
    let mut remaining_candidates: Vec<i64> = Vec::new();

    for slot in slots {
        match slot.status {
            RunState::Done | RunState::Failed => {
                slot_progress.push(100);
                remaining_candidates.push(0);
            }
            RunState::Queued => slot_progress.push(0),
            RunState::Running => {
                let started = slot.started_at.or(started_at);
                match (started, planned_duration_s.filter(|p| *p > 0.0)) {
                    (Some(started), Some(planned)) => {
                        let elapsed = (now - started).num_milliseconds().max(0) as f64 / 1000.0;
                        let mut pct = ((elapsed / planned).min(1.0) * 100.0).round() as i64;
                        if pct >= 100 {
                            pct = 99;
                        }
                        slot_progress.push(pct.max(0));
                        remaining_candidates.push(((planned - elapsed).ceil() as i64).max(0));
                    }
                    _ => slot_progress.push(0),
                }
            }
            RunState::Cancelled => slot_progress.push(0),
        }
    }

    if slot_progress.is_empty() {
        return ProgressMetrics {
            progress_pct: 0,
            remaining_s: None,
        };
    }

    let mut avg =
        (slot_progress.iter().sum::<i64>() as f64 / slot_progress.len() as f64).round() as i64;
    let any_running = slots.iter().any(|s| s.status == RunState::Running);
    if status == RunState::Running && any_running {
        avg = avg.min(99);
    }

    let remaining = if status == RunState::Running {
        remaining_candidates.iter().max().copied()
    } else {
        None
    };

    ProgressMetrics {
        progress_pct: avg,
        remaining_s: remaining,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn params(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }

    fn slot(name: &str, status: RunState, started_s_ago: Option<i64>) -> SlotStatus {
        SlotStatus {
            slot: name.to_string(),
            status,
            started_at: started_s_ago.map(|s| Utc::now() - Duration::seconds(s)),
            ended_at: None,
            message: None,
            files: Vec::new(),
        }
    }

    #[test]
    fn test_cv_estimate_matches_closed_form() {
        let p = params(json!({
            "start": 0, "vertex1": 0.5, "vertex2": -0.5, "end": 0,
            "scan_rate": 0.1, "cycles": 1
        }));
        // (0.5 + 1.0 + 0.5) / 0.1 * 1 + 1.0
        assert_eq!(estimate_planned_duration("CV", &p), Some(21.0));
    }

    #[test]
    fn test_cv_estimate_rejects_zero_sweep() {
        let p = params(json!({
            "start": 1, "vertex1": 1, "vertex2": 1, "end": 1,
            "scan_rate": 0.1, "cycles": 2
        }));
        assert_eq!(estimate_planned_duration("CV", &p), None);
    }

    #[test]
    fn test_fixed_duration_modes() {
        let p = params(json!({"duration": 30}));
        assert_eq!(estimate_planned_duration("CA", &p), Some(31.0));
        assert_eq!(estimate_planned_duration("OCP", &p), Some(31.0));
        let p = params(json!({"duration_s": 12.5}));
        assert_eq!(estimate_planned_duration("DC", &p), Some(13.5));
    }

    #[test]
    fn test_stepped_modes() {
        let p = params(json!({"potentials": [0.1, 0.2, 0.3], "step_duration": 2.0}));
        assert_eq!(estimate_planned_duration("PSTEP", &p), Some(7.0));
        let p = params(json!({"num_steps": 4, "step_duration": 0.5, "cycles": 3}));
        assert_eq!(estimate_planned_duration("GCV", &p), Some(7.0));
    }

    #[test]
    fn test_eis_single_frequency() {
        let p = params(json!({
            "start_freq": 10.0, "end_freq": 10.0,
            "points_per_decade": 5, "cycles_per_freq": 2.0
        }));
        // one point: 2.0 / 10.0 + setup
        assert_eq!(estimate_planned_duration("EIS", &p), Some(1.2));
    }

    #[test]
    fn test_eis_log_grid_counts_points() {
        let p = params(json!({
            "start_freq": 1.0, "end_freq": 100.0,
            "points_per_decade": 1, "cycles_per_freq": 1.0
        }));
        // 3 log-spaced points: 1/1 + 1/10 + 1/100 + setup
        let total = estimate_planned_duration("EIS", &p).unwrap();
        assert!((total - 2.11).abs() < 1e-9, "got {total}");
    }

    #[test]
    fn test_unknown_mode_is_none_not_error() {
        let p = params(json!({"anything": 1}));
        assert_eq!(estimate_planned_duration("XYZ", &p), None);
    }

    #[test]
    fn test_rejects_non_finite_fields() {
        let p = params(json!({"duration": "inf"}));
        assert_eq!(estimate_planned_duration("CA", &p), None);
        let p = params(json!({"duration": "not-a-number"}));
        assert_eq!(estimate_planned_duration("CA", &p), None);
    }

    #[test]
    fn test_terminal_job_reports_complete() {
        let slots = vec![slot("slot01", RunState::Done, None)];
        let m = compute_progress(RunState::Done, &slots, None, None, Utc::now());
        assert_eq!(m.progress_pct, 100);
        assert_eq!(m.remaining_s, Some(0));
        let m = compute_progress(RunState::Failed, &slots, None, None, Utc::now());
        assert_eq!(m.progress_pct, 100);
    }

    #[test]
    fn test_running_slot_is_capped_at_99() {
        // running far past its planned duration: still never 100
        let slots = vec![slot("slot01", RunState::Running, Some(500))];
        let m = compute_progress(RunState::Running, &slots, None, Some(10.0), Utc::now());
        assert_eq!(m.progress_pct, 99);
        assert_eq!(m.remaining_s, Some(0));
    }

    #[test]
    fn test_mixed_slots_average() {
        let slots = vec![
            slot("slot01", RunState::Done, None),
            slot("slot02", RunState::Queued, None),
        ];
        let m = compute_progress(RunState::Running, &slots, None, Some(10.0), Utc::now());
        assert_eq!(m.progress_pct, 50);
        // no running slot: remaining comes from the done slot's 0
        assert_eq!(m.remaining_s, Some(0));
    }

    #[test]
    fn test_queued_only_job_reports_zero() {
        let slots = vec![slot("slot01", RunState::Queued, None)];
        let m = compute_progress(RunState::Running, &slots, None, Some(10.0), Utc::now());
        assert_eq!(m.progress_pct, 0);
        assert_eq!(m.remaining_s, None);
    }

    #[test]
    fn test_cancelled_job_is_not_forced_to_complete() {
        let slots = vec![slot("slot01", RunState::Cancelled, None)];
        let m = compute_progress(RunState::Cancelled, &slots, None, None, Utc::now());
        assert_eq!(m.progress_pct, 0);
        assert_eq!(m.remaining_s, None);
    }
}
