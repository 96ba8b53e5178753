//! End-to-end tests for the job/slot orchestration engine against mock
//! drivers and a temporary runs root.

use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use echem_box::driver::{DeviceDirectory, MockDriverFactory};
use echem_box::error::BoxError;
use echem_box::jobs::{JobManager, JobRequest, JobStatus, RunState, SlotSelection};
use echem_box::plot::NoopPlotRenderer;
use echem_box::storage::RunDirectoryIndex;
use echem_box::sync::{SmbMountTransport, StorageSyncManager};

async fn setup(tmp: &TempDir, device_count: usize) -> JobManager {
    let index = Arc::new(RunDirectoryIndex::new(tmp.path()).unwrap());
    let sync = StorageSyncManager::new(
        Arc::clone(&index),
        tmp.path().join("nas_config.json"),
        tmp.path().join(".nas_credentials"),
        tmp.path().join("mnt"),
        Duration::from_secs(3600),
        Arc::new(SmbMountTransport),
    );
    let devices = Arc::new(DeviceDirectory::new());
    devices
        .rescan(&MockDriverFactory::new(device_count))
        .await
        .unwrap();
    JobManager::new(devices, index, sync, Arc::new(NoopPlotRenderer))
}

fn params(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

fn request(devices: SlotSelection, modes: &[(&str, Value)]) -> JobRequest {
    let mut params_by_mode = HashMap::new();
    for (mode, p) in modes {
        params_by_mode.insert((*mode).to_string(), params(p.clone()));
    }
    JobRequest {
        devices,
        modes: modes.iter().map(|(m, _)| (*m).to_string()).collect(),
        params_by_mode,
        tia_gain: Some(0),
        sampling_interval: None,
        experiment_name: "demo".to_string(),
        subdir: None,
        client_datetime: "2026-08-06T10:00:00".to_string(),
        run_name: None,
        folder_name: None,
        make_plot: false,
    }
}

fn cv_params(duration_ms: u64) -> Value {
    json!({
        "start": 0, "vertex1": 0.5, "vertex2": -0.5, "end": 0,
        "scan_rate": 0.1, "cycles": 1,
        "mock_duration_ms": duration_ms
    })
}

async fn wait_terminal(manager: &JobManager, run_id: &str) -> JobStatus {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let snapshot = manager.snapshot(run_id).await.unwrap();
            if snapshot.status.is_terminal() {
                return snapshot;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("job did not reach a terminal state in time")
}

#[tokio::test]
async fn test_single_mode_job_runs_to_done() {
    let tmp = TempDir::new().unwrap();
    let manager = setup(&tmp, 2).await;

    let mut req = request(SlotSelection::Keyword("all".into()), &[("CV", cv_params(20))]);
    req.run_name = Some("run_cv".to_string());
    let snapshot = manager.start_job(req).await.unwrap();
    assert_eq!(snapshot.run_id, "run_cv");
    assert_eq!(snapshot.slots.len(), 2);

    let done = wait_terminal(&manager, "run_cv").await;
    assert_eq!(done.status, RunState::Done);
    assert_eq!(done.progress_pct, 100);
    assert_eq!(done.remaining_s, Some(0));
    assert!(done.ended_at.is_some());
    assert!(done.current_mode.is_none());
    assert!(done.remaining_modes.is_empty());

    for (i, slot) in done.slots.iter().enumerate() {
        let slot_name = format!("slot{:02}", i + 1);
        assert_eq!(slot.slot, slot_name);
        assert_eq!(slot.status, RunState::Done);
        assert_eq!(
            slot.files,
            vec![format!(
                "Wells/{slot_name}/CV/demo_2026-08-06_10-00-00_{slot_name}_CV.csv"
            )]
        );
    }

    // all reservations released
    assert!(manager.reserved_slots().await.is_empty());
}

#[tokio::test]
async fn test_multi_mode_sequence_collects_files_per_mode() {
    let tmp = TempDir::new().unwrap();
    let manager = setup(&tmp, 1).await;

    let mut req = request(
        SlotSelection::Explicit(vec!["slot01".into()]),
        &[
            ("CV", cv_params(10)),
            ("CA", json!({"duration": 5, "mock_duration_ms": 10})),
        ],
    );
    req.run_name = Some("run_seq".to_string());
    manager.start_job(req).await.unwrap();

    let done = wait_terminal(&manager, "run_seq").await;
    assert_eq!(done.status, RunState::Done);
    assert_eq!(done.modes, vec!["CV", "CA"]);
    let files = &done.slots[0].files;
    assert_eq!(files.len(), 2);
    assert!(files[0].contains("/CA/") || files[1].contains("/CA/"));
    assert!(files[0].contains("/CV/") || files[1].contains("/CV/"));
}

#[tokio::test]
async fn test_failed_measurement_surfaces_driver_error() {
    let tmp = TempDir::new().unwrap();
    let manager = setup(&tmp, 1).await;

    let mut req = request(
        SlotSelection::Explicit(vec!["slot01".into()]),
        &[("CV", json!({"mock_fail": "cell disconnected"}))],
    );
    req.run_name = Some("run_fail".to_string());
    manager.start_job(req).await.unwrap();

    let done = wait_terminal(&manager, "run_fail").await;
    assert_eq!(done.status, RunState::Failed);
    assert_eq!(done.slots[0].status, RunState::Failed);
    let message = done.slots[0].message.as_deref().unwrap();
    assert!(message.contains("cell disconnected"), "got: {message}");
}

#[tokio::test]
async fn test_busy_slot_rejects_whole_submission() {
    let tmp = TempDir::new().unwrap();
    let manager = setup(&tmp, 2).await;

    let mut blocker = request(
        SlotSelection::Explicit(vec!["slot01".into()]),
        &[("CV", cv_params(60_000))],
    );
    blocker.run_name = Some("run_blocker".to_string());
    manager.start_job(blocker).await.unwrap();

    // second submission wants slot01 (busy) and slot02 (free): all-or-nothing
    let err = manager
        .start_job(request(
            SlotSelection::Explicit(vec!["slot01".into(), "slot02".into()]),
            &[("CV", cv_params(10))],
        ))
        .await
        .unwrap_err();
    match err {
        BoxError::SlotsBusy(busy) => assert_eq!(busy, vec!["slot01"]),
        other => panic!("unexpected error: {other}"),
    }

    // slot02 was never reserved by the rejected submission
    let mut second = request(
        SlotSelection::Explicit(vec!["slot02".into()]),
        &[("CV", cv_params(10))],
    );
    second.run_name = Some("run_free".to_string());
    manager.start_job(second).await.unwrap();
    wait_terminal(&manager, "run_free").await;

    manager.cancel_job("run_blocker").await.unwrap();
    wait_terminal(&manager, "run_blocker").await;
}

#[tokio::test]
async fn test_run_id_collision_is_rejected() {
    let tmp = TempDir::new().unwrap();
    let manager = setup(&tmp, 1).await;

    let mut req = request(
        SlotSelection::Explicit(vec!["slot01".into()]),
        &[("CV", cv_params(10))],
    );
    req.run_name = Some("dup".to_string());
    manager.start_job(req.clone()).await.unwrap();
    wait_terminal(&manager, "dup").await;

    // the registry keeps terminal jobs for the process lifetime
    let err = manager.start_job(req).await.unwrap_err();
    assert!(matches!(err, BoxError::RunIdConflict(_)));
}

#[tokio::test]
async fn test_cancel_mid_measurement_keeps_earlier_files() {
    let tmp = TempDir::new().unwrap();
    let manager = setup(&tmp, 1).await;

    let mut req = request(
        SlotSelection::Explicit(vec!["slot01".into()]),
        &[
            ("CV", cv_params(10)),
            ("CA", json!({"duration": 5, "mock_duration_ms": 60_000})),
        ],
    );
    req.run_name = Some("run_cancel".to_string());
    manager.start_job(req).await.unwrap();

    // wait for the long second mode to start
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let snapshot = manager.snapshot("run_cancel").await.unwrap();
            if snapshot.current_mode.as_deref() == Some("CA") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("second mode never started");

    let response = manager.cancel_job("run_cancel").await.unwrap();
    assert_eq!(response.status, RunState::Cancelled);

    let done = wait_terminal(&manager, "run_cancel").await;
    assert_eq!(done.status, RunState::Cancelled);
    let slot = &done.slots[0];
    assert_eq!(slot.status, RunState::Cancelled);
    assert_eq!(slot.message.as_deref(), Some("cancelled"));
    // files written before cancellation remain listed
    assert_eq!(slot.files.len(), 1);
    assert!(slot.files[0].contains("/CV/"));

    assert!(manager.reserved_slots().await.is_empty());
}

#[tokio::test]
async fn test_admission_validation_rejects_before_any_state() {
    let tmp = TempDir::new().unwrap();
    let manager = setup(&tmp, 1).await;

    let err = manager
        .start_job(request(SlotSelection::Keyword("all".into()), &[]))
        .await
        .unwrap_err();
    assert!(matches!(err, BoxError::EmptyModes));

    let mut req = request(SlotSelection::Keyword("all".into()), &[("CV", cv_params(10))]);
    req.params_by_mode.clear();
    let err = manager.start_job(req).await.unwrap_err();
    assert!(matches!(err, BoxError::MissingModeParams(_)));

    let err = manager
        .start_job(request(
            SlotSelection::Explicit(vec!["slot99".into()]),
            &[("CV", cv_params(10))],
        ))
        .await
        .unwrap_err();
    assert!(matches!(err, BoxError::InvalidDevices));

    assert!(manager.reserved_slots().await.is_empty());
}

#[tokio::test]
async fn test_failed_admission_rolls_back_reservations() {
    let tmp = TempDir::new().unwrap();
    let manager = setup(&tmp, 1).await;

    // experiment name sanitizes to nothing: admission fails after the slots
    // were reserved, so everything must roll back
    let mut req = request(
        SlotSelection::Explicit(vec!["slot01".into()]),
        &[("CV", cv_params(10))],
    );
    req.experiment_name = "###".to_string();
    req.run_name = Some("run_rollback".to_string());
    let err = manager.start_job(req).await.unwrap_err();
    assert!(matches!(err, BoxError::InvalidSegment { .. }));

    assert!(manager.reserved_slots().await.is_empty());
    assert!(manager.snapshot("run_rollback").await.is_err());

    // the slot is immediately usable again
    let mut retry = request(
        SlotSelection::Explicit(vec!["slot01".into()]),
        &[("CV", cv_params(10))],
    );
    retry.run_name = Some("run_retry".to_string());
    manager.start_job(retry).await.unwrap();
    let done = wait_terminal(&manager, "run_retry").await;
    assert_eq!(done.status, RunState::Done);
}

#[tokio::test]
async fn test_running_job_reports_bounded_progress() {
    let tmp = TempDir::new().unwrap();
    let manager = setup(&tmp, 1).await;

    let mut req = request(
        SlotSelection::Explicit(vec!["slot01".into()]),
        &[("CV", cv_params(60_000))],
    );
    req.run_name = Some("run_progress".to_string());
    manager.start_job(req).await.unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    let snapshot = manager.snapshot("run_progress").await.unwrap();
    assert_eq!(snapshot.status, RunState::Running);
    assert!(snapshot.progress_pct <= 99);
    assert!(snapshot.remaining_s.is_some());

    manager.cancel_job("run_progress").await.unwrap();
    wait_terminal(&manager, "run_progress").await;
}

#[tokio::test]
async fn test_overview_listing_filters_by_state_and_group() {
    let tmp = TempDir::new().unwrap();
    let manager = setup(&tmp, 2).await;

    let mut done_req = request(
        SlotSelection::Explicit(vec!["slot01".into()]),
        &[("CV", cv_params(10))],
    );
    done_req.run_name = Some("run_done".to_string());
    done_req.folder_name = Some("Plate A".to_string());
    manager.start_job(done_req).await.unwrap();
    wait_terminal(&manager, "run_done").await;

    let mut running_req = request(
        SlotSelection::Explicit(vec!["slot02".into()]),
        &[("CV", cv_params(60_000))],
    );
    running_req.run_name = Some("run_live".to_string());
    manager.start_job(running_req).await.unwrap();

    let completed = manager
        .list_jobs(Some(echem_box::jobs::StateFilter::Completed), None)
        .await;
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].run_id, "run_done");

    let incomplete = manager
        .list_jobs(Some(echem_box::jobs::StateFilter::Incomplete), None)
        .await;
    assert_eq!(incomplete.len(), 1);
    assert_eq!(incomplete[0].run_id, "run_live");

    // group filter matches the raw tag case-insensitively and the sanitized
    // storage folder
    for filter in ["plate a", "PLATE A", "Plate_A"] {
        let grouped = manager.list_jobs(None, Some(filter)).await;
        assert_eq!(grouped.len(), 1, "filter {filter:?}");
        assert_eq!(grouped[0].run_id, "run_done");
    }

    manager.cancel_job("run_live").await.unwrap();
    wait_terminal(&manager, "run_live").await;
}
