//! End-to-end supervisor flows driven through real `sh` subprocesses.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::config::Settings;
use crate::core::batch::BatchService;
use crate::core::error::ControlError;
use crate::core::job::AnalysisParams;
use crate::core::status::TaskState;

const UPDATE_OK: &str = r#"#!/bin/sh
echo "[KRX_TOTAL] 10"
echo "[KRX_SAVED] 10"
echo "saved batch (5/10)"
echo "[PROGRESS] 90"
echo "plain log line"
exit 0
"#;

const ANALYSIS_OK: &str = r#"#!/bin/sh
echo "[PROGRESS] 50"
sleep 0.3
echo "{\"patterns\": 2, \"top\": [\"005930\", \"000660\"]}"
exit 0
"#;

const FAILING: &str = r#"#!/bin/sh
echo "boom" >&2
exit 3
"#;

const SLOW: &str = r#"#!/bin/sh
echo "[PROGRESS] 10"
exec sleep 30
"#;

fn write_script(dir: &Path, name: &str, body: &str) -> std::path::PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, body).expect("script should be written");
    path
}

fn service_with(update_body: &str, analysis_body: &str) -> (tempfile::TempDir, Arc<BatchService>) {
    let dir = tempfile::tempdir().expect("temp dir");
    let settings = Settings {
        python_exe: "sh".to_string(),
        update_script: write_script(dir.path(), "update.sh", update_body),
        analysis_script: write_script(dir.path(), "analysis.sh", analysis_body),
        working_dir: dir.path().to_path_buf(),
        api_host: "127.0.0.1".to_string(),
        api_port: 17990,
        cache_ttl_secs: 3600,
    };
    (dir, BatchService::new(settings))
}

async fn wait_until_terminal(service: &Arc<BatchService>, task_id: &str) -> TaskState {
    for _ in 0..200 {
        if let Some(snap) = service.snapshot(task_id).await
            && snap.state.is_terminal()
        {
            return snap.state;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("task {task_id} did not reach a terminal state in time");
}

async fn wait_until_unlocked(service: &Arc<BatchService>) {
    for _ in 0..200 {
        if !service.is_locked() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("lock was not released in time");
}

async fn wait_for_progress(service: &Arc<BatchService>, task_id: &str, min: f64) {
    for _ in 0..200 {
        if let Some(snap) = service.snapshot(task_id).await
            && snap.progress >= min
        {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("task {task_id} never reached progress {min}");
}

fn analysis_params() -> AnalysisParams {
    AnalysisParams {
        analysis_type: "golden_cross".to_string(),
        ma_periods: vec![20, 60],
        exclude_negatives: false,
        data_period_years: 3,
        top_n_count: 20,
    }
}

#[tokio::test]
async fn update_run_completes_and_releases_the_lock() {
    let (_dir, service) = service_with(UPDATE_OK, ANALYSIS_OK);

    let task_id = service.start_update("alice", 2, false).await.unwrap();
    assert!(service.is_locked());
    assert_eq!(service.current_runner().as_deref(), Some("alice"));

    assert_eq!(
        wait_until_terminal(&service, &task_id).await,
        TaskState::Completed
    );
    wait_until_unlocked(&service).await;

    let snap = service.snapshot(&task_id).await.unwrap();
    assert_eq!(snap.progress, 100.0);
    assert_eq!(snap.runner, "alice");
    assert!(snap.end_time.is_some());

    let lines = service.logs_since(&task_id, 0).await.unwrap();
    let text: Vec<&str> = lines.iter().map(|l| l.line.as_str()).collect();
    assert!(text.contains(&"plain log line"));
    assert!(text.contains(&"saved batch (5/10)"));
    let seqs: Vec<u64> = lines.iter().map(|l| l.seq).collect();
    let mut sorted = seqs.clone();
    sorted.sort_unstable();
    assert_eq!(seqs, sorted, "log sequence must be strictly increasing");
}

#[tokio::test]
async fn analysis_run_parses_the_result_and_serves_the_repeat_from_cache() {
    let (_dir, service) = service_with(UPDATE_OK, ANALYSIS_OK);

    let first = service
        .start_analysis("alice", analysis_params(), false)
        .await
        .unwrap();
    assert_eq!(
        wait_until_terminal(&service, &first).await,
        TaskState::Completed
    );
    wait_until_unlocked(&service).await;

    let result = service.snapshot(&first).await.unwrap().result.unwrap();
    assert_eq!(result["patterns"], 2);

    // Identical parameters short-circuit: the task is already COMPLETED by
    // the time start returns, with no process launched.
    let second = service
        .start_analysis("bob", analysis_params(), false)
        .await
        .unwrap();
    let snap = service.snapshot(&second).await.unwrap();
    assert_eq!(snap.state, TaskState::Completed);
    assert_eq!(snap.result.unwrap(), result);
    assert!(!service.is_locked());

    // A different parameter set misses the cache and runs the script.
    let mut other = analysis_params();
    other.top_n_count = 5;
    let third = service.start_analysis("bob", other, false).await.unwrap();
    assert_eq!(
        service.snapshot(&third).await.unwrap().state,
        TaskState::InProgress
    );
    wait_until_terminal(&service, &third).await;
    wait_until_unlocked(&service).await;
}

#[tokio::test]
async fn busy_rejection_names_the_runner_until_cancellation_frees_the_lock() {
    let (_dir, service) = service_with(SLOW, ANALYSIS_OK);

    let task_id = service.start_update("alice", 2, false).await.unwrap();

    match service.start_update("bob", 2, false).await {
        Err(ControlError::Busy { runner, .. }) => assert_eq!(runner, "alice"),
        other => panic!("expected Busy, got {other:?}"),
    }

    service.cancel(&task_id, "alice").await.unwrap();
    assert_eq!(
        wait_until_terminal(&service, &task_id).await,
        TaskState::Cancelled
    );
    wait_until_unlocked(&service).await;

    let snap = service.snapshot(&task_id).await.unwrap();
    assert_eq!(snap.error.as_deref(), Some("cancelled by user request"));

    let retry = service.start_update("bob", 2, false).await.unwrap();
    assert_eq!(service.current_runner().as_deref(), Some("bob"));
    service.cancel(&retry, "bob").await.unwrap();
    wait_until_terminal(&service, &retry).await;
    wait_until_unlocked(&service).await;
}

#[tokio::test]
async fn cancel_by_a_non_owner_is_forbidden_and_changes_nothing() {
    let (_dir, service) = service_with(SLOW, ANALYSIS_OK);

    let task_id = service.start_update("alice", 2, false).await.unwrap();
    wait_for_progress(&service, &task_id, 10.0).await;

    assert!(matches!(
        service.cancel(&task_id, "mallory").await,
        Err(ControlError::Forbidden)
    ));
    assert_eq!(
        service.snapshot(&task_id).await.unwrap().state,
        TaskState::InProgress
    );

    assert!(matches!(
        service.cancel("some-other-id", "alice").await,
        Err(ControlError::NotFound(_))
    ));

    service.cancel(&task_id, "alice").await.unwrap();
    wait_until_terminal(&service, &task_id).await;
    wait_until_unlocked(&service).await;
}

#[tokio::test]
async fn same_identity_reentry_requires_the_force_flag() {
    let (_dir, service) = service_with(SLOW, ANALYSIS_OK);

    let task_id = service.start_update("alice", 2, false).await.unwrap();

    assert!(matches!(
        service.start_update("alice", 2, false).await,
        Err(ControlError::Busy { .. })
    ));

    let reentered = service.start_update("alice", 2, true).await.unwrap();
    assert_eq!(reentered, task_id, "force re-entry joins the in-flight task");

    service.cancel(&task_id, "alice").await.unwrap();
    wait_until_terminal(&service, &task_id).await;
    wait_until_unlocked(&service).await;
}

#[tokio::test]
async fn cancellation_outranks_the_exit_code() {
    let (_dir, service) = service_with(SLOW, ANALYSIS_OK);

    let task_id = service.start_update("alice", 2, false).await.unwrap();
    wait_for_progress(&service, &task_id, 10.0).await;

    service.cancel(&task_id, "alice").await.unwrap();
    let snap = service.snapshot(&task_id).await.unwrap();
    assert!(matches!(
        snap.state,
        TaskState::CancelRequested | TaskState::Cancelled
    ));

    // The killed child exits on a signal, but the recorded state is
    // CANCELLED, not FAILED.
    assert_eq!(
        wait_until_terminal(&service, &task_id).await,
        TaskState::Cancelled
    );
    wait_until_unlocked(&service).await;
}

#[tokio::test]
async fn failing_run_records_the_exit_code_and_merged_stderr() {
    let (_dir, service) = service_with(FAILING, ANALYSIS_OK);

    let task_id = service.start_update("alice", 2, false).await.unwrap();
    assert_eq!(
        wait_until_terminal(&service, &task_id).await,
        TaskState::Failed
    );
    wait_until_unlocked(&service).await;

    let snap = service.snapshot(&task_id).await.unwrap();
    assert!(snap.error.as_deref().unwrap().contains("code 3"));

    let lines = service.logs_since(&task_id, 0).await.unwrap();
    assert!(
        lines.iter().any(|l| l.line == "boom"),
        "stderr should be merged into the task log"
    );
}

#[tokio::test]
async fn subscriber_connecting_mid_run_receives_the_live_snapshot_first() {
    let (_dir, service) = service_with(SLOW, ANALYSIS_OK);

    let task_id = service.start_update("alice", 2, false).await.unwrap();
    wait_for_progress(&service, &task_id, 10.0).await;

    let mut carol = service.subscribe("carol").await;
    let frame = carol.recv().await.expect("initial frame");
    assert_eq!(frame.event_name(), "status");
    let payload: serde_json::Value = serde_json::from_str(&frame.data()).unwrap();
    assert_eq!(payload["status"], "IN_PROGRESS");
    assert_eq!(payload["progress"], 10.0);
    assert_eq!(payload["owner"], false);
    assert_eq!(payload["active"], true);

    let mut alice = service.subscribe("alice").await;
    let frame = alice.recv().await.expect("initial frame");
    let payload: serde_json::Value = serde_json::from_str(&frame.data()).unwrap();
    assert_eq!(payload["owner"], true);
    assert_eq!(payload["runner"], "alice");

    service.cancel(&task_id, "alice").await.unwrap();
    wait_until_terminal(&service, &task_id).await;
    wait_until_unlocked(&service).await;
}

#[tokio::test]
async fn idle_subscriber_receives_an_explicit_idle_event() {
    let (_dir, service) = service_with(UPDATE_OK, ANALYSIS_OK);

    let mut rx = service.subscribe("carol").await;
    let frame = rx.recv().await.expect("initial frame");
    let payload: serde_json::Value = serde_json::from_str(&frame.data()).unwrap();
    assert_eq!(payload["status"], "IDLE");
    assert_eq!(payload["active"], false);
}
