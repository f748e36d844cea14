use anyhow::{Context, Result};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::core::batch::BatchService;
use crate::core::classify::{LineEvent, ProgressGauge, classify};
use crate::core::job::JobKind;
use crate::core::status::TaskState;

/// Hard ceiling on a batch run; long jobs routinely take tens of minutes.
pub(crate) const PROCESS_TIMEOUT: Duration = Duration::from_secs(3600);
/// Log broadcasts are coalesced onto this budget so a chatty script cannot
/// flood subscribers.
pub(crate) const FLUSH_INTERVAL: Duration = Duration::from_millis(500);

/// Supervises one external batch process from spawn to terminal state.
/// Whatever happens inside, cleanup runs exactly once via `finish_task`.
pub(crate) async fn run(
    service: Arc<BatchService>,
    task_id: String,
    kind: JobKind,
    cancel: CancellationToken,
) {
    if let Err(e) = supervise(&service, &task_id, &kind, &cancel).await {
        error!("[{}] supervisor error: {:#}", task_id, e);
        service.board.fail(&task_id, &e.to_string()).await;
    }
    service.finish_task(&task_id).await;
}

async fn supervise(
    service: &Arc<BatchService>,
    task_id: &str,
    kind: &JobKind,
    cancel: &CancellationToken,
) -> Result<()> {
    let script = match kind {
        JobKind::ListingUpdate { .. } => &service.settings.update_script,
        JobKind::PatternAnalysis(_) => &service.settings.analysis_script,
    };

    let mut cmd = Command::new(&service.settings.python_exe);
    cmd.arg("-u")
        .arg(script)
        .args(kind.script_args())
        .current_dir(&service.settings.working_dir)
        .env("PYTHONIOENCODING", "utf-8")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd
        .spawn()
        .with_context(|| format!("spawning {} {:?}", service.settings.python_exe, script))?;
    info!(
        "[{}] launched {} {:?} {:?}",
        task_id,
        service.settings.python_exe,
        script,
        kind.script_args()
    );
    service
        .board
        .append_log(
            task_id,
            &format!("[SYSTEM] script launched: {}", script.display()),
        )
        .await;

    let mut lines = merge_output(&mut child);
    let mut gauge = ProgressGauge::new();
    let mut result: Option<serde_json::Value> = None;
    let mut last_flush = Instant::now();
    let mut kill_sent = false;

    loop {
        tokio::select! {
            _ = cancel.cancelled(), if !kill_sent => {
                warn!("[{}] cancellation observed, killing child process", task_id);
                kill_sent = true;
                child.start_kill().ok();
            }
            maybe_line = lines.recv() => {
                let Some(line) = maybe_line else { break };
                let event = classify(&line);
                let mut broadcast_now = false;
                match &event {
                    LineEvent::ItemProgress { .. } | LineEvent::ExplicitProgress(_) => {
                        gauge.observe(&event);
                        service
                            .board
                            .update_progress(task_id, gauge.current_item(), gauge.percent())
                            .await;
                        broadcast_now = true;
                    }
                    LineEvent::ListingTotal(_)
                    | LineEvent::ListingSaved(_)
                    | LineEvent::ItemCount { .. } => {
                        // Phase counters only drive the gauge for update
                        // runs; either way the raw line stays visible.
                        if matches!(kind, JobKind::ListingUpdate { .. }) {
                            gauge.observe(&event);
                            service
                                .board
                                .update_progress(task_id, gauge.current_item(), gauge.percent())
                                .await;
                        }
                        service.board.append_log(task_id, &line).await;
                    }
                    LineEvent::FinalResult(value) => {
                        result = Some(value.clone());
                        service
                            .board
                            .append_log(task_id, "[SYSTEM] final result payload parsed")
                            .await;
                    }
                    LineEvent::Log => {
                        service.board.append_log(task_id, &line).await;
                    }
                }
                if broadcast_now || last_flush.elapsed() >= FLUSH_INTERVAL {
                    service.broadcast_task(task_id).await;
                    last_flush = Instant::now();
                }
            }
        }
    }

    let status = match tokio::time::timeout(PROCESS_TIMEOUT, child.wait()).await {
        Ok(status) => status.context("waiting for child process")?,
        Err(_) => {
            warn!(
                "[{}] process exceeded {:?}, killing",
                task_id, PROCESS_TIMEOUT
            );
            child.start_kill().ok();
            let _ = child.wait().await;
            service.board.fail(task_id, "process timed out").await;
            return Ok(());
        }
    };
    info!("[{}] process exited: {}", task_id, status);

    // Cancellation intent outranks whatever the exit code says.
    let cancel_requested = cancel.is_cancelled()
        || service.board.state(task_id).await == Some(TaskState::CancelRequested);
    if cancel_requested {
        service.board.cancel(task_id).await;
        service
            .board
            .append_log(task_id, "[SYSTEM] task cancelled")
            .await;
        return Ok(());
    }

    if !status.success() {
        let detail = match status.code() {
            Some(code) => format!("code {code}"),
            None => "a signal".to_string(),
        };
        service
            .board
            .fail(task_id, &format!("process exited with {detail}"))
            .await;
        return Ok(());
    }

    if kind.is_analysis()
        && let (Some(key), Some(value)) = (kind.cache_key(), result.as_ref())
    {
        service.cache.put(&key, value.clone());
        info!("[{}] analysis result cached", task_id);
    }
    service.board.complete(task_id, result).await;
    Ok(())
}

/// Merges the child's stdout and stderr into one line-oriented stream, the
/// moral equivalent of redirecting stderr into stdout. The receiver closes
/// once both pipes hit EOF.
fn merge_output(child: &mut Child) -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel::<String>(256);
    if let Some(stdout) = child.stdout.take() {
        let tx = tx.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if tx.send(line).await.is_err() {
                    break;
                }
            }
        });
    }
    if let Some(stderr) = child.stderr.take() {
        let tx = tx.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if tx.send(line).await.is_err() {
                    break;
                }
            }
        });
    }
    rx
}
