use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::Settings;
use crate::core::cache::AnalysisCache;
use crate::core::error::ControlError;
use crate::core::hub::{BroadcastHub, SseFrame};
use crate::core::job::{AnalysisParams, JobKind};
use crate::core::lock::SingleFlight;
use crate::core::runner;
use crate::core::status::{LogLine, StatusBoard, TaskStatus};

/// The one entry point callers touch: composes the single-flight lock, the
/// status board, the result cache, and the broadcast hub into the
/// start/cancel/status/subscribe surface.
pub struct BatchService {
    pub(crate) settings: Settings,
    pub(crate) lock: SingleFlight,
    pub(crate) board: StatusBoard,
    pub(crate) cache: AnalysisCache,
    pub(crate) hub: BroadcastHub,
    pub(crate) cancellations: Mutex<HashMap<String, CancellationToken>>,
}

impl BatchService {
    pub fn new(settings: Settings) -> Arc<Self> {
        let ttl = Duration::from_secs(settings.cache_ttl_secs);
        Arc::new(Self {
            settings,
            lock: SingleFlight::new(),
            board: StatusBoard::new(),
            cache: AnalysisCache::new(ttl),
            hub: BroadcastHub::new(),
            cancellations: Mutex::new(HashMap::new()),
        })
    }

    pub async fn start_update(
        self: &Arc<Self>,
        caller: &str,
        workers: u32,
        force: bool,
    ) -> Result<String, ControlError> {
        self.start(caller, JobKind::ListingUpdate { workers, force }, force)
            .await
    }

    pub async fn start_analysis(
        self: &Arc<Self>,
        caller: &str,
        params: AnalysisParams,
        force: bool,
    ) -> Result<String, ControlError> {
        self.start(caller, JobKind::PatternAnalysis(params), force)
            .await
    }

    async fn start(
        self: &Arc<Self>,
        caller: &str,
        kind: JobKind,
        force: bool,
    ) -> Result<String, ControlError> {
        let task_id = Uuid::new_v4().to_string();
        loop {
            if self.lock.try_acquire(&task_id, caller) {
                break;
            }
            // The holder can vanish between the failed acquire and this
            // read; in that window the lock just became free, so retry.
            let Some(holder) = self.lock.holder() else {
                continue;
            };
            if holder.runner == caller && force {
                info!(
                    "[{}] re-entry by runner {}, joining in-flight task",
                    holder.task_id, caller
                );
                return Ok(holder.task_id);
            }
            let progress = match self.board.snapshot(&holder.task_id).await {
                Some(snap) => snap.progress,
                None => 0.0,
            };
            return Err(ControlError::Busy {
                runner: holder.runner,
                progress,
            });
        }

        info!(
            "[{}] lock acquired (runner: {}, kind: {})",
            task_id,
            caller,
            kind.label()
        );
        self.board.reset(&task_id).await;
        self.board.start(&task_id, caller).await;
        self.board
            .append_log(
                &task_id,
                &format!("[SYSTEM] {} started by {}", kind.label(), caller),
            )
            .await;
        self.broadcast_task(&task_id).await;

        if let Some(key) = kind.cache_key()
            && let Some(cached) = self.cache.get(&key)
        {
            info!("[{}] cache hit, returning stored analysis result", task_id);
            self.board
                .append_log(&task_id, "[SYSTEM] cached analysis result returned")
                .await;
            self.board.complete(&task_id, Some(cached)).await;
            self.finish_task(&task_id).await;
            return Ok(task_id);
        }

        let token = CancellationToken::new();
        self.cancellations
            .lock()
            .await
            .insert(task_id.clone(), token.clone());
        tokio::spawn(runner::run(
            Arc::clone(self),
            task_id.clone(),
            kind,
            token,
        ));
        Ok(task_id)
    }

    /// Ownership-only cancellation of the active task. Flips the status to
    /// CANCEL_REQUESTED and kills the child; the supervisor finalizes
    /// CANCELLED once the process is confirmed dead.
    pub async fn cancel(&self, task_id: &str, caller: &str) -> Result<(), ControlError> {
        let holder = self
            .lock
            .holder()
            .ok_or_else(|| ControlError::NotFound(task_id.to_string()))?;
        if holder.task_id != task_id {
            return Err(ControlError::NotFound(task_id.to_string()));
        }
        if holder.runner != caller {
            warn!(
                "[{}] cancel rejected for {} (runner: {})",
                task_id, caller, holder.runner
            );
            return Err(ControlError::Forbidden);
        }

        self.board.cancel_requested(task_id).await;
        self.board
            .append_log(
                task_id,
                &format!("[SYSTEM] cancellation requested by {caller}"),
            )
            .await;
        if let Some(token) = self.cancellations.lock().await.get(task_id) {
            token.cancel();
        }
        self.broadcast_task(task_id).await;
        Ok(())
    }

    /// Registers an SSE subscriber and immediately hands it the live
    /// snapshot of the active task, or an explicit IDLE event, so a
    /// reconnecting client can rebuild its view without racing the next
    /// broadcast.
    pub async fn subscribe(&self, user: &str) -> mpsc::Receiver<SseFrame> {
        let rx = self.hub.register(user).await;
        let (base, runner, active) = match self.lock.holder() {
            Some(holder) => match self.board.snapshot(&holder.task_id).await {
                Some(snap) => (
                    status_payload(&holder.task_id, &snap),
                    Some(holder.runner),
                    true,
                ),
                None => (idle_payload(), Some(holder.runner), true),
            },
            None => (idle_payload(), None, false),
        };
        self.hub.send_to(user, base, runner.as_deref(), active).await;
        rx
    }

    pub async fn snapshot(&self, task_id: &str) -> Option<TaskStatus> {
        self.board.snapshot(task_id).await
    }

    /// Snapshot of the active task, if any.
    pub async fn current_snapshot(&self) -> Option<(String, TaskStatus)> {
        let holder = self.lock.holder()?;
        let snap = self.board.snapshot(&holder.task_id).await?;
        Some((holder.task_id, snap))
    }

    /// Stored log lines with seq > after_seq, or None for an unknown task.
    pub async fn logs_since(&self, task_id: &str, after_seq: u64) -> Option<Vec<LogLine>> {
        self.board.snapshot(task_id).await?;
        Some(self.board.logs_since(task_id, after_seq).await)
    }

    pub fn is_locked(&self) -> bool {
        self.lock.is_held()
    }

    pub fn current_runner(&self) -> Option<String> {
        self.lock.current_runner()
    }

    pub fn current_task_id(&self) -> Option<String> {
        self.lock.current_task_id()
    }

    pub async fn active_info(&self) -> serde_json::Value {
        let Some(holder) = self.lock.holder() else {
            return serde_json::json!({ "active": false });
        };
        let progress = match self.board.snapshot(&holder.task_id).await {
            Some(snap) => snap.progress,
            None => 0.0,
        };
        serde_json::json!({
            "active": true,
            "task_id": holder.task_id,
            "runner": holder.runner,
            "progress": progress,
        })
    }

    /// Pushes pending log lines, then the current status, to every
    /// subscriber. Logs always go out first so no client sees a status
    /// claiming coverage of lines it has not received.
    pub(crate) async fn broadcast_task(&self, task_id: &str) {
        let Some(snap) = self.board.snapshot(task_id).await else {
            return;
        };
        let pending = self.board.logs_since(task_id, snap.last_sent_log_seq).await;
        if let Some(last) = pending.last() {
            let last_seq = last.seq;
            self.hub.broadcast_logs(&pending).await;
            self.board.mark_logs_sent(task_id, last_seq).await;
        }
        let runner = self.lock.current_runner();
        self.hub
            .broadcast_status(
                &status_payload(task_id, &snap),
                runner.as_deref(),
                self.lock.is_held(),
            )
            .await;
    }

    /// The single cleanup path every task funnels through, regardless of
    /// how it ended: drop the cancellation token, broadcast the terminal
    /// snapshot, release the lock.
    pub(crate) async fn finish_task(&self, task_id: &str) {
        self.cancellations.lock().await.remove(task_id);
        self.board
            .append_log(task_id, "[SYSTEM] task finished, lock released")
            .await;
        self.broadcast_task(task_id).await;
        self.lock.release();
        info!("[{}] lock released", task_id);
    }
}

pub(crate) fn status_payload(task_id: &str, snap: &TaskStatus) -> serde_json::Value {
    let mut payload = serde_json::to_value(snap).unwrap_or_default();
    if let Some(map) = payload.as_object_mut() {
        map.insert("task_id".into(), task_id.into());
    }
    payload
}

pub(crate) fn idle_payload() -> serde_json::Value {
    serde_json::json!({ "status": "IDLE", "progress": 0.0 })
}
