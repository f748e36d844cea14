use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use tokio::sync::Mutex;

/// Upper bound on retained log lines per task. Oldest lines are evicted
/// beyond this; sequence numbers keep counting so clients can still fetch
/// "everything after N" without duplicates.
pub const MAX_LOG_LINES: usize = 5000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    InProgress,
    CancelRequested,
    Completed,
    Cancelled,
    Failed,
}

impl TaskState {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskState::InProgress => "IN_PROGRESS",
            TaskState::CancelRequested => "CANCEL_REQUESTED",
            TaskState::Completed => "COMPLETED",
            TaskState::Cancelled => "CANCELLED",
            TaskState::Failed => "FAILED",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Cancelled | TaskState::Failed
        )
    }
}

/// One line of captured batch output. Immutable once appended.
#[derive(Debug, Clone, Serialize)]
pub struct LogLine {
    pub seq: u64,
    pub line: String,
    pub ts: DateTime<Utc>,
}

/// Snapshot of a task's mutable record. `end_time` is set iff the state is
/// terminal.
#[derive(Debug, Clone, Serialize)]
pub struct TaskStatus {
    #[serde(rename = "status")]
    pub state: TaskState,
    pub runner: String,
    pub progress: f64,
    pub current_item: u64,
    pub start_time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    pub last_log_seq: u64,
    #[serde(skip)]
    pub last_sent_log_seq: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Default)]
struct TaskLog {
    next_seq: u64,
    lines: VecDeque<LogLine>,
}

#[derive(Debug, Default)]
struct BoardInner {
    statuses: HashMap<String, TaskStatus>,
    logs: HashMap<String, TaskLog>,
}

/// In-memory register of task status plus the per-task sequenced log store.
/// One mutex guards both maps so a status snapshot and the log seq it refers
/// to can never be observed mid-update.
#[derive(Debug, Default)]
pub struct StatusBoard {
    inner: Mutex<BoardInner>,
}

impl StatusBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn start(&self, task_id: &str, runner: &str) {
        let mut inner = self.inner.lock().await;
        inner.statuses.insert(
            task_id.to_string(),
            TaskStatus {
                state: TaskState::InProgress,
                runner: runner.to_string(),
                progress: 0.0,
                current_item: 0,
                start_time: Utc::now(),
                end_time: None,
                last_log_seq: 0,
                last_sent_log_seq: 0,
                result: None,
                error: None,
            },
        );
        inner.logs.insert(task_id.to_string(), TaskLog::default());
    }

    /// Progress is monotonically non-decreasing for the lifetime of a task:
    /// a smaller incoming value is ignored, not recorded.
    pub async fn update_progress(&self, task_id: &str, current_item: u64, progress: f64) {
        let mut inner = self.inner.lock().await;
        if let Some(status) = inner.statuses.get_mut(task_id)
            && status.state == TaskState::InProgress
        {
            status.progress = status.progress.max(progress.clamp(0.0, 100.0));
            status.current_item = status.current_item.max(current_item);
        }
    }

    /// Appends a line, assigning the next sequence number for the task.
    /// Returns None when the task has no live record (e.g. after reset).
    pub async fn append_log(&self, task_id: &str, line: &str) -> Option<u64> {
        let mut inner = self.inner.lock().await;
        let log = inner.logs.get_mut(task_id)?;
        log.next_seq += 1;
        let seq = log.next_seq;
        log.lines.push_back(LogLine {
            seq,
            line: line.to_string(),
            ts: Utc::now(),
        });
        if log.lines.len() > MAX_LOG_LINES {
            log.lines.pop_front();
        }
        if let Some(status) = inner.statuses.get_mut(task_id) {
            status.last_log_seq = seq;
        }
        Some(seq)
    }

    pub async fn complete(&self, task_id: &str, result: Option<serde_json::Value>) {
        let mut inner = self.inner.lock().await;
        if let Some(status) = inner.statuses.get_mut(task_id)
            && !status.state.is_terminal()
        {
            status.state = TaskState::Completed;
            status.progress = 100.0;
            status.end_time = Some(Utc::now());
            if result.is_some() {
                status.result = result;
            }
        }
    }

    pub async fn cancel_requested(&self, task_id: &str) {
        let mut inner = self.inner.lock().await;
        if let Some(status) = inner.statuses.get_mut(task_id)
            && status.state == TaskState::InProgress
        {
            status.state = TaskState::CancelRequested;
        }
    }

    pub async fn cancel(&self, task_id: &str) {
        let mut inner = self.inner.lock().await;
        if let Some(status) = inner.statuses.get_mut(task_id)
            && !status.state.is_terminal()
        {
            status.state = TaskState::Cancelled;
            status.end_time = Some(Utc::now());
            status.error = Some("cancelled by user request".to_string());
        }
    }

    pub async fn fail(&self, task_id: &str, error: &str) {
        let mut inner = self.inner.lock().await;
        if let Some(status) = inner.statuses.get_mut(task_id)
            && !status.state.is_terminal()
        {
            status.state = TaskState::Failed;
            status.end_time = Some(Utc::now());
            status.error = Some(error.to_string());
        }
    }

    /// Advances the broadcast cursor after a log batch has been pushed out.
    pub async fn mark_logs_sent(&self, task_id: &str, seq: u64) {
        let mut inner = self.inner.lock().await;
        if let Some(status) = inner.statuses.get_mut(task_id) {
            status.last_sent_log_seq = status.last_sent_log_seq.max(seq);
        }
    }

    /// Clears status, log lines, and the sequence counter for a task id.
    /// Used before a fresh run reuses the id.
    pub async fn reset(&self, task_id: &str) {
        let mut inner = self.inner.lock().await;
        inner.statuses.remove(task_id);
        inner.logs.remove(task_id);
    }

    pub async fn snapshot(&self, task_id: &str) -> Option<TaskStatus> {
        self.inner.lock().await.statuses.get(task_id).cloned()
    }

    pub async fn state(&self, task_id: &str) -> Option<TaskState> {
        self.inner
            .lock()
            .await
            .statuses
            .get(task_id)
            .map(|s| s.state)
    }

    /// Every retained line with seq > after_seq, in order. A cursor older
    /// than the eviction horizon simply yields all retained lines.
    pub async fn logs_since(&self, task_id: &str, after_seq: u64) -> Vec<LogLine> {
        let inner = self.inner.lock().await;
        match inner.logs.get(task_id) {
            Some(log) => log
                .lines
                .iter()
                .filter(|l| l.seq > after_seq)
                .cloned()
                .collect(),
            None => Vec::new(),
        }
    }
}
