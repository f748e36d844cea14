use std::sync::Mutex;

/// Identity of the caller currently holding the single-flight lock, plus the
/// task it is running.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockHolder {
    pub runner: String,
    pub task_id: String,
}

/// Process-wide mutual exclusion over batch execution: at most one task runs
/// at a time, system-wide. Acquisition is compare-and-set under one mutex so
/// two concurrent starts can never both observe "unheld".
#[derive(Debug, Default)]
pub struct SingleFlight {
    inner: Mutex<Option<LockHolder>>,
}

impl SingleFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true and records the holder only if the lock is currently
    /// free. Never blocks, never queues.
    pub fn try_acquire(&self, task_id: &str, runner: &str) -> bool {
        let mut inner = self.inner.lock().expect("lock state poisoned");
        if inner.is_some() {
            return false;
        }
        *inner = Some(LockHolder {
            runner: runner.to_string(),
            task_id: task_id.to_string(),
        });
        true
    }

    /// Unconditionally clears the holder. Called exactly once per task, from
    /// the supervisor's cleanup path.
    pub fn release(&self) {
        *self.inner.lock().expect("lock state poisoned") = None;
    }

    pub fn is_held(&self) -> bool {
        self.inner.lock().expect("lock state poisoned").is_some()
    }

    pub fn holder(&self) -> Option<LockHolder> {
        self.inner.lock().expect("lock state poisoned").clone()
    }

    pub fn current_runner(&self) -> Option<String> {
        self.holder().map(|h| h.runner)
    }

    pub fn current_task_id(&self) -> Option<String> {
        self.holder().map(|h| h.task_id)
    }
}
