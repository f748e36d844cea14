use thiserror::Error;

/// Control-plane errors the API surfaces to callers. Process-level failures
/// (timeouts, exit codes, unparseable result lines) never take this path;
/// they resolve into the task's terminal state and are broadcast instead.
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("another batch is already running (runner: {runner})")]
    Busy { runner: String, progress: f64 },

    #[error("unknown or inactive task: {0}")]
    NotFound(String),

    #[error("only the current runner may cancel this task")]
    Forbidden,

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}
