//! Error taxonomy for the task layer.
//!
//! Every task entry point returns [`TaskResult`]. Skipped training runs and
//! empty trash passes are ordinary outcomes, not errors.

use std::path::PathBuf;

use thiserror::Error;

use crate::models::TaskStatus;
use crate::sanity::SanityCheckMessages;

pub type TaskResult<T> = Result<T, TaskError>;

#[derive(Debug, Error)]
pub enum TaskError {
    /// The source file is malformed, unreadable, unsupported, or a duplicate.
    /// Recoverable through a retry, possibly after a repair pass.
    #[error("ingestion of {} failed: {reason}", path.display())]
    Ingestion { path: PathBuf, reason: String },

    /// A transition or retry referenced a task that is not registered,
    /// or (for retries) not in the failed state.
    #[error("unknown task: {0}")]
    UnknownTask(String),

    #[error("task already registered: {0}")]
    DuplicateTask(String),

    #[error("task {task_id} cannot move from {from} to {to}")]
    InvalidTransition {
        task_id: String,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("sanity check failed with {} error(s)", .0.error_count())]
    SanityCheckFailed(SanityCheckMessages),

    #[error("document not found: {0}")]
    DocumentNotFound(i64),

    #[error(transparent)]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl TaskError {
    pub fn ingestion(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        TaskError::Ingestion {
            path: path.into(),
            reason: reason.into(),
        }
    }
}
