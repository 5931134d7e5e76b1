//! Task lifecycle hooks and the runner that wraps every task body in them.
//!
//! ```text
//! before_task_publish ──▶ start ──▶ body ──┬─ Ok  ──▶ task_success
//!                                          └─ Err ──▶ task_failure (fail + quarantine)
//! ```
//!
//! The body runs on its own tokio task, so a panic inside it is reported as
//! an ordinary failure and still goes through [`task_failure`].

use std::future::Future;
use std::path::{Path, PathBuf};

use anyhow::anyhow;
use tracing::{debug, error, info, warn};

use crate::error::{TaskError, TaskResult};
use crate::models::{ConsumableDocument, ConsumeOverrides, Document, Task};
use crate::registry::TaskRegistry;
use crate::training::TrainingOutcome;

/// Routing metadata published with a task.
#[derive(Debug, Clone)]
pub struct TaskHeaders {
    pub id: String,
    pub task: String,
}

/// Arguments published with a task. Only consume tasks carry a document.
#[derive(Debug, Clone, Default)]
pub struct TaskPayload {
    pub document: Option<ConsumableDocument>,
    pub overrides: ConsumeOverrides,
}

/// Short human-readable result stored on a succeeded task.
pub trait TaskOutput {
    fn summary(&self) -> Option<String>;
}

impl TaskOutput for Document {
    fn summary(&self) -> Option<String> {
        Some(format!("Success. New document id {} created", self.id))
    }
}

impl TaskOutput for String {
    fn summary(&self) -> Option<String> {
        Some(self.clone())
    }
}

impl TaskOutput for TrainingOutcome {
    fn summary(&self) -> Option<String> {
        Some(self.to_string())
    }
}

impl TaskOutput for u64 {
    fn summary(&self) -> Option<String> {
        Some(self.to_string())
    }
}

impl TaskOutput for () {
    fn summary(&self) -> Option<String> {
        None
    }
}

pub async fn before_task_publish(
    registry: &TaskRegistry,
    headers: &TaskHeaders,
    payload: &TaskPayload,
) -> TaskResult<Task> {
    registry
        .register(&headers.id, &headers.task, payload.document.as_ref())
        .await
}

pub async fn task_success(
    registry: &TaskRegistry,
    task_id: &str,
    result: Option<&str>,
) -> TaskResult<()> {
    registry.complete(task_id, result).await
}

/// Mark the task failed and move its source file into quarantine.
pub async fn task_failure(
    registry: &TaskRegistry,
    task_id: &str,
    reason: &str,
    quarantine_dir: &Path,
) -> TaskResult<Task> {
    let task = registry.fail(task_id, reason).await?;
    error!(task_id, task_name = %task.task_name, reason, "task failed");

    if let (Some(source), Some(name)) = (&task.original_file, &task.task_file_name) {
        quarantine_file(source, quarantine_dir, name).await?;
    }
    Ok(task)
}

/// Move `source` to `quarantine_dir/name` with a single rename.
///
/// A missing source is not an error: it was either never written or has
/// already been quarantined. Returns the destination when a move happened.
pub async fn quarantine_file(
    source: &Path,
    quarantine_dir: &Path,
    name: &str,
) -> TaskResult<Option<PathBuf>> {
    if tokio::fs::metadata(source).await.is_err() {
        warn!(path = %source.display(), "source file missing, nothing to quarantine");
        return Ok(None);
    }

    tokio::fs::create_dir_all(quarantine_dir).await?;
    let destination = quarantine_dir.join(name);
    tokio::fs::rename(source, &destination).await?;

    info!(
        from = %source.display(),
        to = %destination.display(),
        "moved failed file to quarantine"
    );
    Ok(Some(destination))
}

#[derive(Clone)]
pub struct TaskRunner {
    registry: TaskRegistry,
    quarantine_dir: PathBuf,
}

impl TaskRunner {
    pub fn new(registry: TaskRegistry, quarantine_dir: PathBuf) -> Self {
        Self {
            registry,
            quarantine_dir,
        }
    }

    /// Register the task and move it to `started`.
    pub async fn before(&self, headers: &TaskHeaders, payload: &TaskPayload) -> TaskResult<Task> {
        before_task_publish(&self.registry, headers, payload).await?;
        self.registry.start(&headers.id).await
    }

    /// Record the outcome. Hook errors are logged; they never replace the
    /// body's own result.
    pub async fn after<T: TaskOutput>(&self, task_id: &str, outcome: &TaskResult<T>) {
        let hooked = match outcome {
            Ok(value) => {
                let summary = value.summary();
                task_success(&self.registry, task_id, summary.as_deref()).await
            }
            Err(e) => task_failure(&self.registry, task_id, &e.to_string(), &self.quarantine_dir)
                .await
                .map(|_| ()),
        };
        if let Err(e) = hooked {
            error!(task_id, error = %e, "task lifecycle hook failed");
        }
    }

    pub async fn run<T, F, Fut>(&self, headers: TaskHeaders, payload: TaskPayload, body: F) -> TaskResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = TaskResult<T>> + Send + 'static,
        T: TaskOutput + Send + 'static,
    {
        self.before(&headers, &payload).await?;
        debug!(task_id = %headers.id, task_name = %headers.task, "task started");

        let outcome = match tokio::spawn(body()).await {
            Ok(outcome) => outcome,
            Err(join) => Err(TaskError::Other(anyhow!("task did not finish: {}", join))),
        };

        self.after(&headers.id, &outcome).await;
        outcome
    }
}
