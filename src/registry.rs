//! Task metadata registry.
//!
//! Every task is registered before its body runs, so a failure during
//! execution can always be attributed to a task row. Each transition is a
//! single SQL statement keyed by `task_id`; the primary key rejects a
//! second registration of the same id, which serializes
//! register → start → complete/fail per task while distinct ids proceed
//! concurrently.
//!
//! ```text
//! queued ──start──▶ started ──complete──▶ succeeded
//!                     │
//!                     └──fail──▶ failed ──start (retry)──▶ started
//! ```

use std::path::PathBuf;

use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::{debug, warn};

use crate::error::{TaskError, TaskResult};
use crate::models::{task_file_name_for, ConsumableDocument, DocumentSource, Task, TaskStatus};

const TASK_COLUMNS: &str = "task_id, task_name, task_file_name, original_file, source, status, \
     result, date_created, date_started, date_done";

#[derive(Clone)]
pub struct TaskRegistry {
    pool: SqlitePool,
}

impl TaskRegistry {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Record a task before it executes. Fails if `task_id` is taken.
    pub async fn register(
        &self,
        task_id: &str,
        task_name: &str,
        document: Option<&ConsumableDocument>,
    ) -> TaskResult<Task> {
        let task_file_name = document.map(|d| task_file_name_for(task_id, &d.original_file));
        let original_file = document.map(|d| d.original_file.to_string_lossy().to_string());
        let source = document.map(|d| d.source.as_str());

        let row = sqlx::query(&format!(
            r#"
            INSERT INTO tasks (task_id, task_name, task_file_name, original_file, source, status, date_created)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            RETURNING {TASK_COLUMNS}
            "#
        ))
        .bind(task_id)
        .bind(task_name)
        .bind(&task_file_name)
        .bind(&original_file)
        .bind(source)
        .bind(TaskStatus::Queued.as_str())
        .bind(chrono::Utc::now().timestamp())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db) if db.is_unique_violation() => {
                TaskError::DuplicateTask(task_id.to_string())
            }
            other => TaskError::Database(other),
        })?;

        debug!(task_id, task_name, "task registered");
        row_to_task(&row)
    }

    /// Move a queued task, or a failed one being retried, to `started`.
    pub async fn start(&self, task_id: &str) -> TaskResult<Task> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE tasks SET status = ?, date_started = ?, date_done = NULL
            WHERE task_id = ? AND status IN (?, ?)
            RETURNING {TASK_COLUMNS}
            "#
        ))
        .bind(TaskStatus::Started.as_str())
        .bind(chrono::Utc::now().timestamp())
        .bind(task_id)
        .bind(TaskStatus::Queued.as_str())
        .bind(TaskStatus::Failed.as_str())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => row_to_task(&row),
            None => {
                let current = self
                    .find(task_id)
                    .await?
                    .ok_or_else(|| TaskError::UnknownTask(task_id.to_string()))?;
                Err(TaskError::InvalidTransition {
                    task_id: task_id.to_string(),
                    from: current.status,
                    to: TaskStatus::Started,
                })
            }
        }
    }

    /// Mark a task succeeded. Repeating the call, or naming an unknown
    /// task, is a logged no-op.
    pub async fn complete(&self, task_id: &str, result: Option<&str>) -> TaskResult<()> {
        let updated = sqlx::query(
            r#"
            UPDATE tasks SET status = ?, result = ?, date_done = ?
            WHERE task_id = ? AND status != ?
            "#,
        )
        .bind(TaskStatus::Succeeded.as_str())
        .bind(result)
        .bind(chrono::Utc::now().timestamp())
        .bind(task_id)
        .bind(TaskStatus::Succeeded.as_str())
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            match self.find(task_id).await? {
                Some(_) => debug!(task_id, "task already succeeded"),
                None => warn!(task_id, "completion reported for unknown task"),
            }
        }
        Ok(())
    }

    /// Mark a task failed and return the updated row. An unknown task id
    /// is an error: every failure must be attributable.
    pub async fn fail(&self, task_id: &str, reason: &str) -> TaskResult<Task> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE tasks SET status = ?, result = ?, date_done = ?
            WHERE task_id = ?
            RETURNING {TASK_COLUMNS}
            "#
        ))
        .bind(TaskStatus::Failed.as_str())
        .bind(reason)
        .bind(chrono::Utc::now().timestamp())
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => row_to_task(&row),
            None => Err(TaskError::UnknownTask(task_id.to_string())),
        }
    }

    pub async fn find(&self, task_id: &str) -> TaskResult<Option<Task>> {
        let row = sqlx::query(&format!("SELECT {TASK_COLUMNS} FROM tasks WHERE task_id = ?"))
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_task).transpose()
    }

    /// The task with `task_id`, provided it is in the failed state.
    pub async fn find_failed(&self, task_id: &str) -> TaskResult<Task> {
        match self.find(task_id).await? {
            Some(task) if task.status == TaskStatus::Failed => Ok(task),
            _ => Err(TaskError::UnknownTask(task_id.to_string())),
        }
    }

    /// Most recent tasks first.
    pub async fn list(&self, limit: i64) -> TaskResult<Vec<Task>> {
        let rows = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks ORDER BY date_created DESC, rowid DESC LIMIT ?"
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_task).collect()
    }
}

fn row_to_task(row: &SqliteRow) -> TaskResult<Task> {
    let status: String = row.get("status");
    let source: Option<String> = row.get("source");
    let original_file: Option<String> = row.get("original_file");

    Ok(Task {
        task_id: row.get("task_id"),
        task_name: row.get("task_name"),
        task_file_name: row.get("task_file_name"),
        original_file: original_file.map(PathBuf::from),
        source: source.map(|s| s.parse::<DocumentSource>()).transpose()?,
        status: status.parse::<TaskStatus>()?,
        result: row.get("result"),
        date_created: row.get("date_created"),
        date_started: row.get("date_started"),
        date_done: row.get("date_done"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::migrate;
    use tempfile::TempDir;

    async fn registry() -> (TempDir, TaskRegistry) {
        let tmp = TempDir::new().unwrap();
        let config = Config::with_data_dir(tmp.path());
        let pool = migrate::init(&config).await.unwrap();
        (tmp, TaskRegistry::new(pool))
    }

    #[tokio::test]
    async fn register_derives_display_filename() {
        let (_tmp, registry) = registry().await;
        let doc = ConsumableDocument::new(DocumentSource::ConsumeFolder, "/in/scan.pdf");
        let task = registry
            .register("t-1", "consume_file", Some(&doc))
            .await
            .unwrap();

        assert_eq!(task.status, TaskStatus::Queued);
        assert_eq!(task.task_file_name.as_deref(), Some("t-1_scan.pdf"));
        assert_eq!(task.original_file, Some(PathBuf::from("/in/scan.pdf")));
        assert_eq!(task.source, Some(DocumentSource::ConsumeFolder));
    }

    #[tokio::test]
    async fn duplicate_registration_is_rejected() {
        let (_tmp, registry) = registry().await;
        registry.register("t-1", "train_classifier", None).await.unwrap();
        let err = registry
            .register("t-1", "train_classifier", None)
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::DuplicateTask(ref id) if id == "t-1"));
    }

    #[tokio::test]
    async fn complete_is_idempotent_and_tolerates_unknown_ids() {
        let (_tmp, registry) = registry().await;
        registry.register("t-1", "sanity_check", None).await.unwrap();
        registry.start("t-1").await.unwrap();
        registry.complete("t-1", Some("ok")).await.unwrap();
        registry.complete("t-1", Some("again")).await.unwrap();
        registry.complete("missing", None).await.unwrap();

        let task = registry.find("t-1").await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Succeeded);
        assert_eq!(task.result.as_deref(), Some("ok"));
    }

    #[tokio::test]
    async fn fail_unknown_task_propagates() {
        let (_tmp, registry) = registry().await;
        let err = registry.fail("missing", "boom").await.unwrap_err();
        assert!(matches!(err, TaskError::UnknownTask(_)));
    }

    #[tokio::test]
    async fn failed_task_can_restart_but_succeeded_cannot() {
        let (_tmp, registry) = registry().await;
        registry.register("t-1", "consume_file", None).await.unwrap();
        registry.start("t-1").await.unwrap();
        let failed = registry.fail("t-1", "Scanner jammed").await.unwrap();
        assert_eq!(failed.status, TaskStatus::Failed);
        assert_eq!(failed.result.as_deref(), Some("Scanner jammed"));
        assert!(failed.date_done.is_some());

        let restarted = registry.start("t-1").await.unwrap();
        assert_eq!(restarted.status, TaskStatus::Started);
        assert!(restarted.date_done.is_none());

        registry.complete("t-1", None).await.unwrap();
        let err = registry.start("t-1").await.unwrap_err();
        assert!(matches!(
            err,
            TaskError::InvalidTransition {
                from: TaskStatus::Succeeded,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn find_failed_requires_failed_status() {
        let (_tmp, registry) = registry().await;
        registry.register("t-1", "consume_file", None).await.unwrap();
        assert!(matches!(
            registry.find_failed("t-1").await,
            Err(TaskError::UnknownTask(_))
        ));
        registry.fail("t-1", "boom").await.unwrap();
        assert_eq!(registry.find_failed("t-1").await.unwrap().task_id, "t-1");
    }

    #[tokio::test]
    async fn concurrent_registration_of_distinct_ids() {
        let (_tmp, registry) = registry().await;
        let mut handles = Vec::new();
        for i in 0..16 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                registry
                    .register(&format!("task-{}", i), "index_optimize", None)
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(registry.list(100).await.unwrap().len(), 16);
    }
}
