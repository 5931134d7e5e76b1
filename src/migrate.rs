use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

/// Open the database, apply the schema, and create the configured directories.
pub async fn init(config: &Config) -> Result<SqlitePool> {
    config.ensure_dirs()?;
    let pool = db::connect(&config.db).await?;
    run_migrations(&pool).await?;
    Ok(pool)
}

pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    // Matching rules: tags, correspondents, document types share one shape
    for table in ["tags", "correspondents", "document_types"] {
        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                matching_algorithm TEXT NOT NULL DEFAULT 'none',
                match_pattern TEXT NOT NULL DEFAULT ''
            )
            "#
        ))
        .execute(pool)
        .await?;
    }

    // Documents; deleted_at marks a soft delete until the reaper runs
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS documents (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            title TEXT NOT NULL,
            content TEXT NOT NULL DEFAULT '',
            checksum TEXT NOT NULL UNIQUE,
            mime_type TEXT NOT NULL DEFAULT 'text/plain',
            original_filename TEXT,
            correspondent_id INTEGER REFERENCES correspondents(id) ON DELETE SET NULL,
            document_type_id INTEGER REFERENCES document_types(id) ON DELETE SET NULL,
            added INTEGER NOT NULL,
            created INTEGER NOT NULL,
            modified INTEGER NOT NULL,
            deleted_at INTEGER
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS document_tags (
            document_id INTEGER NOT NULL REFERENCES documents(id) ON DELETE CASCADE,
            tag_id INTEGER NOT NULL REFERENCES tags(id) ON DELETE CASCADE,
            PRIMARY KEY (document_id, tag_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Task metadata, kept for audit and retry
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS tasks (
            task_id TEXT PRIMARY KEY,
            task_name TEXT NOT NULL,
            task_file_name TEXT,
            original_file TEXT,
            source TEXT,
            status TEXT NOT NULL,
            result TEXT,
            date_created INTEGER NOT NULL,
            date_started INTEGER,
            date_done INTEGER
        )
        "#,
    )
    .execute(pool)
    .await?;

    // FTS5 CREATE is not idempotent natively, so we check first
    let fts_exists: bool = sqlx::query_scalar(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='documents_fts'",
    )
    .fetch_one(pool)
    .await?;

    if !fts_exists {
        sqlx::query(
            r#"
            CREATE VIRTUAL TABLE documents_fts USING fts5(
                document_id UNINDEXED,
                title,
                content
            )
            "#,
        )
        .execute(pool)
        .await?;
    }

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_documents_deleted_at ON documents(deleted_at)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_tasks_date_created ON tasks(date_created DESC)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
