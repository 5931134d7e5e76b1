//! Full-text search index over live documents.
//!
//! [`SearchIndex`] is the narrow interface the task layer calls; [`FtsIndex`]
//! keeps an SQLite FTS5 table (`documents_fts`) in step with the live view
//! of the `documents` table. Trashed documents are never indexed.

use anyhow::Result;
use async_trait::async_trait;
use sqlx::{Row, SqlitePool};

#[async_trait]
pub trait SearchIndex: Send + Sync {
    /// Drop the whole index and rebuild it from the live view.
    /// Returns the number of documents indexed.
    async fn reindex(&self) -> Result<u64>;

    /// Merge index segments.
    async fn optimize(&self) -> Result<()>;

    /// Re-index the given documents. Ids that are not live are removed.
    async fn update(&self, ids: &[i64]) -> Result<u64>;

    async fn remove(&self, id: i64) -> Result<()>;

    /// Live document ids matching `query`, best first.
    async fn search(&self, query: &str, limit: i64) -> Result<Vec<i64>>;
}

pub struct FtsIndex {
    pool: SqlitePool,
}

impl FtsIndex {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SearchIndex for FtsIndex {
    async fn reindex(&self) -> Result<u64> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM documents_fts")
            .execute(&mut *tx)
            .await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO documents_fts (document_id, title, content)
            SELECT id, title, content FROM documents WHERE deleted_at IS NULL
            "#,
        )
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(inserted.rows_affected())
    }

    async fn optimize(&self) -> Result<()> {
        sqlx::query("INSERT INTO documents_fts (documents_fts) VALUES ('optimize')")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn update(&self, ids: &[i64]) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let mut indexed = 0u64;

        for id in ids {
            sqlx::query("DELETE FROM documents_fts WHERE document_id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?;

            let inserted = sqlx::query(
                r#"
                INSERT INTO documents_fts (document_id, title, content)
                SELECT id, title, content FROM documents WHERE id = ? AND deleted_at IS NULL
                "#,
            )
            .bind(id)
            .execute(&mut *tx)
            .await?;
            indexed += inserted.rows_affected();
        }

        tx.commit().await?;
        Ok(indexed)
    }

    async fn remove(&self, id: i64) -> Result<()> {
        sqlx::query("DELETE FROM documents_fts WHERE document_id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn search(&self, query: &str, limit: i64) -> Result<Vec<i64>> {
        let terms: Vec<String> = query
            .split_whitespace()
            .map(|t| format!("\"{}\"", t.replace('"', "\"\"")))
            .collect();
        if terms.is_empty() {
            return Ok(Vec::new());
        }

        let rows = sqlx::query(
            "SELECT CAST(document_id AS INTEGER) AS document_id FROM documents_fts WHERE documents_fts MATCH ? ORDER BY rank LIMIT ?",
        )
        .bind(terms.join(" "))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(|row| row.get::<i64, _>("document_id")).collect())
    }
}
