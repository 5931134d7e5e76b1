//! Document and matching-rule repository over SQLite.
//!
//! Documents have two access paths over one table: the live view, which
//! excludes soft-deleted rows, and the all-records view, which includes
//! them. Moving a document to the trash only sets `deleted_at`; the row is
//! removed for good by [`TrashReaper`](crate::trash::TrashReaper).

use std::collections::HashMap;

use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::error::{TaskError, TaskResult};
use crate::models::{Document, MatchingAlgorithm, MatchingRule, NewDocument, RuleKind};

const DOCUMENT_COLUMNS: &str = "id, title, content, checksum, mime_type, original_filename, \
     correspondent_id, document_type_id, added, created, modified, deleted_at";

/// Which rows a document query should see.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum View {
    Live,
    All,
}

impl View {
    fn predicate(&self) -> &'static str {
        match self {
            View::Live => "deleted_at IS NULL",
            View::All => "1 = 1",
        }
    }
}

#[derive(Clone)]
pub struct DocumentStore {
    pool: SqlitePool,
}

impl DocumentStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn insert(&self, doc: &NewDocument) -> TaskResult<Document> {
        let now = chrono::Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;

        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO documents (title, content, checksum, mime_type, original_filename,
                                   correspondent_id, document_type_id, added, created, modified)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(&doc.title)
        .bind(&doc.content)
        .bind(&doc.checksum)
        .bind(&doc.mime_type)
        .bind(&doc.original_filename)
        .bind(doc.correspondent_id)
        .bind(doc.document_type_id)
        .bind(now)
        .bind(now)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;

        for tag_id in &doc.tag_ids {
            sqlx::query("INSERT OR IGNORE INTO document_tags (document_id, tag_id) VALUES (?, ?)")
                .bind(id)
                .bind(tag_id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;

        self.get(id, View::All)
            .await?
            .ok_or(TaskError::DocumentNotFound(id))
    }

    pub async fn get(&self, id: i64, view: View) -> TaskResult<Option<Document>> {
        let row = sqlx::query(&format!(
            "SELECT {DOCUMENT_COLUMNS} FROM documents WHERE id = ? AND {}",
            view.predicate()
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let tag_ids: Vec<i64> =
            sqlx::query_scalar("SELECT tag_id FROM document_tags WHERE document_id = ? ORDER BY tag_id")
                .bind(id)
                .fetch_all(&self.pool)
                .await?;

        Ok(Some(row_to_document(&row, tag_ids)))
    }

    pub async fn list_live(&self) -> TaskResult<Vec<Document>> {
        self.list(View::Live).await
    }

    pub async fn list_all(&self) -> TaskResult<Vec<Document>> {
        self.list(View::All).await
    }

    async fn list(&self, view: View) -> TaskResult<Vec<Document>> {
        let rows = sqlx::query(&format!(
            "SELECT {DOCUMENT_COLUMNS} FROM documents WHERE {} ORDER BY id",
            view.predicate()
        ))
        .fetch_all(&self.pool)
        .await?;

        let mut tags: HashMap<i64, Vec<i64>> = HashMap::new();
        let tag_rows = sqlx::query("SELECT document_id, tag_id FROM document_tags ORDER BY tag_id")
            .fetch_all(&self.pool)
            .await?;
        for row in &tag_rows {
            tags.entry(row.get("document_id"))
                .or_default()
                .push(row.get("tag_id"));
        }

        Ok(rows
            .iter()
            .map(|row| {
                let id: i64 = row.get("id");
                row_to_document(row, tags.remove(&id).unwrap_or_default())
            })
            .collect())
    }

    pub async fn count(&self, view: View) -> TaskResult<i64> {
        let count: i64 = sqlx::query_scalar(&format!(
            "SELECT COUNT(*) FROM documents WHERE {}",
            view.predicate()
        ))
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    /// Look up a document by checksum across all records, trash included.
    pub async fn find_by_checksum(&self, checksum: &str) -> TaskResult<Option<Document>> {
        let id: Option<i64> = sqlx::query_scalar("SELECT id FROM documents WHERE checksum = ?")
            .bind(checksum)
            .fetch_optional(&self.pool)
            .await?;
        match id {
            Some(id) => self.get(id, View::All).await,
            None => Ok(None),
        }
    }

    pub async fn set_original_filename(&self, id: i64, name: &str) -> TaskResult<()> {
        sqlx::query("UPDATE documents SET original_filename = ? WHERE id = ?")
            .bind(name)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn update_content(&self, id: i64, content: &str) -> TaskResult<()> {
        let updated = sqlx::query("UPDATE documents SET content = ?, modified = ? WHERE id = ?")
            .bind(content)
            .bind(chrono::Utc::now().timestamp())
            .bind(id)
            .execute(&self.pool)
            .await?;
        if updated.rows_affected() == 0 {
            return Err(TaskError::DocumentNotFound(id));
        }
        Ok(())
    }

    /// Move a live document to the trash. Returns `false` if it was not live.
    pub async fn soft_delete(&self, id: i64) -> TaskResult<bool> {
        let updated = sqlx::query(
            "UPDATE documents SET deleted_at = ? WHERE id = ? AND deleted_at IS NULL",
        )
        .bind(chrono::Utc::now().timestamp())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(updated.rows_affected() > 0)
    }

    /// Bring a trashed document back. Returns `false` if it was not in the trash.
    pub async fn restore(&self, id: i64) -> TaskResult<bool> {
        let updated = sqlx::query(
            "UPDATE documents SET deleted_at = NULL WHERE id = ? AND deleted_at IS NOT NULL",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(updated.rows_affected() > 0)
    }

    /// Overwrite the soft-delete timestamp directly.
    pub async fn set_deleted_at(&self, id: i64, deleted_at: Option<i64>) -> TaskResult<()> {
        sqlx::query("UPDATE documents SET deleted_at = ? WHERE id = ?")
            .bind(deleted_at)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Trashed documents whose `deleted_at` is at or before `cutoff`.
    pub async fn list_trashed_before(&self, cutoff: i64) -> TaskResult<Vec<Document>> {
        let rows = sqlx::query(&format!(
            "SELECT {DOCUMENT_COLUMNS} FROM documents \
             WHERE deleted_at IS NOT NULL AND deleted_at <= ? ORDER BY id"
        ))
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(|row| row_to_document(row, Vec::new())).collect())
    }

    /// Physically remove a row. Tag links go with it through the cascade.
    pub async fn delete_permanently(&self, id: i64) -> TaskResult<bool> {
        let deleted = sqlx::query("DELETE FROM documents WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(deleted.rows_affected() > 0)
    }

    pub async fn create_rule(
        &self,
        kind: RuleKind,
        name: &str,
        algorithm: MatchingAlgorithm,
    ) -> TaskResult<MatchingRule> {
        let id: i64 = sqlx::query_scalar(&format!(
            "INSERT INTO {} (name, matching_algorithm) VALUES (?, ?) RETURNING id",
            kind.table()
        ))
        .bind(name)
        .bind(algorithm.as_str())
        .fetch_one(&self.pool)
        .await?;

        Ok(MatchingRule {
            id,
            kind,
            name: name.to_string(),
            matching_algorithm: algorithm,
        })
    }

    pub async fn list_rules(&self, kind: RuleKind) -> TaskResult<Vec<MatchingRule>> {
        let rows = sqlx::query(&format!(
            "SELECT id, name, matching_algorithm FROM {} ORDER BY id",
            kind.table()
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> TaskResult<MatchingRule> {
                let algorithm: String = row.get("matching_algorithm");
                Ok(MatchingRule {
                    id: row.get("id"),
                    kind,
                    name: row.get("name"),
                    matching_algorithm: algorithm.parse()?,
                })
            })
            .collect()
    }

    pub async fn set_matching_algorithm(
        &self,
        kind: RuleKind,
        id: i64,
        algorithm: MatchingAlgorithm,
    ) -> TaskResult<bool> {
        let updated = sqlx::query(&format!(
            "UPDATE {} SET matching_algorithm = ? WHERE id = ?",
            kind.table()
        ))
        .bind(algorithm.as_str())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(updated.rows_affected() > 0)
    }

    /// Delete a rule; documents referencing it lose the reference.
    pub async fn delete_rule(&self, kind: RuleKind, id: i64) -> TaskResult<bool> {
        let deleted = sqlx::query(&format!("DELETE FROM {} WHERE id = ?", kind.table()))
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(deleted.rows_affected() > 0)
    }

    /// Ids of rules of `kind` configured for automatic matching, ascending.
    pub async fn auto_rule_ids(&self, kind: RuleKind) -> TaskResult<Vec<i64>> {
        let ids: Vec<i64> = sqlx::query_scalar(&format!(
            "SELECT id FROM {} WHERE matching_algorithm = ? ORDER BY id",
            kind.table()
        ))
        .bind(MatchingAlgorithm::Auto.as_str())
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }
}

fn row_to_document(row: &SqliteRow, tag_ids: Vec<i64>) -> Document {
    Document {
        id: row.get("id"),
        title: row.get("title"),
        content: row.get("content"),
        checksum: row.get("checksum"),
        mime_type: row.get("mime_type"),
        original_filename: row.get("original_filename"),
        correspondent_id: row.get("correspondent_id"),
        document_type_id: row.get("document_type_id"),
        tag_ids,
        added: row.get("added"),
        created: row.get("created"),
        modified: row.get("modified"),
        deleted_at: row.get("deleted_at"),
    }
}
