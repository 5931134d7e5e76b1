//! Soft delete, restore, and grace-period eviction.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::error::{TaskError, TaskResult};
use crate::index::SearchIndex;
use crate::store::DocumentStore;

pub struct TrashReaper {
    store: DocumentStore,
    index: Arc<dyn SearchIndex>,
    originals_dir: PathBuf,
}

impl TrashReaper {
    pub fn new(store: DocumentStore, index: Arc<dyn SearchIndex>, originals_dir: PathBuf) -> Self {
        Self {
            store,
            index,
            originals_dir,
        }
    }

    /// Move a live document to the trash and drop it from the index.
    pub async fn trash(&self, id: i64) -> TaskResult<()> {
        if !self.store.soft_delete(id).await? {
            return Err(TaskError::DocumentNotFound(id));
        }
        self.index.remove(id).await?;
        info!(document_id = id, "document moved to trash");
        Ok(())
    }

    /// Bring a trashed document back and index it again.
    pub async fn restore(&self, id: i64) -> TaskResult<()> {
        if !self.store.restore(id).await? {
            return Err(TaskError::DocumentNotFound(id));
        }
        self.index.update(&[id]).await?;
        info!(document_id = id, "document restored from trash");
        Ok(())
    }

    pub async fn empty(&self, ids: Option<&[i64]>, delay: Duration) -> TaskResult<u64> {
        self.empty_at(ids, delay, chrono::Utc::now().timestamp()).await
    }

    /// Permanently remove trashed documents whose grace period ended by
    /// `now`, optionally only those in `ids`. Returns how many were removed.
    pub async fn empty_at(&self, ids: Option<&[i64]>, delay: Duration, now: i64) -> TaskResult<u64> {
        let cutoff = match i64::try_from(delay.as_secs())
            .ok()
            .and_then(|secs| now.checked_sub(secs))
        {
            Some(cutoff) => cutoff,
            None => {
                debug!(delay_secs = delay.as_secs(), "grace period exceeds the clock range, nothing eligible");
                return Ok(0);
            }
        };
        let mut eligible = self.store.list_trashed_before(cutoff).await?;
        if let Some(ids) = ids {
            eligible.retain(|doc| ids.contains(&doc.id));
        }

        if eligible.is_empty() {
            debug!(cutoff, "no trashed documents past their grace period");
            return Ok(0);
        }

        let mut removed = 0u64;
        for doc in eligible {
            self.index.remove(doc.id).await?;
            if !self.store.delete_permanently(doc.id).await? {
                continue;
            }
            removed += 1;

            if let Some(name) = &doc.original_filename {
                let path = self.originals_dir.join(name);
                if let Err(e) = tokio::fs::remove_file(&path).await {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        warn!(document_id = doc.id, path = %path.display(), error = %e, "could not remove original");
                    }
                }
            }
        }

        info!(removed, "emptied trash");
        Ok(removed)
    }
}
