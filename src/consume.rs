//! The consume pipeline and the retry of quarantined files.
//!
//! `consume` never quarantines on its own: failures are returned to the
//! caller, and [`TaskRunner`](crate::hooks::TaskRunner) moves the source
//! file away once the task is marked failed. `retry` works on a scratch
//! copy so the quarantined file survives a second failure untouched.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tracing::{debug, error, info, warn};

use crate::classifier::{ClassifierModel, Preprocessor};
use crate::config::Config;
use crate::error::{TaskError, TaskResult};
use crate::extract;
use crate::fingerprint::AutoRules;
use crate::hooks::TaskOutput;
use crate::index::SearchIndex;
use crate::models::{ConsumableDocument, ConsumeOverrides, Document, DocumentSource, NewDocument};
use crate::progress::{ConsumeStep, ProgressEvent, ProgressReporter};
use crate::registry::TaskRegistry;
use crate::repair::Repairer;
use crate::store::{DocumentStore, View};

#[derive(Clone)]
pub struct IngestionPipeline {
    config: Config,
    store: DocumentStore,
    registry: TaskRegistry,
    index: Arc<dyn SearchIndex>,
    progress: Arc<dyn ProgressReporter>,
    preprocessor: Arc<dyn Preprocessor>,
    repairer: Arc<dyn Repairer>,
}

/// Labels chosen for a new document during the classifying stage.
struct Assignment {
    title: String,
    correspondent_id: Option<i64>,
    document_type_id: Option<i64>,
    tag_ids: Vec<i64>,
}

impl IngestionPipeline {
    pub fn new(
        config: Config,
        store: DocumentStore,
        registry: TaskRegistry,
        index: Arc<dyn SearchIndex>,
        progress: Arc<dyn ProgressReporter>,
        preprocessor: Arc<dyn Preprocessor>,
        repairer: Arc<dyn Repairer>,
    ) -> Self {
        Self {
            config,
            store,
            registry,
            index,
            progress,
            preprocessor,
            repairer,
        }
    }

    pub async fn consume(
        &self,
        document: &ConsumableDocument,
        overrides: &ConsumeOverrides,
    ) -> TaskResult<Document> {
        let filename = display_name(&document.original_file);
        self.progress.report(ProgressEvent::Started {
            filename: filename.clone(),
        });

        match self.run_stages(document, overrides, &filename).await {
            Ok(doc) => {
                self.progress.report(ProgressEvent::Success {
                    filename,
                    document_id: doc.id,
                });
                Ok(doc)
            }
            Err(e) => {
                self.progress.report(ProgressEvent::Failed {
                    filename,
                    reason: e.to_string(),
                });
                Err(e)
            }
        }
    }

    fn step(&self, filename: &str, step: ConsumeStep) {
        self.progress.report(ProgressEvent::Working {
            filename: filename.to_string(),
            step,
            current: step.ordinal(),
            max: ConsumeStep::COUNT,
        });
    }

    async fn run_stages(
        &self,
        document: &ConsumableDocument,
        overrides: &ConsumeOverrides,
        filename: &str,
    ) -> TaskResult<Document> {
        let path = &document.original_file;

        self.step(filename, ConsumeStep::Validating);
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(TaskError::ingestion(path, "Cannot consume: file not found"));
            }
            Err(e) => return Err(TaskError::ingestion(path, format!("Cannot read file: {}", e))),
        };
        let mime = extract::detect_mime(path)
            .ok_or_else(|| TaskError::ingestion(path, "Unsupported file type"))?;
        extract::validate(&bytes, mime).map_err(|e| TaskError::ingestion(path, e.to_string()))?;

        self.step(filename, ConsumeStep::Extracting);
        let extracted = {
            let bytes = bytes.clone();
            tokio::task::spawn_blocking(move || extract::extract_text(&bytes, mime))
                .await
                .map_err(|e| TaskError::ingestion(path, format!("Extraction did not finish: {}", e)))?
        };
        let content = match extracted {
            Ok(text) => text,
            // Structure already checked; a PDF we cannot read text from has no usable text layer
            Err(extract::ExtractError::Pdf(reason)) => {
                warn!(file = filename, reason = %reason, "no text layer extracted from PDF");
                String::new()
            }
            Err(e) => return Err(TaskError::ingestion(path, e.to_string())),
        };

        self.step(filename, ConsumeStep::CheckingDuplicates);
        let checksum = format!("{:x}", Sha256::digest(&bytes));
        if let Some(existing) = self.store.find_by_checksum(&checksum).await? {
            return Err(duplicate_error(path, filename, &existing));
        }

        self.step(filename, ConsumeStep::Classifying);
        let assignment = self.classify(path, &content, overrides).await?;

        self.step(filename, ConsumeStep::Storing);
        let new_doc = NewDocument {
            title: assignment.title,
            content,
            checksum,
            mime_type: mime.to_string(),
            original_filename: None,
            correspondent_id: assignment.correspondent_id,
            document_type_id: assignment.document_type_id,
            tag_ids: assignment.tag_ids,
        };
        let stored = match self.store.insert(&new_doc).await {
            Ok(doc) => doc,
            Err(TaskError::Database(sqlx::Error::Database(db))) if db.is_unique_violation() => {
                return Err(TaskError::ingestion(
                    path,
                    format!("Not consuming {}: It is a duplicate.", filename),
                ));
            }
            Err(e) => return Err(e),
        };

        let stored_name = format!("{:07}.{}", stored.id, extract::extension_for(mime));
        if let Err(e) = self.finish_storing(stored.id, &stored_name, &bytes).await {
            // A failed store leaves neither a row nor an original behind
            self.roll_back(stored.id, &stored_name).await;
            return Err(e);
        }

        if document.source == DocumentSource::ConsumeFolder && self.config.consume.delete_consumed {
            if let Err(e) = tokio::fs::remove_file(path).await {
                warn!(path = %path.display(), error = %e, "could not remove consumed file");
            }
        }

        info!(document_id = stored.id, file = filename, "document consumed");
        self.store
            .get(stored.id, View::All)
            .await?
            .ok_or(TaskError::DocumentNotFound(stored.id))
    }

    async fn classify(
        &self,
        path: &Path,
        content: &str,
        overrides: &ConsumeOverrides,
    ) -> TaskResult<Assignment> {
        let title = overrides.title.clone().unwrap_or_else(|| {
            path.file_stem()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_default()
        });
        let mut assignment = Assignment {
            title,
            correspondent_id: overrides.correspondent_id,
            document_type_id: overrides.document_type_id,
            tag_ids: overrides.tag_ids.clone(),
        };

        let model = match ClassifierModel::load_async(self.config.paths.model_file.clone()).await {
            Ok(Some(model)) => model,
            Ok(None) => return Ok(assignment),
            Err(e) => {
                warn!(error = %e, "classifier model unusable, skipping auto matching");
                return Ok(assignment);
            }
        };

        // The artifact may predate rule edits; only rules still set to auto apply
        let rules = AutoRules::load(&self.store).await?;
        let text = self.preprocessor.preprocess(content);
        if assignment.correspondent_id.is_none() {
            assignment.correspondent_id = model
                .predict_correspondent(&text)
                .filter(|id| rules.correspondents.contains(id));
        }
        if assignment.document_type_id.is_none() {
            assignment.document_type_id = model
                .predict_document_type(&text)
                .filter(|id| rules.document_types.contains(id));
        }
        for tag in model.predict_tags(&text) {
            if rules.tags.contains(&tag) && !assignment.tag_ids.contains(&tag) {
                assignment.tag_ids.push(tag);
            }
        }
        debug!(
            correspondent = ?assignment.correspondent_id,
            document_type = ?assignment.document_type_id,
            tags = ?assignment.tag_ids,
            "classifier suggestions applied"
        );
        Ok(assignment)
    }

    async fn write_original(&self, name: &str, bytes: &[u8]) -> TaskResult<()> {
        let dir = &self.config.paths.originals_dir;
        tokio::fs::create_dir_all(dir).await?;
        tokio::fs::write(dir.join(name), bytes).await?;
        Ok(())
    }

    async fn finish_storing(&self, id: i64, stored_name: &str, bytes: &[u8]) -> TaskResult<()> {
        self.write_original(stored_name, bytes).await?;
        self.store.set_original_filename(id, stored_name).await?;
        self.index.update(&[id]).await?;
        Ok(())
    }

    async fn roll_back(&self, id: i64, stored_name: &str) {
        if let Err(e) = self.index.remove(id).await {
            warn!(document_id = id, error = %e, "could not remove index entry during rollback");
        }
        if let Err(e) = self.store.delete_permanently(id).await {
            error!(document_id = id, error = %e, "could not remove document row during rollback");
        }
        remove_if_present(&self.config.paths.originals_dir.join(stored_name)).await;
    }

    /// Re-run a failed consume task from its quarantined file, optionally
    /// repairing a scratch copy first.
    pub async fn retry(&self, task_id: &str, clean: bool) -> TaskResult<Document> {
        let task = self.registry.find_failed(task_id).await?;
        let quarantine_dir = &self.config.paths.quarantine_dir;
        let name = task.task_file_name.clone().ok_or_else(|| {
            TaskError::ingestion(quarantine_dir, format!("Task {} has no source file", task_id))
        })?;
        let quarantined = quarantine_dir.join(&name);
        if tokio::fs::metadata(&quarantined).await.is_err() {
            return Err(TaskError::ingestion(&quarantined, "Quarantined file not found"));
        }

        // Claim the task first; a concurrent retry of the same id stops here
        self.registry.start(task_id).await?;

        let working = match self.prepare_working_copy(&quarantined, &name).await {
            Ok(working) => working,
            Err(e) => {
                self.registry.fail(task_id, &e.to_string()).await?;
                return Err(e);
            }
        };

        if clean {
            self.repair(task_id, &working).await;
        }

        let overrides = ConsumeOverrides {
            title: task
                .original_file
                .as_deref()
                .and_then(Path::file_stem)
                .map(|s| s.to_string_lossy().to_string()),
            ..Default::default()
        };
        let document = ConsumableDocument::new(
            task.source.unwrap_or(DocumentSource::ApiUpload),
            working.clone(),
        );
        let outcome = self.consume(&document, &overrides).await;
        remove_if_present(&working).await;

        match outcome {
            Ok(doc) => {
                self.registry.complete(task_id, doc.summary().as_deref()).await?;
                remove_if_present(&quarantined).await;
                info!(task_id, document_id = doc.id, "retry succeeded");
                Ok(doc)
            }
            Err(e) => {
                self.registry.fail(task_id, &e.to_string()).await?;
                error!(task_id, error = %e, "retry failed, file stays in quarantine");
                Err(e)
            }
        }
    }

    async fn prepare_working_copy(&self, quarantined: &Path, name: &str) -> TaskResult<PathBuf> {
        let scratch_dir = &self.config.paths.scratch_dir;
        tokio::fs::create_dir_all(scratch_dir).await?;
        let working = scratch_dir.join(name);
        if let Err(e) = tokio::fs::copy(quarantined, &working).await {
            remove_if_present(&working).await;
            return Err(e.into());
        }
        Ok(working)
    }

    async fn repair(&self, task_id: &str, working: &Path) {
        let repairer = Arc::clone(&self.repairer);
        let path: PathBuf = working.to_path_buf();
        let result = tokio::task::spawn_blocking(move || repairer.repair(&path)).await;

        match result {
            Ok(Ok(())) => info!(task_id, "{} cleaned successfully", self.repairer.name()),
            Ok(Err(e)) => error!(task_id, error = %e, "{} cleaning failed", self.repairer.name()),
            Err(e) => error!(task_id, error = %e, "{} cleaning did not finish", self.repairer.name()),
        }
    }
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string())
}

fn duplicate_error(path: &Path, filename: &str, existing: &Document) -> TaskError {
    let mut reason = format!(
        "Not consuming {}: It is a duplicate of {} (#{}).",
        filename, existing.title, existing.id
    );
    if existing.is_deleted() {
        reason.push_str(" Note: existing document is in the trash.");
    }
    TaskError::ingestion(path, reason)
}

async fn remove_if_present(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "could not remove file");
        }
    }
}
