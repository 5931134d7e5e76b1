//! Store consistency checks and severity aggregation.
//!
//! A check run never stops at the first problem: every finding is collected
//! into [`SanityCheckMessages`] and the run is judged as a whole by
//! [`summarize`]. Any error fails the run; otherwise warnings, then infos,
//! decide the display text.

use std::collections::HashSet;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

use crate::error::{TaskError, TaskResult};
use crate::store::DocumentStore;

pub const NO_ISSUES: &str = "No issues detected.";
pub const EXITED_WITH_INFOS: &str = "Sanity check exited with infos. See log.";
pub const EXITED_WITH_WARNINGS: &str = "Sanity check exited with warnings. See log.";
pub const EXITED_WITH_ERRORS: &str = "Sanity check exited with errors. See log.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageLevel {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SanityCheckMessage {
    pub document_id: Option<i64>,
    pub level: MessageLevel,
    pub message: String,
}

/// Findings of one check run, in the order they were found.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SanityCheckMessages {
    messages: Vec<SanityCheckMessage>,
}

impl SanityCheckMessages {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, document_id: Option<i64>, level: MessageLevel, message: impl Into<String>) {
        self.messages.push(SanityCheckMessage {
            document_id,
            level,
            message: message.into(),
        });
    }

    pub fn info(&mut self, document_id: Option<i64>, message: impl Into<String>) {
        self.push(document_id, MessageLevel::Info, message);
    }

    pub fn warning(&mut self, document_id: Option<i64>, message: impl Into<String>) {
        self.push(document_id, MessageLevel::Warning, message);
    }

    pub fn error(&mut self, document_id: Option<i64>, message: impl Into<String>) {
        self.push(document_id, MessageLevel::Error, message);
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SanityCheckMessage> {
        self.messages.iter()
    }

    fn has(&self, level: MessageLevel) -> bool {
        self.messages.iter().any(|m| m.level == level)
    }

    pub fn has_error(&self) -> bool {
        self.has(MessageLevel::Error)
    }

    pub fn has_warning(&self) -> bool {
        self.has(MessageLevel::Warning)
    }

    pub fn has_info(&self) -> bool {
        self.has(MessageLevel::Info)
    }

    pub fn error_count(&self) -> usize {
        self.messages
            .iter()
            .filter(|m| m.level == MessageLevel::Error)
            .count()
    }

    /// Emit every message at its own level.
    pub fn log_messages(&self) {
        if self.messages.is_empty() {
            info!("sanity checker detected no issues");
            return;
        }
        for m in &self.messages {
            let document_id = m.document_id.map(|id| id.to_string());
            let document_id = document_id.as_deref().unwrap_or("-");
            match m.level {
                MessageLevel::Info => info!(document_id, "{}", m.message),
                MessageLevel::Warning => warn!(document_id, "{}", m.message),
                MessageLevel::Error => error!(document_id, "{}", m.message),
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SanityOutcome {
    Clean,
    Info,
    Warning,
    Failed,
}

/// Judge a run: exactly one outcome applies, errors first.
pub fn summarize(messages: &SanityCheckMessages) -> (SanityOutcome, &'static str) {
    if messages.has_error() {
        (SanityOutcome::Failed, EXITED_WITH_ERRORS)
    } else if messages.has_warning() {
        (SanityOutcome::Warning, EXITED_WITH_WARNINGS)
    } else if messages.has_info() {
        (SanityOutcome::Info, EXITED_WITH_INFOS)
    } else {
        (SanityOutcome::Clean, NO_ISSUES)
    }
}

/// Run `engine`, log its findings, and turn them into a task result.
pub async fn sanity_check(engine: &dyn SanityCheckEngine) -> TaskResult<String> {
    let messages = engine.check().await?;
    messages.log_messages();

    match summarize(&messages) {
        (SanityOutcome::Failed, _) => Err(TaskError::SanityCheckFailed(messages)),
        (_, text) => Ok(text.to_string()),
    }
}

#[async_trait]
pub trait SanityCheckEngine: Send + Sync {
    async fn check(&self) -> TaskResult<SanityCheckMessages>;
}

/// Checks every stored document against its original file and looks for
/// files in the originals directory that no document references.
pub struct StoreSanityChecker {
    store: DocumentStore,
    originals_dir: PathBuf,
}

impl StoreSanityChecker {
    pub fn new(store: DocumentStore, originals_dir: PathBuf) -> Self {
        Self {
            store,
            originals_dir,
        }
    }

    fn present_files(&self) -> HashSet<PathBuf> {
        WalkDir::new(&self.originals_dir)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
            .map(|entry| entry.into_path())
            .collect()
    }
}

#[async_trait]
impl SanityCheckEngine for StoreSanityChecker {
    async fn check(&self) -> TaskResult<SanityCheckMessages> {
        let mut messages = SanityCheckMessages::new();
        let mut present = self.present_files();
        let documents = self.store.list_all().await?;
        debug!(documents = documents.len(), files = present.len(), "running sanity checks");

        for doc in &documents {
            let id = Some(doc.id);

            if doc.content.trim().is_empty() {
                messages.info(id, "Document contains no text content.");
            }
            if !doc.is_deleted() && doc.title.trim().is_empty() {
                messages.warning(id, "Document has no title.");
            }

            let Some(name) = &doc.original_filename else {
                messages.error(id, "Document has no original file recorded.");
                continue;
            };
            let path = self.originals_dir.join(name);
            present.remove(&path);

            match tokio::fs::read(&path).await {
                Ok(bytes) => {
                    let actual = format!("{:x}", Sha256::digest(&bytes));
                    if actual != doc.checksum {
                        messages.error(
                            id,
                            format!(
                                "Checksum mismatch. Stored: {}, actual: {}.",
                                doc.checksum, actual
                            ),
                        );
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    messages.error(id, format!("Original of document does not exist: {}", path.display()));
                }
                Err(e) => {
                    messages.error(id, format!("Cannot read original of document: {}", e));
                }
            }
        }

        let mut orphans: Vec<PathBuf> = present.into_iter().collect();
        orphans.sort();
        for path in orphans {
            messages.warning(None, format!("Orphaned file in originals directory: {}", path.display()));
        }

        Ok(messages)
    }
}
