//! Core data models used throughout Docket.
//!
//! These types represent the documents, matching rules, and tasks that flow
//! through the ingestion pipeline and the maintenance tasks.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::anyhow;
use serde::{Deserialize, Serialize};

/// Where a consumable document came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentSource {
    ConsumeFolder,
    ApiUpload,
    MailFetch,
}

impl DocumentSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentSource::ConsumeFolder => "consume_folder",
            DocumentSource::ApiUpload => "api_upload",
            DocumentSource::MailFetch => "mail_fetch",
        }
    }
}

impl FromStr for DocumentSource {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "consume_folder" | "consume-folder" => Ok(DocumentSource::ConsumeFolder),
            "api_upload" | "api-upload" => Ok(DocumentSource::ApiUpload),
            "mail_fetch" | "mail-fetch" => Ok(DocumentSource::MailFetch),
            other => Err(anyhow!("unknown document source: '{}'", other)),
        }
    }
}

/// An ingestion candidate: the payload carried by a consume task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumableDocument {
    pub source: DocumentSource,
    pub original_file: PathBuf,
}

impl ConsumableDocument {
    pub fn new(source: DocumentSource, original_file: impl Into<PathBuf>) -> Self {
        Self {
            source,
            original_file: original_file.into(),
        }
    }
}

/// Caller-supplied metadata that wins over classifier suggestions.
#[derive(Debug, Clone, Default)]
pub struct ConsumeOverrides {
    pub title: Option<String>,
    pub correspondent_id: Option<i64>,
    pub document_type_id: Option<i64>,
    pub tag_ids: Vec<i64>,
}

/// A stored document. `deleted_at` is set while the document sits in the trash.
#[derive(Debug, Clone)]
pub struct Document {
    pub id: i64,
    pub title: String,
    pub content: String,
    pub checksum: String,
    pub mime_type: String,
    pub original_filename: Option<String>,
    pub correspondent_id: Option<i64>,
    pub document_type_id: Option<i64>,
    pub tag_ids: Vec<i64>,
    pub added: i64,
    pub created: i64,
    pub modified: i64,
    pub deleted_at: Option<i64>,
}

impl Document {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

/// Fields needed to insert a new document row.
#[derive(Debug, Clone, Default)]
pub struct NewDocument {
    pub title: String,
    pub content: String,
    pub checksum: String,
    pub mime_type: String,
    pub original_filename: Option<String>,
    pub correspondent_id: Option<i64>,
    pub document_type_id: Option<i64>,
    pub tag_ids: Vec<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchingAlgorithm {
    None,
    Any,
    All,
    Literal,
    Regex,
    Fuzzy,
    /// Assignment is inferred by the trained classifier.
    Auto,
}

impl MatchingAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchingAlgorithm::None => "none",
            MatchingAlgorithm::Any => "any",
            MatchingAlgorithm::All => "all",
            MatchingAlgorithm::Literal => "literal",
            MatchingAlgorithm::Regex => "regex",
            MatchingAlgorithm::Fuzzy => "fuzzy",
            MatchingAlgorithm::Auto => "auto",
        }
    }
}

impl FromStr for MatchingAlgorithm {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(MatchingAlgorithm::None),
            "any" => Ok(MatchingAlgorithm::Any),
            "all" => Ok(MatchingAlgorithm::All),
            "literal" => Ok(MatchingAlgorithm::Literal),
            "regex" => Ok(MatchingAlgorithm::Regex),
            "fuzzy" => Ok(MatchingAlgorithm::Fuzzy),
            "auto" => Ok(MatchingAlgorithm::Auto),
            other => Err(anyhow!("unknown matching algorithm: '{}'", other)),
        }
    }
}

/// The three kinds of matching rule a document can be associated with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuleKind {
    Tag,
    Correspondent,
    DocumentType,
}

impl RuleKind {
    pub const ALL: [RuleKind; 3] = [
        RuleKind::Tag,
        RuleKind::Correspondent,
        RuleKind::DocumentType,
    ];

    pub fn table(&self) -> &'static str {
        match self {
            RuleKind::Tag => "tags",
            RuleKind::Correspondent => "correspondents",
            RuleKind::DocumentType => "document_types",
        }
    }
}

#[derive(Debug, Clone)]
pub struct MatchingRule {
    pub id: i64,
    pub kind: RuleKind,
    pub name: String,
    pub matching_algorithm: MatchingAlgorithm,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Started,
    Succeeded,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Started => "started",
            TaskStatus::Succeeded => "succeeded",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Succeeded | TaskStatus::Failed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(TaskStatus::Queued),
            "started" => Ok(TaskStatus::Started),
            "succeeded" => Ok(TaskStatus::Succeeded),
            "failed" => Ok(TaskStatus::Failed),
            other => Err(anyhow!("unknown task status: '{}'", other)),
        }
    }
}

/// Persisted task metadata.
#[derive(Debug, Clone, Serialize)]
pub struct Task {
    pub task_id: String,
    pub task_name: String,
    /// Display filename; also the file's name inside the quarantine directory.
    pub task_file_name: Option<String>,
    pub original_file: Option<PathBuf>,
    pub source: Option<DocumentSource>,
    pub status: TaskStatus,
    pub result: Option<String>,
    pub date_created: i64,
    pub date_started: Option<i64>,
    pub date_done: Option<i64>,
}

/// Derive the display filename for a task's source file.
///
/// Prefixing the task id keeps quarantined files unique and traceable to
/// their task record even when two failures share an original name.
pub fn task_file_name_for(task_id: &str, original_file: &Path) -> String {
    let name = original_file
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "document".to_string());
    format!("{}_{}", task_id, name)
}
