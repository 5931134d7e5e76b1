//! Consume progress reporting.
//!
//! Every stage of the consume pipeline emits a [`ProgressEvent`] so operators
//! can follow a document through validation, extraction, classification and
//! storage. Reporting never influences outcomes: [`NoProgress`] can stand in
//! for any reporter. Progress is emitted on **stderr** so stdout remains
//! parseable for scripts.

use std::io::Write;

/// Stage of the consume pipeline.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConsumeStep {
    Validating,
    Extracting,
    CheckingDuplicates,
    Classifying,
    Storing,
}

impl ConsumeStep {
    pub const COUNT: u64 = 5;

    pub fn ordinal(&self) -> u64 {
        match self {
            ConsumeStep::Validating => 1,
            ConsumeStep::Extracting => 2,
            ConsumeStep::CheckingDuplicates => 3,
            ConsumeStep::Classifying => 4,
            ConsumeStep::Storing => 5,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            ConsumeStep::Validating => "validating",
            ConsumeStep::Extracting => "extracting",
            ConsumeStep::CheckingDuplicates => "checking duplicates",
            ConsumeStep::Classifying => "classifying",
            ConsumeStep::Storing => "storing",
        }
    }
}

/// A single progress event for one consume run.
#[derive(Clone, Debug, PartialEq)]
pub enum ProgressEvent {
    Started { filename: String },
    Working {
        filename: String,
        step: ConsumeStep,
        current: u64,
        max: u64,
    },
    Success { filename: String, document_id: i64 },
    Failed { filename: String, reason: String },
}

/// Receives progress events. Implementations must not fail the pipeline.
pub trait ProgressReporter: Send + Sync {
    fn report(&self, event: ProgressEvent);
}

/// Human-friendly progress on stderr: "consume scan.pdf  extracting  2 / 5".
pub struct StderrProgress;

impl ProgressReporter for StderrProgress {
    fn report(&self, event: ProgressEvent) {
        let line = match &event {
            ProgressEvent::Started { filename } => format!("consume {}  started\n", filename),
            ProgressEvent::Working {
                filename,
                step,
                current,
                max,
            } => format!(
                "consume {}  {}  {} / {}\n",
                filename,
                step.label(),
                current,
                max
            ),
            ProgressEvent::Success {
                filename,
                document_id,
            } => format!("consume {}  stored as document {}\n", filename, document_id),
            ProgressEvent::Failed { filename, reason } => {
                format!("consume {}  failed: {}\n", filename, reason)
            }
        };
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
        let _ = std::io::stderr().lock().flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl ProgressReporter for JsonProgress {
    fn report(&self, event: ProgressEvent) {
        let obj = match &event {
            ProgressEvent::Started { filename } => serde_json::json!({
                "event": "progress",
                "file": filename,
                "status": "started"
            }),
            ProgressEvent::Working {
                filename,
                step,
                current,
                max,
            } => serde_json::json!({
                "event": "progress",
                "file": filename,
                "status": "working",
                "step": step.label(),
                "current": current,
                "max": max
            }),
            ProgressEvent::Success {
                filename,
                document_id,
            } => serde_json::json!({
                "event": "progress",
                "file": filename,
                "status": "success",
                "document_id": document_id
            }),
            ProgressEvent::Failed { filename, reason } => serde_json::json!({
                "event": "progress",
                "file": filename,
                "status": "failed",
                "reason": reason
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let _ = writeln!(std::io::stderr().lock(), "{}", line);
            let _ = std::io::stderr().lock().flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn report(&self, _event: ProgressEvent) {}
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "off" => Some(ProgressMode::Off),
            "human" => Some(ProgressMode::Human),
            "json" => Some(ProgressMode::Json),
            _ => None,
        }
    }

    pub fn reporter(&self) -> Box<dyn ProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}
