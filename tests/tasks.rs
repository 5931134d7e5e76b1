//! Integration tests for the task entry points.
//!
//! Each test builds a fresh data directory with `Config::with_data_dir`,
//! opens a `TaskContext` over it, and drives tasks through the public API.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tracing_test::traced_test;

use docket::classifier::{DefaultPreprocessor, Preprocessor};
use docket::config::Config;
use docket::error::{TaskError, TaskResult};
use docket::index::SearchIndex;
use docket::models::{
    ConsumableDocument, ConsumeOverrides, DocumentSource, MatchingAlgorithm, NewDocument, RuleKind,
    TaskStatus,
};
use docket::progress::{ConsumeStep, ProgressEvent, ProgressReporter};
use docket::repair::NoRepair;
use docket::sanity::{SanityCheckEngine, SanityCheckMessages};
use docket::store::View;
use docket::tasks::{self, TaskContext};
use docket::training::TrainingOutcome;

const DAY: i64 = 24 * 60 * 60;

async fn setup() -> (TempDir, TaskContext) {
    let tmp = TempDir::new().unwrap();
    let config = Config::with_data_dir(tmp.path());
    let ctx = TaskContext::open(config).await.unwrap();
    (tmp, ctx)
}

fn inbox_file(tmp: &TempDir, name: &str, bytes: &[u8]) -> PathBuf {
    let dir = tmp.path().join("inbox");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    std::fs::write(&path, bytes).unwrap();
    path
}

fn from_folder(path: &Path) -> ConsumableDocument {
    ConsumableDocument::new(DocumentSource::ConsumeFolder, path)
}

async fn insert_doc(ctx: &TaskContext, checksum: &str, content: &str) -> i64 {
    let doc = NewDocument {
        title: "test".to_string(),
        content: content.to_string(),
        checksum: checksum.to_string(),
        mime_type: "text/plain".to_string(),
        ..Default::default()
    };
    ctx.store().insert(&doc).await.unwrap().id
}

/// Minimal PDF with a correct xref table and stream length.
fn minimal_pdf(phrase: &str) -> Vec<u8> {
    let stream = format!("BT /F1 12 Tf 100 700 Td ({}) Tj ET", phrase);
    let mut out = Vec::new();
    out.extend_from_slice(b"%PDF-1.4\n");
    let o1 = out.len();
    out.extend_from_slice(b"1 0 obj << /Type /Catalog /Pages 2 0 R >> endobj\n");
    let o2 = out.len();
    out.extend_from_slice(b"2 0 obj << /Type /Pages /Kids [3 0 R] /Count 1 >> endobj\n");
    let o3 = out.len();
    out.extend_from_slice(b"3 0 obj << /Type /Page /Parent 2 0 R /MediaBox [0 0 612 792] /Contents 4 0 R /Resources << /Font << /F1 5 0 R >> >> >> endobj\n");
    let o4 = out.len();
    out.extend_from_slice(format!("4 0 obj << /Length {} >> stream\n", stream.len()).as_bytes());
    out.extend_from_slice(stream.as_bytes());
    out.extend_from_slice(b"\nendstream endobj\n");
    let o5 = out.len();
    out.extend_from_slice(
        b"5 0 obj << /Type /Font /Subtype /Type1 /BaseFont /Helvetica >> endobj\n",
    );
    let xref_start = out.len();
    out.extend_from_slice(b"xref\n0 6\n");
    out.extend_from_slice(format!("{:010} 65535 f \n", 0).as_bytes());
    for offset in [o1, o2, o3, o4, o5] {
        out.extend_from_slice(format!("{:010} 00000 n \n", offset).as_bytes());
    }
    out.extend_from_slice(b"trailer << /Size 6 /Root 1 0 R >>\nstartxref\n");
    out.extend_from_slice(format!("{}\n", xref_start).as_bytes());
    out.extend_from_slice(b"%%EOF\n");
    out
}

/// The same PDF cut off before its `%%EOF` marker.
fn truncated_pdf(phrase: &str) -> Vec<u8> {
    let mut bytes = minimal_pdf(phrase);
    bytes.truncate(bytes.len() - b"%%EOF\n".len());
    bytes
}

fn mtime(path: &Path) -> std::time::SystemTime {
    std::fs::metadata(path).unwrap().modified().unwrap()
}

// ============ Index maintenance ============

#[tokio::test]
async fn index_reindex_and_optimize() {
    let (_tmp, ctx) = setup().await;
    insert_doc(&ctx, "c1", "quarterly electricity invoice").await;
    let trashed = insert_doc(&ctx, "c2", "electricity archive").await;
    ctx.store().soft_delete(trashed).await.unwrap();

    assert_eq!(tasks::index_reindex(&ctx).await.unwrap(), 1);
    tasks::index_optimize(&ctx).await.unwrap();

    let hits = ctx.index().search("electricity", 10).await.unwrap();
    assert_eq!(hits.len(), 1);
    assert_ne!(hits[0], trashed);
}

#[tokio::test]
async fn bulk_update_reindexes_given_documents() {
    let (_tmp, ctx) = setup().await;
    let id = insert_doc(&ctx, "c1", "my document").await;
    assert!(ctx.index().search("document", 10).await.unwrap().is_empty());

    assert_eq!(tasks::bulk_update_documents(&ctx, vec![id]).await.unwrap(), 1);
    assert_eq!(ctx.index().search("document", 10).await.unwrap(), vec![id]);

    ctx.store().update_content(id, "rewritten text").await.unwrap();
    tasks::bulk_update_documents(&ctx, vec![id]).await.unwrap();
    assert!(ctx.index().search("document", 10).await.unwrap().is_empty());
    assert_eq!(ctx.index().search("rewritten", 10).await.unwrap(), vec![id]);
}

// ============ Classifier training ============

#[tokio::test]
async fn train_without_auto_rules_writes_nothing() {
    let (_tmp, ctx) = setup().await;
    insert_doc(&ctx, "c1", "some content").await;
    ctx.store()
        .create_rule(RuleKind::Tag, "manual", MatchingAlgorithm::Any)
        .await
        .unwrap();

    let outcome = tasks::train_classifier(&ctx).await.unwrap();
    assert_eq!(outcome, TrainingOutcome::SkippedNoAutoRules);
    assert!(!ctx.config().paths.model_file.exists());
}

#[tokio::test]
async fn train_auto_rules_without_documents_writes_nothing() {
    for kind in RuleKind::ALL {
        let (_tmp, ctx) = setup().await;
        ctx.store()
            .create_rule(kind, "auto", MatchingAlgorithm::Auto)
            .await
            .unwrap();

        let outcome = tasks::train_classifier(&ctx).await.unwrap();
        assert_eq!(outcome, TrainingOutcome::SkippedNoTrainingData);
        assert!(!ctx.config().paths.model_file.exists());
    }
}

#[tokio::test]
async fn train_only_when_fingerprint_changes() {
    let (_tmp, ctx) = setup().await;
    let rule = ctx
        .store()
        .create_rule(RuleKind::Correspondent, "utility", MatchingAlgorithm::Auto)
        .await
        .unwrap();
    let doc = NewDocument {
        title: "test".to_string(),
        content: "test".to_string(),
        checksum: "wow1".to_string(),
        mime_type: "text/plain".to_string(),
        correspondent_id: Some(rule.id),
        ..Default::default()
    };
    let id = ctx.store().insert(&doc).await.unwrap().id;
    let model_file = ctx.config().paths.model_file.clone();

    assert_eq!(
        tasks::train_classifier(&ctx).await.unwrap(),
        TrainingOutcome::Trained { documents: 1 }
    );
    let first = mtime(&model_file);

    assert_eq!(
        tasks::train_classifier(&ctx).await.unwrap(),
        TrainingOutcome::SkippedUnchanged
    );
    assert_eq!(mtime(&model_file), first);

    // Coarse filesystem timestamps need a visible gap
    tokio::time::sleep(Duration::from_millis(1100)).await;
    ctx.store().update_content(id, "test2").await.unwrap();

    assert_eq!(
        tasks::train_classifier(&ctx).await.unwrap(),
        TrainingOutcome::Trained { documents: 1 }
    );
    assert_ne!(mtime(&model_file), first);
}

#[tokio::test]
async fn trained_model_assigns_correspondent_on_consume() {
    let (tmp, ctx) = setup().await;
    let utility = ctx
        .store()
        .create_rule(RuleKind::Correspondent, "utility", MatchingAlgorithm::Auto)
        .await
        .unwrap();
    let dentist = ctx
        .store()
        .create_rule(RuleKind::Correspondent, "dentist", MatchingAlgorithm::Auto)
        .await
        .unwrap();
    for (checksum, content, correspondent) in [
        ("a", "electricity bill kilowatt meter reading", utility.id),
        ("b", "dental checkup tooth cleaning appointment", dentist.id),
    ] {
        let doc = NewDocument {
            title: checksum.to_string(),
            content: content.to_string(),
            checksum: checksum.to_string(),
            mime_type: "text/plain".to_string(),
            correspondent_id: Some(correspondent),
            ..Default::default()
        };
        ctx.store().insert(&doc).await.unwrap();
    }
    tasks::train_classifier(&ctx).await.unwrap();

    let path = inbox_file(&tmp, "bill.txt", b"Your electricity meter reading in kilowatt hours");
    let doc = tasks::consume_file(&ctx, from_folder(&path), ConsumeOverrides::default())
        .await
        .unwrap();
    assert_eq!(doc.correspondent_id, Some(utility.id));
    assert_eq!(doc.title, "bill");
}

/// One auto tag and one auto correspondent, both learned from a single
/// utility bill.
async fn train_on_utility_bill(ctx: &TaskContext) -> (i64, i64) {
    let tag = ctx
        .store()
        .create_rule(RuleKind::Tag, "energy", MatchingAlgorithm::Auto)
        .await
        .unwrap();
    let utility = ctx
        .store()
        .create_rule(RuleKind::Correspondent, "utility", MatchingAlgorithm::Auto)
        .await
        .unwrap();
    let doc = NewDocument {
        title: "seed".to_string(),
        content: "electricity bill kilowatt meter reading".to_string(),
        checksum: "seed".to_string(),
        mime_type: "text/plain".to_string(),
        correspondent_id: Some(utility.id),
        tag_ids: vec![tag.id],
        ..Default::default()
    };
    ctx.store().insert(&doc).await.unwrap();
    assert_eq!(
        tasks::train_classifier(ctx).await.unwrap(),
        TrainingOutcome::Trained { documents: 1 }
    );
    (tag.id, utility.id)
}

#[tokio::test]
async fn stale_model_ignores_rules_no_longer_auto() {
    let (tmp, ctx) = setup().await;
    let (tag, utility) = train_on_utility_bill(&ctx).await;

    let path = inbox_file(&tmp, "first.txt", b"Electricity meter reading in kilowatt");
    let doc = tasks::consume_file(&ctx, from_folder(&path), ConsumeOverrides::default())
        .await
        .unwrap();
    assert_eq!(doc.tag_ids, vec![tag]);
    assert_eq!(doc.correspondent_id, Some(utility));

    for (kind, id) in [(RuleKind::Tag, tag), (RuleKind::Correspondent, utility)] {
        assert!(ctx
            .store()
            .set_matching_algorithm(kind, id, MatchingAlgorithm::None)
            .await
            .unwrap());
    }
    assert_eq!(
        tasks::train_classifier(&ctx).await.unwrap(),
        TrainingOutcome::SkippedNoAutoRules
    );
    assert!(ctx.config().paths.model_file.exists());

    let path = inbox_file(&tmp, "second.txt", b"Electricity meter reading in kilowatt, second notice");
    let doc = tasks::consume_file(&ctx, from_folder(&path), ConsumeOverrides::default())
        .await
        .unwrap();
    assert!(doc.tag_ids.is_empty());
    assert_eq!(doc.correspondent_id, None);
}

#[tokio::test]
async fn stale_model_ignores_deleted_rules() {
    let (tmp, ctx) = setup().await;
    let (tag, utility) = train_on_utility_bill(&ctx).await;

    assert!(ctx.store().delete_rule(RuleKind::Tag, tag).await.unwrap());
    assert!(ctx
        .store()
        .delete_rule(RuleKind::Correspondent, utility)
        .await
        .unwrap());

    let path = inbox_file(&tmp, "bill.txt", b"Electricity meter reading in kilowatt");
    let doc = tasks::consume_file(&ctx, from_folder(&path), ConsumeOverrides::default())
        .await
        .unwrap();
    assert!(doc.tag_ids.is_empty());
    assert_eq!(doc.correspondent_id, None);
    assert!(!path.exists());
}

// ============ Consume ============

#[tokio::test]
async fn consume_stores_original_and_removes_source() {
    let (tmp, ctx) = setup().await;
    let path = inbox_file(&tmp, "note.txt", b"a plain text note");

    let doc = tasks::consume_file(&ctx, from_folder(&path), ConsumeOverrides::default())
        .await
        .unwrap();

    let stored = format!("{:07}.txt", doc.id);
    assert_eq!(doc.original_filename.as_deref(), Some(stored.as_str()));
    assert!(ctx.config().paths.originals_dir.join(&stored).exists());
    assert!(!path.exists());
    assert_eq!(doc.content, "a plain text note");
    assert_eq!(ctx.index().search("plain", 10).await.unwrap(), vec![doc.id]);

    let recent = ctx.registry().list(10).await.unwrap();
    assert_eq!(recent[0].status, TaskStatus::Succeeded);
}

#[tokio::test]
async fn duplicate_consume_fails_and_quarantines() {
    let (tmp, ctx) = setup().await;
    let first = inbox_file(&tmp, "a.txt", b"same bytes");
    tasks::consume_file(&ctx, from_folder(&first), ConsumeOverrides::default())
        .await
        .unwrap();

    let second = inbox_file(&tmp, "b.txt", b"same bytes");
    let err = tasks::consume_file_as(&ctx, "dup-1", from_folder(&second), ConsumeOverrides::default())
        .await
        .unwrap_err();
    assert!(matches!(err, TaskError::Ingestion { .. }));
    assert!(err.to_string().contains("duplicate"));

    assert!(ctx.config().paths.quarantine_dir.join("dup-1_b.txt").exists());
    let task = ctx.registry().find("dup-1").await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
}

// ============ Retry ============

#[tokio::test]
async fn failed_consume_is_quarantined_under_task_file_name() {
    let (tmp, ctx) = setup().await;
    let path = inbox_file(&tmp, "scan.pdf", &truncated_pdf("broken scan"));

    let err = tasks::consume_file_as(&ctx, "t-1", from_folder(&path), ConsumeOverrides::default())
        .await
        .unwrap_err();
    assert!(matches!(err, TaskError::Ingestion { .. }));

    let task = ctx.registry().find("t-1").await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    let name = task.task_file_name.unwrap();
    assert_eq!(name, "t-1_scan.pdf");
    assert!(ctx.config().paths.quarantine_dir.join(&name).exists());
    assert!(!path.exists());
}

#[tokio::test]
#[traced_test]
async fn retry_with_clean_repairs_and_succeeds() {
    let (tmp, ctx) = setup().await;
    let path = inbox_file(&tmp, "scan.pdf", &truncated_pdf("invoice payment due"));
    tasks::consume_file_as(&ctx, "t-clean", from_folder(&path), ConsumeOverrides::default())
        .await
        .unwrap_err();
    let quarantined = ctx.config().paths.quarantine_dir.join("t-clean_scan.pdf");
    assert!(quarantined.exists());

    let doc = tasks::retry_failed_file(&ctx, "t-clean", true).await.unwrap();

    assert!(logs_contain("PDF cleaned successfully"));
    assert_eq!(doc.title, "scan");
    assert_eq!(doc.mime_type, "application/pdf");
    assert!(!quarantined.exists());
    let task = ctx.registry().find("t-clean").await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Succeeded);
}

#[tokio::test]
async fn retry_without_clean_keeps_quarantined_file() {
    let (tmp, ctx) = setup().await;
    let path = inbox_file(&tmp, "scan.pdf", &truncated_pdf("still broken"));
    tasks::consume_file_as(&ctx, "t-2", from_folder(&path), ConsumeOverrides::default())
        .await
        .unwrap_err();

    let err = tasks::retry_failed_file(&ctx, "t-2", false).await.unwrap_err();
    assert!(matches!(err, TaskError::Ingestion { .. }));

    let paths = &ctx.config().paths;
    assert!(paths.quarantine_dir.join("t-2_scan.pdf").exists());
    assert!(!paths.scratch_dir.join("t-2_scan.pdf").exists());
    let task = ctx.registry().find("t-2").await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
}

#[tokio::test]
async fn retry_of_unknown_or_unfailed_task_is_rejected() {
    let (tmp, ctx) = setup().await;
    assert!(matches!(
        tasks::retry_failed_file(&ctx, "nope", false).await,
        Err(TaskError::UnknownTask(_))
    ));

    let path = inbox_file(&tmp, "ok.txt", b"fine");
    tasks::consume_file_as(&ctx, "t-ok", from_folder(&path), ConsumeOverrides::default())
        .await
        .unwrap();
    assert!(matches!(
        tasks::retry_failed_file(&ctx, "t-ok", false).await,
        Err(TaskError::UnknownTask(_))
    ));
}

#[tokio::test]
async fn retry_without_quarantined_file_fails() {
    let (tmp, ctx) = setup().await;
    let path = inbox_file(&tmp, "scan.pdf", &truncated_pdf("gone"));
    tasks::consume_file_as(&ctx, "t-3", from_folder(&path), ConsumeOverrides::default())
        .await
        .unwrap_err();
    std::fs::remove_file(ctx.config().paths.quarantine_dir.join("t-3_scan.pdf")).unwrap();

    let err = tasks::retry_failed_file(&ctx, "t-3", true).await.unwrap_err();
    assert!(matches!(err, TaskError::Ingestion { .. }));
}

// ============ Sanity ============

#[tokio::test]
async fn sanity_of_consistent_store_reports_no_issues() {
    let (tmp, ctx) = setup().await;
    let path = inbox_file(&tmp, "note.txt", b"consistent");
    tasks::consume_file(&ctx, from_folder(&path), ConsumeOverrides::default())
        .await
        .unwrap();

    assert_eq!(tasks::sanity_check(&ctx).await.unwrap(), "No issues detected.");
}

#[tokio::test]
async fn sanity_warns_about_orphaned_files() {
    let (_tmp, ctx) = setup().await;
    std::fs::write(ctx.config().paths.originals_dir.join("stray.pdf"), b"x").unwrap();

    assert_eq!(
        tasks::sanity_check(&ctx).await.unwrap(),
        "Sanity check exited with warnings. See log."
    );
}

#[tokio::test]
async fn sanity_fails_on_missing_original() {
    let (tmp, ctx) = setup().await;
    let path = inbox_file(&tmp, "note.txt", b"soon missing");
    let doc = tasks::consume_file(&ctx, from_folder(&path), ConsumeOverrides::default())
        .await
        .unwrap();
    let original = ctx
        .config()
        .paths
        .originals_dir
        .join(doc.original_filename.unwrap());
    std::fs::remove_file(original).unwrap();

    match tasks::sanity_check(&ctx).await {
        Err(TaskError::SanityCheckFailed(messages)) => assert_eq!(messages.error_count(), 1),
        other => panic!("expected sanity failure, got {:?}", other),
    }
}

// ============ Trash ============

#[tokio::test]
async fn empty_trash_respects_grace_period() {
    let (tmp, ctx) = setup().await;
    let old = inbox_file(&tmp, "old.txt", b"old document");
    let old = tasks::consume_file(&ctx, from_folder(&old), ConsumeOverrides::default())
        .await
        .unwrap();
    let recent = insert_doc(&ctx, "recent", "recent document").await;

    let now = chrono::Utc::now().timestamp();
    ctx.store()
        .set_deleted_at(old.id, Some(now - 30 * DAY - 1))
        .await
        .unwrap();
    ctx.store()
        .set_deleted_at(recent, Some(now - 29 * DAY))
        .await
        .unwrap();

    assert_eq!(tasks::empty_trash(&ctx, None, None).await.unwrap(), 1);
    assert!(ctx.store().get(old.id, View::All).await.unwrap().is_none());
    assert!(ctx.store().get(recent, View::All).await.unwrap().is_some());
    let original = ctx
        .config()
        .paths
        .originals_dir
        .join(old.original_filename.unwrap());
    assert!(!original.exists());

    assert_eq!(tasks::empty_trash(&ctx, None, None).await.unwrap(), 0);
}

#[tokio::test]
async fn empty_trash_limited_to_ids() {
    let (_tmp, ctx) = setup().await;
    let a = insert_doc(&ctx, "a", "first").await;
    let b = insert_doc(&ctx, "b", "second").await;
    let long_ago = chrono::Utc::now().timestamp() - 60 * DAY;
    ctx.store().set_deleted_at(a, Some(long_ago)).await.unwrap();
    ctx.store().set_deleted_at(b, Some(long_ago)).await.unwrap();

    assert_eq!(tasks::empty_trash(&ctx, Some(vec![b]), None).await.unwrap(), 1);
    assert!(ctx.store().get(a, View::All).await.unwrap().is_some());
    assert!(ctx.store().get(b, View::All).await.unwrap().is_none());
}

#[tokio::test]
async fn empty_trash_with_unbounded_delay_keeps_everything() {
    let (_tmp, ctx) = setup().await;
    let fresh = insert_doc(&ctx, "fresh", "just trashed").await;
    let ancient = insert_doc(&ctx, "ancient", "trashed at the epoch").await;
    let now = chrono::Utc::now().timestamp();
    ctx.store().set_deleted_at(fresh, Some(now)).await.unwrap();
    ctx.store().set_deleted_at(ancient, Some(0)).await.unwrap();

    for delay in [Duration::MAX, Duration::from_secs(u64::MAX), Duration::from_secs(i64::MAX as u64)] {
        assert_eq!(tasks::empty_trash(&ctx, None, Some(delay)).await.unwrap(), 0);
    }
    assert!(ctx.store().get(fresh, View::All).await.unwrap().is_some());
    assert!(ctx.store().get(ancient, View::All).await.unwrap().is_some());
}

#[tokio::test]
async fn trash_and_restore_follow_the_index() {
    let (tmp, ctx) = setup().await;
    let path = inbox_file(&tmp, "memo.txt", b"budget memo");
    let doc = tasks::consume_file(&ctx, from_folder(&path), ConsumeOverrides::default())
        .await
        .unwrap();
    let reaper = ctx.reaper();

    reaper.trash(doc.id).await.unwrap();
    assert!(ctx.index().search("budget", 10).await.unwrap().is_empty());
    assert_eq!(ctx.store().count(View::Live).await.unwrap(), 0);

    // Freshly trashed documents are inside the grace period
    assert_eq!(tasks::empty_trash(&ctx, None, None).await.unwrap(), 0);

    reaper.restore(doc.id).await.unwrap();
    assert_eq!(ctx.index().search("budget", 10).await.unwrap(), vec![doc.id]);
}

// ============ Collaborators ============

struct Recorder(Mutex<Vec<ProgressEvent>>);

impl ProgressReporter for Recorder {
    fn report(&self, event: ProgressEvent) {
        self.0.lock().unwrap().push(event);
    }
}

#[tokio::test]
async fn consume_reports_every_stage_in_order() {
    let (tmp, ctx) = setup().await;
    let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
    let ctx = ctx.with_progress(recorder.clone());
    let path = inbox_file(&tmp, "report.txt", b"progress please");

    let doc = tasks::consume_file(&ctx, from_folder(&path), ConsumeOverrides::default())
        .await
        .unwrap();

    let events = recorder.0.lock().unwrap().clone();
    assert_eq!(events.len(), 7);
    assert!(matches!(events[0], ProgressEvent::Started { .. }));
    let steps: Vec<u64> = events
        .iter()
        .filter_map(|e| match e {
            ProgressEvent::Working { current, max, .. } => {
                assert_eq!(*max, ConsumeStep::COUNT);
                Some(*current)
            }
            _ => None,
        })
        .collect();
    assert_eq!(steps, vec![1, 2, 3, 4, 5]);
    assert_eq!(
        events[6],
        ProgressEvent::Success {
            filename: "report.txt".to_string(),
            document_id: doc.id,
        }
    );
}

#[tokio::test]
async fn failed_consume_reports_failure() {
    let (tmp, ctx) = setup().await;
    let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
    let ctx = ctx.with_progress(recorder.clone());
    let path = inbox_file(&tmp, "empty.txt", b"");

    tasks::consume_file(&ctx, from_folder(&path), ConsumeOverrides::default())
        .await
        .unwrap_err();

    let events = recorder.0.lock().unwrap().clone();
    assert!(matches!(events.last(), Some(ProgressEvent::Failed { .. })));
}

#[tokio::test]
async fn overrides_win_over_defaults() {
    let (tmp, ctx) = setup().await;
    let tag = ctx
        .store()
        .create_rule(RuleKind::Tag, "inbox", MatchingAlgorithm::None)
        .await
        .unwrap();
    let path = inbox_file(&tmp, "x.md", b"# heading");
    let overrides = ConsumeOverrides {
        title: Some("Custom title".to_string()),
        tag_ids: vec![tag.id],
        ..Default::default()
    };

    let doc = tasks::consume_file(
        &ctx,
        ConsumableDocument::new(DocumentSource::ApiUpload, &path),
        overrides,
    )
    .await
    .unwrap();
    assert_eq!(doc.title, "Custom title");
    assert_eq!(doc.tag_ids, vec![tag.id]);
    // Only consume-folder sources are removed
    assert!(path.exists());
}

struct Fixed(SanityCheckMessages);

#[async_trait]
impl SanityCheckEngine for Fixed {
    async fn check(&self) -> TaskResult<SanityCheckMessages> {
        Ok(self.0.clone())
    }
}

#[tokio::test]
async fn sanity_task_uses_configured_engine() {
    let (_tmp, ctx) = setup().await;
    let mut messages = SanityCheckMessages::new();
    messages.info(None, "Some info");
    let ctx = ctx.with_sanity_engine(Arc::new(Fixed(messages)));

    assert_eq!(
        tasks::sanity_check(&ctx).await.unwrap(),
        "Sanity check exited with infos. See log."
    );
}

#[tokio::test]
async fn retry_with_noop_repairer_still_fails() {
    let (tmp, ctx) = setup().await;
    let ctx = ctx.with_repairer(Arc::new(NoRepair));
    let path = inbox_file(&tmp, "scan.pdf", &truncated_pdf("unrepaired"));
    tasks::consume_file_as(&ctx, "t-noop", from_folder(&path), ConsumeOverrides::default())
        .await
        .unwrap_err();

    let err = tasks::retry_failed_file(&ctx, "t-noop", true).await.unwrap_err();
    assert!(matches!(err, TaskError::Ingestion { .. }));
    assert!(ctx.config().paths.quarantine_dir.join("t-noop_scan.pdf").exists());
}

/// An index that accepts removals but refuses to index anything.
struct BrokenIndex;

#[async_trait]
impl SearchIndex for BrokenIndex {
    async fn reindex(&self) -> anyhow::Result<u64> {
        anyhow::bail!("index unavailable")
    }

    async fn optimize(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn update(&self, _ids: &[i64]) -> anyhow::Result<u64> {
        anyhow::bail!("index unavailable")
    }

    async fn remove(&self, _id: i64) -> anyhow::Result<()> {
        Ok(())
    }

    async fn search(&self, _query: &str, _limit: i64) -> anyhow::Result<Vec<i64>> {
        Ok(Vec::new())
    }
}

#[tokio::test]
async fn index_failure_rolls_back_and_retry_recovers() {
    let (tmp, ctx) = setup().await;
    let broken = ctx.clone().with_index(Arc::new(BrokenIndex));
    let path = inbox_file(&tmp, "note.txt", b"indexed on the second try");

    tasks::consume_file_as(&broken, "t-idx", from_folder(&path), ConsumeOverrides::default())
        .await
        .unwrap_err();
    assert_eq!(ctx.store().count(View::All).await.unwrap(), 0);
    let originals = std::fs::read_dir(&ctx.config().paths.originals_dir).unwrap();
    assert_eq!(originals.count(), 0);
    let quarantined = ctx.config().paths.quarantine_dir.join("t-idx_note.txt");
    assert!(quarantined.exists());

    let doc = tasks::retry_failed_file(&ctx, "t-idx", false).await.unwrap();
    assert_eq!(doc.title, "note");
    assert!(!quarantined.exists());
    assert_eq!(ctx.index().search("second", 10).await.unwrap(), vec![doc.id]);
    let task = ctx.registry().find("t-idx").await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Succeeded);
}

#[tokio::test]
async fn concurrent_retries_of_one_task_leave_no_scratch_copy() {
    let (tmp, ctx) = setup().await;
    let broken = ctx.clone().with_index(Arc::new(BrokenIndex));
    let path = inbox_file(&tmp, "memo.txt", b"retried twice at once");
    tasks::consume_file_as(&broken, "t-race", from_folder(&path), ConsumeOverrides::default())
        .await
        .unwrap_err();

    let (first, second) = tokio::join!(
        tasks::retry_failed_file(&ctx, "t-race", false),
        tasks::retry_failed_file(&ctx, "t-race", false),
    );
    assert_eq!([first.is_ok(), second.is_ok()].iter().filter(|ok| **ok).count(), 1);
    assert_eq!(ctx.store().count(View::All).await.unwrap(), 1);

    let scratch = std::fs::read_dir(&ctx.config().paths.scratch_dir).unwrap();
    assert_eq!(scratch.count(), 0);
}

struct Counting(AtomicUsize);

impl Preprocessor for Counting {
    fn preprocess(&self, content: &str) -> String {
        self.0.fetch_add(1, Ordering::SeqCst);
        DefaultPreprocessor.preprocess(content)
    }
}

#[tokio::test]
async fn training_runs_content_through_preprocessor() {
    let (_tmp, ctx) = setup().await;
    let counting = Arc::new(Counting(AtomicUsize::new(0)));
    let ctx = ctx.with_preprocessor(counting.clone());
    ctx.store()
        .create_rule(RuleKind::DocumentType, "invoice", MatchingAlgorithm::Auto)
        .await
        .unwrap();
    insert_doc(&ctx, "a", "first").await;
    insert_doc(&ctx, "b", "second").await;

    tasks::train_classifier(&ctx).await.unwrap();
    assert_eq!(counting.0.load(Ordering::SeqCst), 2);
}
