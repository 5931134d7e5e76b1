//! Task entry points.
//!
//! Each function registers a task, runs its body through
//! [`TaskRunner`](crate::hooks::TaskRunner), and returns the body's result.
//! [`TaskContext`] bundles the collaborators a task needs; tests swap any of
//! them out through the `with_*` builders.

use std::sync::Arc;
use std::time::Duration;

use sqlx::SqlitePool;
use uuid::Uuid;

use crate::classifier::{DefaultPreprocessor, Preprocessor};
use crate::config::Config;
use crate::consume::IngestionPipeline;
use crate::error::{TaskError, TaskResult};
use crate::hooks::{TaskHeaders, TaskPayload, TaskRunner};
use crate::index::{FtsIndex, SearchIndex};
use crate::migrate;
use crate::models::{ConsumableDocument, ConsumeOverrides, Document};
use crate::progress::{NoProgress, ProgressReporter};
use crate::registry::TaskRegistry;
use crate::repair::{PdfRepairer, Repairer};
use crate::sanity::{self, SanityCheckEngine, StoreSanityChecker};
use crate::store::DocumentStore;
use crate::training::{ClassifierTrainer, TrainingOutcome};
use crate::trash::TrashReaper;

#[derive(Clone)]
pub struct TaskContext {
    config: Config,
    store: DocumentStore,
    registry: TaskRegistry,
    index: Arc<dyn SearchIndex>,
    progress: Arc<dyn ProgressReporter>,
    preprocessor: Arc<dyn Preprocessor>,
    repairer: Arc<dyn Repairer>,
    sanity: Arc<dyn SanityCheckEngine>,
}

impl TaskContext {
    /// Prepare directories and the database, then wire the default collaborators.
    pub async fn open(config: Config) -> TaskResult<Self> {
        let pool = migrate::init(&config).await?;
        Ok(Self::from_pool(config, pool))
    }

    pub fn from_pool(config: Config, pool: SqlitePool) -> Self {
        let store = DocumentStore::new(pool.clone());
        let sanity = StoreSanityChecker::new(store.clone(), config.paths.originals_dir.clone());
        Self {
            registry: TaskRegistry::new(pool.clone()),
            index: Arc::new(FtsIndex::new(pool)),
            progress: Arc::new(NoProgress),
            preprocessor: Arc::new(DefaultPreprocessor),
            repairer: Arc::new(PdfRepairer),
            sanity: Arc::new(sanity),
            store,
            config,
        }
    }

    pub fn with_index(mut self, index: Arc<dyn SearchIndex>) -> Self {
        self.index = index;
        self
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_preprocessor(mut self, preprocessor: Arc<dyn Preprocessor>) -> Self {
        self.preprocessor = preprocessor;
        self
    }

    pub fn with_repairer(mut self, repairer: Arc<dyn Repairer>) -> Self {
        self.repairer = repairer;
        self
    }

    pub fn with_sanity_engine(mut self, engine: Arc<dyn SanityCheckEngine>) -> Self {
        self.sanity = engine;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &DocumentStore {
        &self.store
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.registry
    }

    pub fn index(&self) -> Arc<dyn SearchIndex> {
        Arc::clone(&self.index)
    }

    pub fn pipeline(&self) -> IngestionPipeline {
        IngestionPipeline::new(
            self.config.clone(),
            self.store.clone(),
            self.registry.clone(),
            Arc::clone(&self.index),
            Arc::clone(&self.progress),
            Arc::clone(&self.preprocessor),
            Arc::clone(&self.repairer),
        )
    }

    pub fn trainer(&self) -> ClassifierTrainer {
        ClassifierTrainer::new(
            self.store.clone(),
            self.config.paths.model_file.clone(),
            Arc::clone(&self.preprocessor),
        )
    }

    pub fn reaper(&self) -> TrashReaper {
        TrashReaper::new(
            self.store.clone(),
            Arc::clone(&self.index),
            self.config.paths.originals_dir.clone(),
        )
    }

    fn runner(&self) -> TaskRunner {
        TaskRunner::new(self.registry.clone(), self.config.paths.quarantine_dir.clone())
    }
}

pub fn new_task_id() -> String {
    Uuid::new_v4().to_string()
}

fn headers(task: &str) -> TaskHeaders {
    TaskHeaders {
        id: new_task_id(),
        task: task.to_string(),
    }
}

/// Consume one file. On failure the task is marked failed and the source
/// file is quarantined under the task's display filename.
pub async fn consume_file(
    ctx: &TaskContext,
    document: ConsumableDocument,
    overrides: ConsumeOverrides,
) -> TaskResult<Document> {
    consume_file_as(ctx, &new_task_id(), document, overrides).await
}

/// [`consume_file`] with a caller-chosen task id.
pub async fn consume_file_as(
    ctx: &TaskContext,
    task_id: &str,
    document: ConsumableDocument,
    overrides: ConsumeOverrides,
) -> TaskResult<Document> {
    let headers = TaskHeaders {
        id: task_id.to_string(),
        task: "consume_file".to_string(),
    };
    let payload = TaskPayload {
        document: Some(document.clone()),
        overrides: overrides.clone(),
    };
    let pipeline = ctx.pipeline();
    ctx.runner()
        .run(headers, payload, move || async move {
            pipeline.consume(&document, &overrides).await
        })
        .await
}

/// Retry a failed consume task from its quarantined file. The task keeps
/// its id; its status moves failed → started → succeeded or failed.
pub async fn retry_failed_file(ctx: &TaskContext, task_id: &str, clean: bool) -> TaskResult<Document> {
    ctx.pipeline().retry(task_id, clean).await
}

pub async fn train_classifier(ctx: &TaskContext) -> TaskResult<TrainingOutcome> {
    let trainer = ctx.trainer();
    ctx.runner()
        .run(headers("train_classifier"), TaskPayload::default(), move || async move {
            trainer.train().await
        })
        .await
}

pub async fn sanity_check(ctx: &TaskContext) -> TaskResult<String> {
    let engine = Arc::clone(&ctx.sanity);
    ctx.runner()
        .run(headers("sanity_check"), TaskPayload::default(), move || async move {
            sanity::sanity_check(engine.as_ref()).await
        })
        .await
}

/// Permanently remove trashed documents past the grace period. `delay`
/// defaults to the configured `[trash] delay_days`.
pub async fn empty_trash(
    ctx: &TaskContext,
    ids: Option<Vec<i64>>,
    delay: Option<Duration>,
) -> TaskResult<u64> {
    let reaper = ctx.reaper();
    let delay = delay.unwrap_or_else(|| ctx.config.trash.delay());
    ctx.runner()
        .run(headers("empty_trash"), TaskPayload::default(), move || async move {
            reaper.empty(ids.as_deref(), delay).await
        })
        .await
}

pub async fn index_reindex(ctx: &TaskContext) -> TaskResult<u64> {
    let index = ctx.index();
    ctx.runner()
        .run(headers("index_reindex"), TaskPayload::default(), move || async move {
            index.reindex().await.map_err(TaskError::from)
        })
        .await
}

pub async fn index_optimize(ctx: &TaskContext) -> TaskResult<()> {
    let index = ctx.index();
    ctx.runner()
        .run(headers("index_optimize"), TaskPayload::default(), move || async move {
            index.optimize().await.map_err(TaskError::from)
        })
        .await
}

/// Re-index the given documents after a bulk metadata edit.
pub async fn bulk_update_documents(ctx: &TaskContext, ids: Vec<i64>) -> TaskResult<u64> {
    let index = ctx.index();
    ctx.runner()
        .run(headers("bulk_update_documents"), TaskPayload::default(), move || async move {
            index.update(&ids).await.map_err(TaskError::from)
        })
        .await
}
