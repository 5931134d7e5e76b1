//! Conditional classifier (re)training.
//!
//! Training runs only when something it would learn from changed:
//!
//! 1. No auto-matching tag, correspondent, or document type: skip, and do
//!    not touch the model file at all.
//! 2. The stored artifact's fingerprint equals the current corpus
//!    fingerprint: skip; the artifact keeps its modification time.
//! 3. Otherwise fit a new model and atomically replace the artifact.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, info};

use crate::classifier::{ClassifierModel, Preprocessor, TrainingSample};
use crate::error::TaskResult;
use crate::fingerprint::FingerprintStore;
use crate::store::DocumentStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrainingOutcome {
    SkippedNoAutoRules,
    SkippedNoTrainingData,
    SkippedUnchanged,
    Trained { documents: usize },
}

impl fmt::Display for TrainingOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrainingOutcome::SkippedNoAutoRules => {
                f.write_str("No automatic matching items, not training.")
            }
            TrainingOutcome::SkippedNoTrainingData => {
                f.write_str("No documents to train on, not training.")
            }
            TrainingOutcome::SkippedUnchanged => {
                f.write_str("Training data unchanged since last training, not training.")
            }
            TrainingOutcome::Trained { documents } => {
                write!(f, "Classifier trained on {} document(s).", documents)
            }
        }
    }
}

pub struct ClassifierTrainer {
    store: DocumentStore,
    model_file: PathBuf,
    preprocessor: Arc<dyn Preprocessor>,
}

impl ClassifierTrainer {
    pub fn new(store: DocumentStore, model_file: PathBuf, preprocessor: Arc<dyn Preprocessor>) -> Self {
        Self {
            store,
            model_file,
            preprocessor,
        }
    }

    pub async fn train(&self) -> TaskResult<TrainingOutcome> {
        let fingerprints = FingerprintStore::new(self.store.clone());
        let snapshot = fingerprints.snapshot().await?;

        if snapshot.rules.is_empty() {
            debug!("no automatic matching rules, skipping classifier training");
            return Ok(TrainingOutcome::SkippedNoAutoRules);
        }

        let stored = FingerprintStore::stored(&self.model_file).await;
        if stored.as_deref() == Some(snapshot.fingerprint.as_str()) {
            debug!(fingerprint = %snapshot.fingerprint, "training data unchanged, skipping");
            return Ok(TrainingOutcome::SkippedUnchanged);
        }

        if snapshot.documents.is_empty() {
            debug!("no documents to train on, skipping classifier training");
            return Ok(TrainingOutcome::SkippedNoTrainingData);
        }

        let samples: Vec<TrainingSample> = snapshot
            .documents
            .iter()
            .map(|doc| TrainingSample {
                content: self.preprocessor.preprocess(&doc.content),
                correspondent_id: snapshot.rules.correspondent_of(doc),
                document_type_id: snapshot.rules.document_type_of(doc),
                tag_ids: snapshot.rules.tags_of(doc),
            })
            .collect();

        let model = ClassifierModel::fit(&samples, snapshot.fingerprint.as_str());
        model.save_async(self.model_file.clone()).await?;

        info!(
            documents = samples.len(),
            fingerprint = %snapshot.fingerprint,
            path = %self.model_file.display(),
            "classifier trained"
        );
        Ok(TrainingOutcome::Trained {
            documents: samples.len(),
        })
    }
}
