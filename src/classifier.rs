//! Matching model: preprocessing, fitting, prediction, and the on-disk artifact.
//!
//! The model keeps one L2-normalized term-frequency centroid per label for
//! each rule kind (correspondents, document types, tags) and scores new
//! content by cosine similarity against those centroids. Only rules set to
//! automatic matching are learned.
//!
//! The artifact is a JSON file holding the model and the
//! [`CorpusFingerprint`](crate::fingerprint::CorpusFingerprint) it was
//! trained on. It is replaced with write-to-temp-then-rename, so a reader
//! sees either the previous or the new artifact.

use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::{TaskError, TaskResult};

/// Bump when the artifact layout changes; older artifacts are retrained.
pub const MODEL_FORMAT_VERSION: u32 = 1;

/// Minimum similarity for a single-label prediction (correspondent, type).
const MIN_LABEL_SCORE: f64 = 0.2;
/// Minimum similarity for a tag to be suggested.
const MIN_TAG_SCORE: f64 = 0.35;

/// Normalizes document content before it is fitted or scored.
pub trait Preprocessor: Send + Sync {
    fn preprocess(&self, content: &str) -> String;
}

/// Lowercases, replaces non-alphanumerics with spaces, drops one-character
/// tokens, and collapses whitespace.
pub struct DefaultPreprocessor;

impl Preprocessor for DefaultPreprocessor {
    fn preprocess(&self, content: &str) -> String {
        let lowered: String = content
            .chars()
            .map(|c| {
                if c.is_alphanumeric() {
                    c.to_lowercase().next().unwrap_or(c)
                } else {
                    ' '
                }
            })
            .collect();
        lowered
            .split_whitespace()
            .filter(|t| t.chars().count() > 1)
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// One document's contribution to training: preprocessed text plus the
/// labels it carries for auto-matching rules.
#[derive(Debug, Clone)]
pub struct TrainingSample {
    pub content: String,
    pub correspondent_id: Option<i64>,
    pub document_type_id: Option<i64>,
    pub tag_ids: Vec<i64>,
}

type TermVector = BTreeMap<String, f64>;

/// Per-label centroids for one rule kind.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct LabelModel {
    centroids: BTreeMap<i64, TermVector>,
}

impl LabelModel {
    fn fit<'a>(samples: impl Iterator<Item = (i64, &'a TermVector)>) -> Self {
        let mut sums: BTreeMap<i64, TermVector> = BTreeMap::new();
        for (label, vector) in samples {
            let sum = sums.entry(label).or_default();
            for (term, weight) in vector {
                *sum.entry(term.clone()).or_insert(0.0) += weight;
            }
        }
        let centroids = sums
            .into_iter()
            .map(|(label, sum)| (label, normalize(sum)))
            .collect();
        Self { centroids }
    }

    pub fn labels(&self) -> impl Iterator<Item = i64> + '_ {
        self.centroids.keys().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.centroids.is_empty()
    }

    /// Cosine similarity of `vector` against every label, best first.
    fn scores(&self, vector: &TermVector) -> Vec<(i64, f64)> {
        let mut scores: Vec<(i64, f64)> = self
            .centroids
            .iter()
            .map(|(label, centroid)| (*label, dot(vector, centroid)))
            .collect();
        scores.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scores
    }

    fn best(&self, vector: &TermVector) -> Option<i64> {
        self.scores(vector)
            .into_iter()
            .next()
            .filter(|(_, score)| *score >= MIN_LABEL_SCORE)
            .map(|(label, _)| label)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClassifierModel {
    pub format_version: u32,
    pub fingerprint: String,
    pub trained_at: i64,
    pub correspondents: LabelModel,
    pub document_types: LabelModel,
    pub tags: LabelModel,
}

#[derive(Debug, Error)]
pub enum ModelLoadError {
    #[error("cannot read model file: {0}")]
    Io(#[from] std::io::Error),
    #[error("cannot parse model file: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("model format version {found} does not match {expected}")]
    Version { found: u32, expected: u32 },
    #[error("model load did not finish: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl ClassifierModel {
    pub fn fit(samples: &[TrainingSample], fingerprint: &str) -> Self {
        let vectors: Vec<TermVector> = samples.iter().map(|s| term_vector(&s.content)).collect();

        let correspondents = LabelModel::fit(
            samples
                .iter()
                .zip(&vectors)
                .filter_map(|(s, v)| s.correspondent_id.map(|id| (id, v))),
        );
        let document_types = LabelModel::fit(
            samples
                .iter()
                .zip(&vectors)
                .filter_map(|(s, v)| s.document_type_id.map(|id| (id, v))),
        );
        let tags = LabelModel::fit(
            samples
                .iter()
                .zip(&vectors)
                .flat_map(|(s, v)| s.tag_ids.iter().map(move |id| (*id, v))),
        );

        Self {
            format_version: MODEL_FORMAT_VERSION,
            fingerprint: fingerprint.to_string(),
            trained_at: chrono::Utc::now().timestamp(),
            correspondents,
            document_types,
            tags,
        }
    }

    pub fn predict_correspondent(&self, preprocessed: &str) -> Option<i64> {
        self.correspondents.best(&term_vector(preprocessed))
    }

    pub fn predict_document_type(&self, preprocessed: &str) -> Option<i64> {
        self.document_types.best(&term_vector(preprocessed))
    }

    pub fn predict_tags(&self, preprocessed: &str) -> Vec<i64> {
        let mut tags: Vec<i64> = self
            .tags
            .scores(&term_vector(preprocessed))
            .into_iter()
            .filter(|(_, score)| *score >= MIN_TAG_SCORE)
            .map(|(label, _)| label)
            .collect();
        tags.sort_unstable();
        tags
    }

    /// Read the artifact at `path`. `Ok(None)` means it was never written.
    pub fn load(path: &Path) -> Result<Option<Self>, ModelLoadError> {
        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let model: ClassifierModel = serde_json::from_slice(&bytes)?;
        if model.format_version != MODEL_FORMAT_VERSION {
            return Err(ModelLoadError::Version {
                found: model.format_version,
                expected: MODEL_FORMAT_VERSION,
            });
        }
        Ok(Some(model))
    }

    /// Write the artifact next to its final location, then rename it into place.
    pub fn save(&self, path: &Path) -> TaskResult<()> {
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(dir)?;

        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        serde_json::to_writer(&mut tmp, self)?;
        tmp.flush()?;
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| e.error)?;
        Ok(())
    }

    /// [`load`](Self::load) on the blocking pool.
    pub async fn load_async(path: PathBuf) -> Result<Option<Self>, ModelLoadError> {
        tokio::task::spawn_blocking(move || Self::load(&path)).await?
    }

    /// [`save`](Self::save) on the blocking pool.
    pub async fn save_async(self, path: PathBuf) -> TaskResult<()> {
        tokio::task::spawn_blocking(move || self.save(&path))
            .await
            .map_err(|e| TaskError::Other(anyhow::Error::new(e)))?
    }
}

fn term_vector(preprocessed: &str) -> TermVector {
    let mut counts: HashMap<&str, f64> = HashMap::new();
    for token in preprocessed.split_whitespace() {
        *counts.entry(token).or_insert(0.0) += 1.0;
    }
    normalize(
        counts
            .into_iter()
            .map(|(term, count)| (term.to_string(), count))
            .collect(),
    )
}

fn normalize(mut vector: TermVector) -> TermVector {
    let norm = vector.values().map(|w| w * w).sum::<f64>().sqrt();
    if norm > f64::EPSILON {
        for weight in vector.values_mut() {
            *weight /= norm;
        }
    }
    vector
}

fn dot(a: &TermVector, b: &TermVector) -> f64 {
    let (small, large) = if a.len() <= b.len() { (a, b) } else { (b, a) };
    small
        .iter()
        .filter_map(|(term, w)| large.get(term).map(|v| w * v))
        .sum()
}
