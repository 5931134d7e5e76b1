//! Corpus fingerprinting for conditional classifier training.
//!
//! The fingerprint is a SHA-256 digest over everything training reads: the
//! set of auto-matching rules and, for each live document, its id, content,
//! and its memberships in those rules. Unchanged inputs give an identical
//! fingerprint; any content or membership change gives a different one.

use std::collections::BTreeSet;
use std::fmt;
use std::path::Path;

use sha2::{Digest, Sha256};
use tracing::warn;

use crate::classifier::ClassifierModel;
use crate::error::TaskResult;
use crate::models::{Document, RuleKind};
use crate::store::DocumentStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorpusFingerprint(String);

impl CorpusFingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CorpusFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Ids of every rule configured for automatic matching, per kind.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AutoRules {
    pub tags: BTreeSet<i64>,
    pub correspondents: BTreeSet<i64>,
    pub document_types: BTreeSet<i64>,
}

impl AutoRules {
    pub async fn load(store: &DocumentStore) -> TaskResult<Self> {
        let mut rules = AutoRules::default();
        for kind in RuleKind::ALL {
            let ids: BTreeSet<i64> = store.auto_rule_ids(kind).await?.into_iter().collect();
            match kind {
                RuleKind::Tag => rules.tags = ids,
                RuleKind::Correspondent => rules.correspondents = ids,
                RuleKind::DocumentType => rules.document_types = ids,
            }
        }
        Ok(rules)
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty() && self.correspondents.is_empty() && self.document_types.is_empty()
    }

    pub fn correspondent_of(&self, doc: &Document) -> Option<i64> {
        doc.correspondent_id
            .filter(|id| self.correspondents.contains(id))
    }

    pub fn document_type_of(&self, doc: &Document) -> Option<i64> {
        doc.document_type_id
            .filter(|id| self.document_types.contains(id))
    }

    pub fn tags_of(&self, doc: &Document) -> Vec<i64> {
        let mut tags: Vec<i64> = doc
            .tag_ids
            .iter()
            .copied()
            .filter(|id| self.tags.contains(id))
            .collect();
        tags.sort_unstable();
        tags
    }
}

/// Everything a training run reads, captured once.
#[derive(Debug, Clone)]
pub struct CorpusSnapshot {
    pub rules: AutoRules,
    pub documents: Vec<Document>,
    pub fingerprint: CorpusFingerprint,
}

pub struct FingerprintStore {
    store: DocumentStore,
}

impl FingerprintStore {
    pub fn new(store: DocumentStore) -> Self {
        Self { store }
    }

    pub async fn snapshot(&self) -> TaskResult<CorpusSnapshot> {
        let rules = AutoRules::load(&self.store).await?;
        let documents = self.store.list_live().await?;
        let fingerprint = compute_fingerprint(&documents, &rules);
        Ok(CorpusSnapshot {
            rules,
            documents,
            fingerprint,
        })
    }

    /// Fingerprint recorded in the model artifact, if a usable one exists.
    /// Unreadable or outdated artifacts count as never trained.
    pub async fn stored(model_file: &Path) -> Option<String> {
        match ClassifierModel::load_async(model_file.to_path_buf()).await {
            Ok(model) => model.map(|m| m.fingerprint),
            Err(e) => {
                warn!(path = %model_file.display(), error = %e, "ignoring unusable classifier model");
                None
            }
        }
    }
}

pub fn compute_fingerprint(documents: &[Document], rules: &AutoRules) -> CorpusFingerprint {
    let mut hasher = Sha256::new();

    for (label, ids) in [
        ("tags", &rules.tags),
        ("correspondents", &rules.correspondents),
        ("document_types", &rules.document_types),
    ] {
        hasher.update(label.as_bytes());
        hasher.update((ids.len() as u64).to_le_bytes());
        for id in ids {
            hasher.update(id.to_le_bytes());
        }
    }

    let mut ordered: Vec<&Document> = documents.iter().collect();
    ordered.sort_by_key(|d| d.id);

    for doc in ordered {
        hasher.update(doc.id.to_le_bytes());
        // Length prefix keeps adjacent contents from running together
        hasher.update((doc.content.len() as u64).to_le_bytes());
        hasher.update(doc.content.as_bytes());
        hasher.update(rules.correspondent_of(doc).unwrap_or(-1).to_le_bytes());
        hasher.update(rules.document_type_of(doc).unwrap_or(-1).to_le_bytes());
        let tags = rules.tags_of(doc);
        hasher.update((tags.len() as u64).to_le_bytes());
        for tag in tags {
            hasher.update(tag.to_le_bytes());
        }
    }

    CorpusFingerprint(format!("{:x}", hasher.finalize()))
}
