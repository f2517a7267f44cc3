//! Model kernels.
//!
//! The serving runtime treats a model as an opaque object behind
//! [`ModelKernel`]. Two kernels ship here: a retriever backed by the
//! embedded lexical index (with upvote/associate feedback state), and a
//! rule-based token classifier used for guardrails and UDT deployments.
//!
//! Kernel state persists under the artifact directory and is saved
//! atomically; all maps serialize in sorted order so that saving the
//! same logical state twice produces identical bytes.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use mb_domain::error::{Error, Result};
use mb_domain::update::FileInfo;
use mb_index::Index;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Documents & references
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A parsed document ready for insertion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub doc_id: String,
    pub source: String,
    /// Text chunks, one index entry each.
    pub chunks: Vec<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// One ranked result of a prediction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reference {
    pub chunk_id: u64,
    pub text: String,
    pub source: String,
    pub doc_id: String,
    pub score: f64,
}

/// The opaque model surface the deployment worker serves.
pub trait ModelKernel: Send + Sync {
    fn predict(
        &self,
        query: &str,
        top_k: usize,
        constraints: &HashMap<String, String>,
    ) -> Result<Vec<Reference>>;

    fn insert(&self, documents: &[Document]) -> Result<usize>;

    fn delete(&self, doc_ids: &[String]) -> Result<()>;

    /// Feedback: strengthen `chunk_ids` for each of `queries`.
    fn upvote(&self, chunk_ids: &[u64], queries: &[String]) -> Result<()>;

    /// Feedback: treat each source phrase like its target when scoring.
    fn associate(&self, sources: &[String], targets: &[String]) -> Result<()>;

    /// Persist kernel state under the artifact directory, atomically.
    fn save(&self, artifact: &Path) -> Result<()>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// File parsing
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

const SUPPORTED_EXTENSIONS: [&str; 4] = ["txt", "md", "csv", "pdf"];

/// Parse a staged file into a [`Document`]. Unsupported types and
/// unreadable files are `invalid_argument` so the API layer returns 4xx
/// and never logs the record.
pub fn parse_file(info: &FileInfo, staged_path: &Path) -> Result<Document> {
    let extension = staged_path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
        .unwrap_or_default();
    if !SUPPORTED_EXTENSIONS.contains(&extension.as_str()) {
        return Err(Error::InvalidArgument(format!(
            "unsupported file type {extension:?} for {}",
            info.path
        )));
    }
    let bytes = std::fs::read(staged_path)
        .map_err(|e| Error::InvalidArgument(format!("cannot read {}: {e}", info.path)))?;

    let text = if extension == "pdf" {
        extract_printable_runs(&bytes)
    } else {
        String::from_utf8_lossy(&bytes).into_owned()
    };
    let chunks: Vec<String> = text
        .split("\n\n")
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .map(str::to_string)
        .collect();
    if chunks.is_empty() {
        return Err(Error::InvalidArgument(format!(
            "no extractable text in {}",
            info.path
        )));
    }

    let doc_id = info
        .doc_id
        .clone()
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    Ok(Document {
        doc_id,
        source: info.path.clone(),
        chunks,
        metadata: info.metadata.clone(),
    })
}

/// Crude text recovery for PDFs whose content streams carry plain text:
/// keep printable ASCII runs of at least four characters.
fn extract_printable_runs(bytes: &[u8]) -> String {
    let mut out = String::new();
    let mut run = String::new();
    for &b in bytes {
        if (0x20..0x7f).contains(&b) {
            run.push(b as char);
        } else {
            if run.trim().len() >= 4 {
                out.push_str(run.trim());
                out.push('\n');
            }
            run.clear();
        }
    }
    if run.trim().len() >= 4 {
        out.push_str(run.trim());
    }
    out
}

/// Resolve where a file's bytes live locally, downloading cloud-hosted
/// files into `staging`.
pub async fn stage_file(info: &FileInfo, staging: &Path) -> Result<PathBuf> {
    if info.is_cloud_hosted() {
        crate::storage::download_to(&info.path, staging).await
    } else {
        Ok(PathBuf::from(&info.path))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Retriever kernel
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

const BOOST_WEIGHT: f64 = 1.0;

/// Feedback state saved next to the index. Sorted maps keep the
/// serialized form deterministic.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct FeedbackState {
    /// Normalized query → boosted chunk ids (sorted, deduplicated).
    boosts: BTreeMap<String, Vec<u64>>,
    /// Normalized source phrase → target phrases appended to matching
    /// queries before search.
    associations: BTreeMap<String, Vec<String>>,
}

pub struct RetrieverKernel {
    index: Index,
    feedback: RwLock<FeedbackState>,
}

fn normalize(text: &str) -> String {
    mb_index::tokenize(text).join(" ")
}

impl RetrieverKernel {
    const FEEDBACK_FILE: &'static str = "feedback.json";

    /// Load kernel state from an artifact directory, creating an empty
    /// kernel when the directory is fresh.
    pub fn load(artifact: &Path) -> Result<Self> {
        let index = Index::open(artifact.join("index"))?;
        let feedback_path = artifact.join(Self::FEEDBACK_FILE);
        let feedback = if feedback_path.exists() {
            let bytes = std::fs::read(&feedback_path)?;
            serde_json::from_slice(&bytes)
                .map_err(|e| Error::Internal(format!("corrupt feedback state: {e}")))?
        } else {
            FeedbackState::default()
        };
        Ok(Self {
            index,
            feedback: RwLock::new(feedback),
        })
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    /// Expanded query text: the query plus the targets of any
    /// association whose source appears in it.
    fn expand_query(&self, query: &str) -> String {
        let normalized = normalize(query);
        let feedback = self.feedback.read();
        let mut expanded = query.to_string();
        for (source, targets) in feedback.associations.iter() {
            if normalized.contains(source.as_str()) {
                for target in targets {
                    expanded.push(' ');
                    expanded.push_str(target);
                }
            }
        }
        expanded
    }
}

impl ModelKernel for RetrieverKernel {
    fn predict(
        &self,
        query: &str,
        top_k: usize,
        constraints: &HashMap<String, String>,
    ) -> Result<Vec<Reference>> {
        let expanded = self.expand_query(query);
        let filters: Vec<(&str, &str)> = constraints
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        // Overfetch so boosted chunks can climb into the final top_k.
        let mut hits = self.index.search(&expanded, top_k.max(1) * 4, &filters);

        let boosted = self
            .feedback
            .read()
            .boosts
            .get(&normalize(query))
            .cloned()
            .unwrap_or_default();
        for hit in &mut hits {
            if boosted.binary_search(&hit.chunk.chunk_id).is_ok() {
                hit.score += BOOST_WEIGHT;
            }
        }
        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.chunk.chunk_id.cmp(&b.chunk.chunk_id))
        });
        hits.truncate(top_k);

        Ok(hits
            .into_iter()
            .map(|h| Reference {
                chunk_id: h.chunk.chunk_id,
                text: h.chunk.text,
                source: h.chunk.metadata.get("source").cloned().unwrap_or_default(),
                doc_id: h.chunk.metadata.get("doc_id").cloned().unwrap_or_default(),
                score: h.score,
            })
            .collect())
    }

    fn insert(&self, documents: &[Document]) -> Result<usize> {
        let mut inserted = 0usize;
        for doc in documents {
            for chunk in &doc.chunks {
                let mut metadata = doc.metadata.clone();
                metadata.insert("doc_id".to_string(), doc.doc_id.clone());
                metadata.insert("source".to_string(), doc.source.clone());
                self.index.insert(chunk.clone(), metadata)?;
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    fn delete(&self, doc_ids: &[String]) -> Result<()> {
        for doc_id in doc_ids {
            let chunk_ids = self.index.filter_chunk_ids(&[("doc_id", doc_id.as_str())]);
            self.index.delete(&chunk_ids)?;
        }
        Ok(())
    }

    fn upvote(&self, chunk_ids: &[u64], queries: &[String]) -> Result<()> {
        let mut feedback = self.feedback.write();
        for query in queries {
            let entry = feedback.boosts.entry(normalize(query)).or_default();
            entry.extend_from_slice(chunk_ids);
            entry.sort_unstable();
            entry.dedup();
        }
        Ok(())
    }

    fn associate(&self, sources: &[String], targets: &[String]) -> Result<()> {
        if sources.len() != targets.len() {
            return Err(Error::InvalidArgument(
                "associate requires equally many sources and targets".into(),
            ));
        }
        let mut feedback = self.feedback.write();
        for (source, target) in sources.iter().zip(targets) {
            let entry = feedback.associations.entry(normalize(source)).or_default();
            if !entry.contains(target) {
                entry.push(target.clone());
                entry.sort_unstable();
            }
        }
        Ok(())
    }

    fn save(&self, artifact: &Path) -> Result<()> {
        std::fs::create_dir_all(artifact)?;
        self.index.save()?;
        let bytes = serde_json::to_vec_pretty(&*self.feedback.read())?;
        let tmp = artifact.join("feedback.json.tmp");
        std::fs::write(&tmp, bytes)?;
        std::fs::rename(&tmp, artifact.join(Self::FEEDBACK_FILE))?;
        Ok(())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Token classifier kernel
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A span tagged by the classifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TagSpan {
    pub start: usize,
    pub end: usize,
    pub tag: String,
    pub text: String,
}

/// Token classification behind a small trait so guardrail composition
/// does not depend on the concrete kernel.
pub trait TokenClassifier: Send + Sync {
    fn classify(&self, text: &str) -> Vec<TagSpan>;

    /// Tags that must never reach retrieval.
    fn disallowed_tags(&self) -> Vec<String>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TagRule {
    tag: String,
    pattern: String,
    #[serde(default)]
    disallowed: bool,
}

/// Pattern-rule classifier loaded from `rules.json` in the artifact.
pub struct RuleClassifier {
    rules: Vec<(TagRule, regex::Regex)>,
}

impl RuleClassifier {
    pub fn load(artifact: &Path) -> Result<Self> {
        let path = artifact.join("rules.json");
        let bytes = std::fs::read(&path)
            .map_err(|e| Error::Internal(format!("cannot read {}: {e}", path.display())))?;
        let raw: Vec<TagRule> = serde_json::from_slice(&bytes)
            .map_err(|e| Error::Internal(format!("corrupt rules.json: {e}")))?;
        let mut rules = Vec::with_capacity(raw.len());
        for rule in raw {
            let compiled = regex::Regex::new(&rule.pattern)
                .map_err(|e| Error::Internal(format!("bad pattern for tag {}: {e}", rule.tag)))?;
            rules.push((rule, compiled));
        }
        Ok(Self { rules })
    }
}

impl TokenClassifier for RuleClassifier {
    fn classify(&self, text: &str) -> Vec<TagSpan> {
        let mut spans = Vec::new();
        for (rule, pattern) in &self.rules {
            for found in pattern.find_iter(text) {
                spans.push(TagSpan {
                    start: found.start(),
                    end: found.end(),
                    tag: rule.tag.clone(),
                    text: found.as_str().to_string(),
                });
            }
        }
        spans.sort_by_key(|s| s.start);
        spans
    }

    fn disallowed_tags(&self) -> Vec<String> {
        self.rules
            .iter()
            .filter(|(r, _)| r.disallowed)
            .map(|(r, _)| r.tag.clone())
            .collect()
    }
}

/// Redact disallowed spans before the query reaches retrieval.
pub fn redact(query: &str, classifier: &dyn TokenClassifier) -> String {
    let disallowed = classifier.disallowed_tags();
    if disallowed.is_empty() {
        return query.to_string();
    }
    let mut spans: Vec<TagSpan> = classifier
        .classify(query)
        .into_iter()
        .filter(|s| disallowed.contains(&s.tag))
        .collect();
    spans.sort_by_key(|s| s.start);

    let mut out = String::new();
    let mut cursor = 0usize;
    for span in spans {
        if span.start < cursor {
            continue; // overlapping span already covered
        }
        out.push_str(&query[cursor..span.start]);
        out.push_str("[REDACTED]");
        cursor = span.end;
    }
    out.push_str(&query[cursor..]);
    out
}

/// Classifier-backed kernel for token-classification deployments. The
/// update surface is read-only; mutations arrive through retraining.
pub struct ClassifierKernel {
    classifier: RuleClassifier,
}

impl ClassifierKernel {
    pub fn load(artifact: &Path) -> Result<Self> {
        Ok(Self {
            classifier: RuleClassifier::load(artifact)?,
        })
    }

    pub fn classifier(&self) -> &RuleClassifier {
        &self.classifier
    }
}

impl ModelKernel for ClassifierKernel {
    fn predict(
        &self,
        query: &str,
        top_k: usize,
        _constraints: &HashMap<String, String>,
    ) -> Result<Vec<Reference>> {
        Ok(self
            .classifier
            .classify(query)
            .into_iter()
            .take(top_k)
            .enumerate()
            .map(|(i, span)| Reference {
                chunk_id: i as u64,
                text: span.text,
                source: span.tag,
                doc_id: String::new(),
                score: 1.0,
            })
            .collect())
    }

    fn insert(&self, _documents: &[Document]) -> Result<usize> {
        Err(Error::PreconditionFailed(
            "token classifiers do not support online insertion".into(),
        ))
    }

    fn delete(&self, _doc_ids: &[String]) -> Result<()> {
        Err(Error::PreconditionFailed(
            "token classifiers do not support online deletion".into(),
        ))
    }

    fn upvote(&self, _chunk_ids: &[u64], _queries: &[String]) -> Result<()> {
        Err(Error::PreconditionFailed(
            "token classifiers do not accept retrieval feedback".into(),
        ))
    }

    fn associate(&self, _sources: &[String], _targets: &[String]) -> Result<()> {
        Err(Error::PreconditionFailed(
            "token classifiers do not accept retrieval feedback".into(),
        ))
    }

    fn save(&self, _artifact: &Path) -> Result<()> {
        Ok(())
    }
}
