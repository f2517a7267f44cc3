//! Embedded lexical index.
//!
//! Chunks of text with string metadata, scored against queries by token
//! overlap, filtered by metadata equality. Backs the semantic LLM cache
//! and the default retriever kernel.
//!
//! Durability: every insert/delete is written through an append log
//! (`append.jsonl`, flushed before the call returns) and folded into the
//! in-memory state; [`Index::save`] compacts the state into `index.json`
//! via tmp + rename and truncates the log. Opening replays any log
//! entries written after the last compaction.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use mb_domain::error::{Error, Result};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Chunks & scoring
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One indexed chunk of text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub chunk_id: u64,
    pub text: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// A search result with its raw overlap score.
#[derive(Debug, Clone)]
pub struct Hit {
    pub chunk: Chunk,
    pub score: f64,
}

/// Lowercased alphanumeric tokens of `text`.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect()
}

/// Fraction of `query` tokens present in `candidate`:
/// `|query_tokens ∩ candidate_tokens| / |query_tokens|`.
pub fn token_similarity(query: &str, candidate: &str) -> f64 {
    let query_tokens: std::collections::HashSet<String> = tokenize(query).into_iter().collect();
    if query_tokens.is_empty() {
        return 0.0;
    }
    let candidate_tokens: std::collections::HashSet<String> =
        tokenize(candidate).into_iter().collect();
    let overlap = query_tokens.intersection(&candidate_tokens).count();
    overlap as f64 / query_tokens.len() as f64
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Append log records
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum LogRecord {
    Insert { chunk: Chunk },
    Delete { chunk_ids: Vec<u64> },
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    chunks: Vec<Chunk>,
    next_id: u64,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Index
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct Inner {
    chunks: HashMap<u64, Chunk>,
    next_id: u64,
    log: File,
}

pub struct Index {
    dir: PathBuf,
    inner: Mutex<Inner>,
}

impl Index {
    const SNAPSHOT: &'static str = "index.json";
    const LOG: &'static str = "append.jsonl";

    /// Open the index directory, creating it if absent, and replay any
    /// append-log entries newer than the last compaction.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;

        let snapshot_path = dir.join(Self::SNAPSHOT);
        let mut snapshot = if snapshot_path.exists() {
            let bytes = std::fs::read(&snapshot_path)?;
            serde_json::from_slice::<Snapshot>(&bytes)
                .map_err(|e| Error::Internal(format!("corrupt index snapshot: {e}")))?
        } else {
            Snapshot::default()
        };

        let mut chunks: HashMap<u64, Chunk> =
            snapshot.chunks.drain(..).map(|c| (c.chunk_id, c)).collect();
        let mut next_id = snapshot.next_id;

        let log_path = dir.join(Self::LOG);
        if log_path.exists() {
            let reader = BufReader::new(File::open(&log_path)?);
            let mut replayed = 0usize;
            for line in reader.lines() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<LogRecord>(&line) {
                    Ok(LogRecord::Insert { chunk }) => {
                        next_id = next_id.max(chunk.chunk_id + 1);
                        chunks.insert(chunk.chunk_id, chunk);
                        replayed += 1;
                    }
                    Ok(LogRecord::Delete { chunk_ids }) => {
                        for id in chunk_ids {
                            chunks.remove(&id);
                        }
                        replayed += 1;
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "skipping malformed index log line");
                    }
                }
            }
            if replayed > 0 {
                tracing::info!(replayed, "replayed index append log");
            }
        }

        let log = OpenOptions::new().create(true).append(true).open(&log_path)?;
        Ok(Self {
            dir,
            inner: Mutex::new(Inner {
                chunks,
                next_id,
                log,
            }),
        })
    }

    /// Insert a chunk; the append-log write is flushed before returning.
    pub fn insert(&self, text: impl Into<String>, metadata: HashMap<String, String>) -> Result<u64> {
        let mut inner = self.inner.lock();
        let chunk = Chunk {
            chunk_id: inner.next_id,
            text: text.into(),
            metadata,
        };
        inner.next_id += 1;
        append(&mut inner.log, &LogRecord::Insert { chunk: chunk.clone() })?;
        let id = chunk.chunk_id;
        inner.chunks.insert(id, chunk);
        Ok(id)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().chunks.is_empty()
    }

    /// Top-`k` chunks matching every `(key, value)` filter, ranked by
    /// token-overlap score. Ties break toward lower chunk id (insertion
    /// order).
    pub fn search(&self, query: &str, top_k: usize, filters: &[(&str, &str)]) -> Vec<Hit> {
        let inner = self.inner.lock();
        let mut hits: Vec<Hit> = inner
            .chunks
            .values()
            .filter(|c| {
                filters
                    .iter()
                    .all(|(k, v)| c.metadata.get(*k).map(String::as_str) == Some(*v))
            })
            .map(|c| Hit {
                score: token_similarity(query, &c.text),
                chunk: c.clone(),
            })
            .filter(|h| h.score > 0.0)
            .collect();
        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.chunk.chunk_id.cmp(&b.chunk.chunk_id))
        });
        hits.truncate(top_k);
        hits
    }

    /// Ids of every chunk matching the filters.
    pub fn filter_chunk_ids(&self, filters: &[(&str, &str)]) -> Vec<u64> {
        let inner = self.inner.lock();
        inner
            .chunks
            .values()
            .filter(|c| {
                filters
                    .iter()
                    .all(|(k, v)| c.metadata.get(*k).map(String::as_str) == Some(*v))
            })
            .map(|c| c.chunk_id)
            .collect()
    }

    pub fn delete(&self, chunk_ids: &[u64]) -> Result<()> {
        if chunk_ids.is_empty() {
            return Ok(());
        }
        let mut inner = self.inner.lock();
        append(
            &mut inner.log,
            &LogRecord::Delete {
                chunk_ids: chunk_ids.to_vec(),
            },
        )?;
        for id in chunk_ids {
            inner.chunks.remove(id);
        }
        Ok(())
    }

    /// Compact the in-memory state into `index.json` (tmp + rename) and
    /// truncate the append log.
    pub fn save(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        let mut chunks: Vec<Chunk> = inner.chunks.values().cloned().collect();
        chunks.sort_by_key(|c| c.chunk_id);
        let snapshot = Snapshot {
            chunks,
            next_id: inner.next_id,
        };
        let bytes = serde_json::to_vec(&snapshot)?;
        let tmp = self.dir.join("index.json.tmp");
        std::fs::write(&tmp, bytes)?;
        std::fs::rename(&tmp, self.dir.join(Self::SNAPSHOT))?;
        inner.log = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(self.dir.join(Self::LOG))?;
        Ok(())
    }
}

fn append(log: &mut File, record: &LogRecord) -> Result<()> {
    let mut line = serde_json::to_vec(record)?;
    line.push(b'\n');
    log.write_all(&line)?;
    log.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn tokenize_lowercases_and_splits_punctuation() {
        assert_eq!(
            tokenize("What is the NDA's term?"),
            vec!["what", "is", "the", "nda", "s", "term"]
        );
    }

    #[test]
    fn similarity_is_query_normalized() {
        let sim = token_similarity(
            "what is the capital of franc",
            "what is the capital of france",
        );
        assert!((sim - 5.0 / 6.0).abs() < 1e-9);
        assert_eq!(token_similarity("hello", "hello"), 1.0);
        assert_eq!(token_similarity("", "anything"), 0.0);
    }

    #[test]
    fn search_respects_metadata_filters() {
        let dir = tempfile::tempdir().unwrap();
        let index = Index::open(dir.path()).unwrap();
        index
            .insert("capital of france", meta(&[("model_id", "m1")]))
            .unwrap();
        index
            .insert("capital of france", meta(&[("model_id", "m2")]))
            .unwrap();

        let hits = index.search("capital of france", 5, &[("model_id", "m1")]);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chunk.metadata["model_id"], "m1");

        let hits = index.search("capital of france", 5, &[("model_id", "m3")]);
        assert!(hits.is_empty());
    }

    #[test]
    fn search_ranks_by_overlap_and_truncates() {
        let dir = tempfile::tempdir().unwrap();
        let index = Index::open(dir.path()).unwrap();
        index.insert("alpha beta gamma", HashMap::new()).unwrap();
        index.insert("alpha beta", HashMap::new()).unwrap();
        index.insert("alpha", HashMap::new()).unwrap();
        index.insert("unrelated text", HashMap::new()).unwrap();

        let hits = index.search("alpha beta gamma", 2, &[]);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].chunk.text, "alpha beta gamma");
        assert_eq!(hits[1].chunk.text, "alpha beta");
    }

    #[test]
    fn delete_by_filter_removes_only_matches() {
        let dir = tempfile::tempdir().unwrap();
        let index = Index::open(dir.path()).unwrap();
        index.insert("q1", meta(&[("model_id", "m1")])).unwrap();
        index.insert("q2", meta(&[("model_id", "m2")])).unwrap();
        let doomed = index.filter_chunk_ids(&[("model_id", "m1")]);
        index.delete(&doomed).unwrap();
        assert_eq!(index.len(), 1);
        assert!(index.filter_chunk_ids(&[("model_id", "m1")]).is_empty());
    }

    #[test]
    fn unsaved_inserts_survive_reopen_via_append_log() {
        let dir = tempfile::tempdir().unwrap();
        {
            let index = Index::open(dir.path()).unwrap();
            index.insert("durable entry", meta(&[("model_id", "m1")])).unwrap();
            // No save(): simulate a crash before compaction.
        }
        let reopened = Index::open(dir.path()).unwrap();
        assert_eq!(reopened.len(), 1);
        let hits = reopened.search("durable entry", 5, &[("model_id", "m1")]);
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn save_compacts_and_ids_stay_monotonic() {
        let dir = tempfile::tempdir().unwrap();
        let first_id;
        {
            let index = Index::open(dir.path()).unwrap();
            first_id = index.insert("one", HashMap::new()).unwrap();
            index.save().unwrap();
            assert_eq!(
                std::fs::read_to_string(dir.path().join("append.jsonl")).unwrap(),
                ""
            );
        }
        let reopened = Index::open(dir.path()).unwrap();
        let second_id = reopened.insert("two", HashMap::new()).unwrap();
        assert!(second_id > first_id);
        assert_eq!(reopened.len(), 2);
    }
}
