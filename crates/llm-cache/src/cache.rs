//! The semantic cache proper.
//!
//! Entries are `(query_text, {model_id, llm_res})` chunks in the
//! embedded index. Lookup searches the top five candidates scoped to
//! the model, reranks by token overlap against the incoming query, and
//! returns the best candidate iff its similarity clears the threshold.
//!
//! Invalidation records a logical timestamp per model; an insert whose
//! scope token was issued before the model's latest invalidation is
//! discarded, so an insert/invalidate pair arriving out of order cannot
//! resurrect stale answers.

use std::collections::BTreeMap;
use std::path::PathBuf;

use parking_lot::Mutex;
use serde::Serialize;
use uuid::Uuid;

use mb_domain::error::{Error, Result};
use mb_index::{token_similarity, Index};

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CachedResponse {
    pub query: String,
    pub query_id: u64,
    pub llm_res: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Suggestion {
    pub query: String,
    pub query_id: u64,
}

pub struct SemanticCache {
    index: Index,
    threshold: f64,
    dir: PathBuf,
    /// model_id → unix-seconds timestamp of the latest invalidation.
    invalidations: Mutex<BTreeMap<String, i64>>,
}

impl SemanticCache {
    const INVALIDATIONS_FILE: &'static str = "invalidations.json";

    pub fn open(dir: impl Into<PathBuf>, threshold: f64) -> Result<Self> {
        let dir = dir.into();
        let index = Index::open(&dir)?;
        let invalidations_path = dir.join(Self::INVALIDATIONS_FILE);
        let invalidations = if invalidations_path.exists() {
            let bytes = std::fs::read(&invalidations_path)?;
            serde_json::from_slice(&bytes)
                .map_err(|e| Error::Internal(format!("corrupt invalidations file: {e}")))?
        } else {
            BTreeMap::new()
        };
        tracing::info!(dir = %dir.display(), entries = index.len(), threshold, "semantic cache open");
        Ok(Self {
            index,
            threshold,
            dir,
            invalidations: Mutex::new(invalidations),
        })
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Insert an entry. `issued_at` is the logical timestamp of the
    /// caller's scope token; inserts older than the latest invalidation
    /// for the model are dropped. Returns whether the entry was stored.
    pub fn insert(
        &self,
        model_id: Uuid,
        query: &str,
        llm_res: &str,
        issued_at: i64,
    ) -> Result<bool> {
        let stale = self
            .invalidations
            .lock()
            .get(&model_id.to_string())
            .map(|&invalidated_at| issued_at < invalidated_at)
            .unwrap_or(false);
        if stale {
            tracing::info!(%model_id, "discarding insert issued before latest invalidation");
            return Ok(false);
        }
        let metadata = [
            ("model_id".to_string(), model_id.to_string()),
            ("llm_res".to_string(), llm_res.to_string()),
        ]
        .into_iter()
        .collect();
        self.index.insert(query.to_string(), metadata)?;
        Ok(true)
    }

    /// Best cached answer above the similarity threshold, else `None`.
    pub fn query(&self, model_id: Uuid, query: &str) -> Option<CachedResponse> {
        let model_id = model_id.to_string();
        let candidates = self.index.search(query, 5, &[("model_id", model_id.as_str())]);

        let best = candidates
            .into_iter()
            .map(|hit| {
                let similarity = token_similarity(query, &hit.chunk.text);
                (hit, similarity)
            })
            .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))?;

        if best.1 > self.threshold {
            let (hit, similarity) = best;
            tracing::info!(similarity, "cache hit");
            Some(CachedResponse {
                query: hit.chunk.text.clone(),
                query_id: hit.chunk.chunk_id,
                llm_res: hit.chunk.metadata.get("llm_res").cloned().unwrap_or_default(),
            })
        } else {
            tracing::info!(best_similarity = best.1, "cache miss below threshold");
            None
        }
    }

    /// Up to five deduplicated candidate queries, no similarity gate.
    pub fn suggestions(&self, model_id: Uuid, query: &str) -> Vec<Suggestion> {
        let model_id = model_id.to_string();
        let mut seen = std::collections::HashSet::new();
        self.index
            .search(query, 5, &[("model_id", model_id.as_str())])
            .into_iter()
            .filter(|hit| seen.insert(hit.chunk.text.clone()))
            .map(|hit| Suggestion {
                query: hit.chunk.text,
                query_id: hit.chunk.chunk_id,
            })
            .collect()
    }

    /// Drop every entry bound to the model and record the invalidation
    /// timestamp. Returns how many entries were removed.
    pub fn invalidate(&self, model_id: Uuid, timestamp: i64) -> Result<usize> {
        let model_key = model_id.to_string();
        let ids = self.index.filter_chunk_ids(&[("model_id", model_key.as_str())]);
        self.index.delete(&ids)?;
        {
            let mut invalidations = self.invalidations.lock();
            let entry = invalidations.entry(model_key).or_insert(timestamp);
            *entry = (*entry).max(timestamp);
            let bytes = serde_json::to_vec_pretty(&*invalidations)?;
            let tmp = self.dir.join("invalidations.json.tmp");
            std::fs::write(&tmp, bytes)?;
            std::fs::rename(&tmp, self.dir.join(Self::INVALIDATIONS_FILE))?;
        }
        Ok(ids.len())
    }

    /// Compact the backing index to disk.
    pub fn save(&self) -> Result<()> {
        self.index.save()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn cache(threshold: f64) -> (tempfile::TempDir, SemanticCache) {
        let dir = tempfile::tempdir().unwrap();
        let cache = SemanticCache::open(dir.path(), threshold).unwrap();
        (dir, cache)
    }

    fn now() -> i64 {
        Utc::now().timestamp()
    }

    #[test]
    fn recall_respects_the_threshold() {
        let model = Uuid::new_v4();

        // 5/6 tokens overlap = 0.833 > 0.8: hit.
        let (_dir, permissive) = cache(0.8);
        permissive
            .insert(model, "what is the capital of france", "paris", now())
            .unwrap();
        let hit = permissive.query(model, "what is the capital of franc").unwrap();
        assert_eq!(hit.llm_res, "paris");

        // 0.833 < 0.95: miss. Exact repetition still hits.
        let (_dir2, strict) = cache(0.95);
        strict
            .insert(model, "what is the capital of france", "paris", now())
            .unwrap();
        assert!(strict.query(model, "what is the capital of franc").is_none());
        assert!(strict.query(model, "what is the capital of france").is_some());
    }

    #[test]
    fn entries_are_scoped_by_model() {
        let (_dir, cache) = cache(0.5);
        let m1 = Uuid::new_v4();
        let m2 = Uuid::new_v4();
        cache
            .insert(m1, "what is the capital of france", "paris", now())
            .unwrap();

        assert!(cache.query(m1, "what is the capital of france").is_some());
        assert!(cache.query(m2, "what is the capital of france").is_none());
    }

    #[test]
    fn invalidate_empties_the_model_scope() {
        let (_dir, cache) = cache(0.5);
        let model = Uuid::new_v4();
        cache.insert(model, "q one", "a1", now()).unwrap();
        cache.insert(model, "q two", "a2", now()).unwrap();

        let removed = cache.invalidate(model, now()).unwrap();
        assert_eq!(removed, 2);
        assert!(cache.query(model, "q one").is_none());
        assert!(cache.suggestions(model, "q").is_empty());
    }

    #[test]
    fn stale_insert_after_invalidation_is_discarded() {
        let (_dir, cache) = cache(0.5);
        let model = Uuid::new_v4();
        let t0 = now();

        // Invalidate at t0 + 10; an insert whose token was issued at t0
        // arrives afterwards and must be dropped.
        cache.invalidate(model, t0 + 10).unwrap();
        let stored = cache.insert(model, "old question", "old answer", t0).unwrap();
        assert!(!stored);
        assert!(cache.query(model, "old question").is_none());

        // A token issued after the invalidation works.
        let stored = cache
            .insert(model, "new question", "new answer", t0 + 20)
            .unwrap();
        assert!(stored);
    }

    #[test]
    fn suggestions_deduplicate_and_skip_the_gate() {
        let (_dir, cache) = cache(0.99);
        let model = Uuid::new_v4();
        cache.insert(model, "rate limits for api", "a", now()).unwrap();
        cache.insert(model, "rate limits for api", "b", now()).unwrap();
        cache.insert(model, "api error codes", "c", now()).unwrap();

        let suggestions = cache.suggestions(model, "api rate");
        assert_eq!(suggestions.len(), 2, "duplicate query text collapses");
    }

    #[test]
    fn cache_reloads_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let model = Uuid::new_v4();
        {
            let cache = SemanticCache::open(dir.path(), 0.5).unwrap();
            cache.insert(model, "persistent question", "answer", now()).unwrap();
            cache.save().unwrap();
        }
        let reopened = SemanticCache::open(dir.path(), 0.5).unwrap();
        let hit = reopened.query(model, "persistent question").unwrap();
        assert_eq!(hit.llm_res, "answer");
    }
}
