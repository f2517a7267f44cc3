//! Semantic LLM-response cache service.
//!
//! One singleton job. Maps query fingerprints to previously generated
//! answers, scoped per model, with token-overlap similarity recall and
//! logical-timestamp invalidation.

pub mod api;
pub mod cache;

pub use cache::{CachedResponse, SemanticCache, Suggestion};
