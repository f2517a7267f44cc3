//! Cache service endpoints.
//!
//! - `GET  /cache/query`       — cached answer or null
//! - `GET  /cache/suggestions` — up to five candidate queries
//! - `POST /cache/insert`      — scope-token gated, the only mutation
//! - `POST /cache/invalidate`  — drop a model's entries
//! - `GET  /cache/token`       — issue a 15-minute cache-scope token
//! - `GET  /health`            — liveness probe

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::routing::{get, post};
use axum::Router;
use chrono::Utc;
use serde::Deserialize;
use uuid::Uuid;

use mb_domain::envelope::ApiResponse;
use mb_domain::error::{Error, Result};
use mb_identity::TokenSigner;

use crate::cache::SemanticCache;

#[derive(Clone)]
pub struct CacheState {
    pub cache: Arc<SemanticCache>,
    pub signer: TokenSigner,
}

pub fn router() -> Router<CacheState> {
    Router::new()
        .route("/health", get(health))
        .route("/cache/query", get(query))
        .route("/cache/suggestions", get(suggestions))
        .route("/cache/insert", post(insert))
        .route("/cache/invalidate", post(invalidate))
        .route("/cache/token", get(token))
}

async fn health() -> ApiResponse {
    ApiResponse::ok("ok", serde_json::Value::Null)
}

#[derive(Debug, Deserialize)]
struct QueryParams {
    model_id: Uuid,
    query: String,
}

async fn query(
    State(state): State<CacheState>,
    Query(params): Query<QueryParams>,
) -> Result<ApiResponse> {
    let cached = state.cache.query(params.model_id, &params.query);
    Ok(ApiResponse::ok(
        "cache lookup complete",
        serde_json::json!({ "cached_response": cached }),
    ))
}

async fn suggestions(
    State(state): State<CacheState>,
    Query(params): Query<QueryParams>,
) -> Result<ApiResponse> {
    let suggestions = state.cache.suggestions(params.model_id, &params.query);
    Ok(ApiResponse::ok(
        "suggestions complete",
        serde_json::json!({ "suggestions": suggestions }),
    ))
}

#[derive(Debug, Deserialize)]
struct InsertParams {
    model_id: Uuid,
    query: String,
    llm_res: String,
}

fn bearer(headers: &HeaderMap) -> Result<&str> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or_else(|| Error::Unauthorized("missing bearer token".into()))
}

async fn insert(
    State(state): State<CacheState>,
    Query(params): Query<InsertParams>,
    headers: HeaderMap,
) -> Result<ApiResponse> {
    // The scope token both authorizes the insert and carries the
    // logical timestamp compared against invalidations.
    let claims = state
        .signer
        .verify_cache_scope(bearer(&headers)?, params.model_id)?;
    let stored = state
        .cache
        .insert(params.model_id, &params.query, &params.llm_res, claims.iat)?;
    Ok(ApiResponse::ok(
        if stored { "cached" } else { "discarded (stale)" },
        serde_json::json!({ "stored": stored }),
    ))
}

#[derive(Debug, Deserialize)]
struct InvalidateParams {
    model_id: Uuid,
}

async fn invalidate(
    State(state): State<CacheState>,
    Query(params): Query<InvalidateParams>,
) -> Result<ApiResponse> {
    let removed = state
        .cache
        .invalidate(params.model_id, Utc::now().timestamp())?;
    Ok(ApiResponse::ok(
        "cache invalidated",
        serde_json::json!({ "removed": removed }),
    ))
}

#[derive(Debug, Deserialize)]
struct TokenParams {
    model_id: Uuid,
    user_id: Uuid,
}

async fn token(
    State(state): State<CacheState>,
    Query(params): Query<TokenParams>,
) -> Result<ApiResponse> {
    let token = state
        .signer
        .issue_cache_scope(params.user_id, params.model_id)?;
    Ok(ApiResponse::ok(
        "token issued",
        serde_json::json!({ "access_token": token }),
    ))
}
