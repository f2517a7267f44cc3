//! Proxies to the semantic LLM-cache singleton.
//!
//! The gateway authorizes the caller against the model, then forwards
//! to the cache job with a model-scope bearer token. The cache job's
//! address comes from scheduler service discovery.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use serde::Deserialize;
use uuid::Uuid;

use mb_domain::envelope::{ApiResponse, Envelope};
use mb_domain::error::{Error, Result};
use mb_domain::model::ModelOp;

use crate::api::auth::CurrentUser;
use crate::state::AppState;

const CACHE_SERVICE: &str = "llm-cache";

async fn cache_base_url(state: &AppState) -> Result<String> {
    let service = state
        .scheduler
        .get_service_info(CACHE_SERVICE)
        .await?
        .ok_or_else(|| Error::SchedulerUnavailable("llm-cache service not registered".into()))?;
    Ok(format!("http://{}:{}", service.address, service.port))
}

/// Forward a cache-job response verbatim (it already speaks the
/// standard envelope).
async fn forward(response: reqwest::Response) -> Response {
    let status =
        StatusCode::from_u16(response.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    match response.json::<Envelope>().await {
        Ok(envelope) => (status, Json(envelope)).into_response(),
        Err(e) => Error::Internal(format!("cache job response: {e}")).into_response(),
    }
}

#[derive(Debug, Deserialize)]
pub struct CacheQuery {
    pub model_id: Uuid,
    pub query: String,
}

pub async fn query(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Query(params): Query<CacheQuery>,
) -> Result<Response> {
    state
        .permissions
        .authorize(user.id, params.model_id, ModelOp::Read)?;
    let base = cache_base_url(&state).await?;
    let response = state
        .http
        .get(format!("{base}/cache/query"))
        .query(&[
            ("model_id", params.model_id.to_string()),
            ("query", params.query),
        ])
        .send()
        .await
        .map_err(|e| Error::SchedulerUnavailable(format!("cache job unreachable: {e}")))?;
    Ok(forward(response).await)
}

pub async fn suggestions(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Query(params): Query<CacheQuery>,
) -> Result<Response> {
    state
        .permissions
        .authorize(user.id, params.model_id, ModelOp::Read)?;
    let base = cache_base_url(&state).await?;
    let response = state
        .http
        .get(format!("{base}/cache/suggestions"))
        .query(&[
            ("model_id", params.model_id.to_string()),
            ("query", params.query),
        ])
        .send()
        .await
        .map_err(|e| Error::SchedulerUnavailable(format!("cache job unreachable: {e}")))?;
    Ok(forward(response).await)
}

#[derive(Debug, Deserialize)]
pub struct CacheInsert {
    pub model_id: Uuid,
    pub query: String,
    pub llm_res: String,
}

pub async fn insert(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Query(params): Query<CacheInsert>,
) -> Result<Response> {
    state
        .permissions
        .authorize(user.id, params.model_id, ModelOp::Read)?;
    let token = state.signer.issue_cache_scope(user.id, params.model_id)?;
    let base = cache_base_url(&state).await?;
    let response = state
        .http
        .post(format!("{base}/cache/insert"))
        .bearer_auth(token)
        .query(&[
            ("model_id", params.model_id.to_string()),
            ("query", params.query),
            ("llm_res", params.llm_res),
        ])
        .send()
        .await
        .map_err(|e| Error::SchedulerUnavailable(format!("cache job unreachable: {e}")))?;
    Ok(forward(response).await)
}

pub async fn invalidate(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Path(model_id): Path<Uuid>,
) -> Result<Response> {
    state.permissions.authorize(user.id, model_id, ModelOp::Write)?;
    let base = cache_base_url(&state).await?;
    let response = state
        .http
        .post(format!("{base}/cache/invalidate"))
        .query(&[("model_id", model_id.to_string())])
        .send()
        .await
        .map_err(|e| Error::SchedulerUnavailable(format!("cache job unreachable: {e}")))?;
    Ok(forward(response).await)
}

pub async fn token(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Path(model_id): Path<Uuid>,
) -> Result<ApiResponse> {
    state.permissions.authorize(user.id, model_id, ModelOp::Read)?;
    let token = state.signer.issue_cache_scope(user.id, model_id)?;
    Ok(ApiResponse::ok(
        "cache token issued",
        serde_json::json!({ "access_token": token }),
    ))
}
