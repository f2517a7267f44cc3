//! Model catalog endpoints.
//!
//! - `GET  /api/model/public-list`        — no auth, public + trained
//! - `GET  /api/model/list`               — models the caller may read
//! - `GET  /api/model/{id}`               — detail
//! - `GET  /api/model/{id}/permissions`   — the caller's decision
//! - `POST /api/model/{id}/reset-status`  — admin escape hatch
//! - `DELETE /api/model/{id}`             — soft delete, stops deployment

use axum::extract::{Path, Query, State};
use axum::{Extension, Json};
use serde::Deserialize;
use uuid::Uuid;

use mb_domain::envelope::ApiResponse;
use mb_domain::error::Result;
use mb_domain::model::{AccessLevel, ModelOp, Status};
use mb_metadata::store::StatusKind;
use mb_metadata::Model;

use crate::api::auth::{require_admin, CurrentUser};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    /// Substring match on the model name.
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
}

fn matches(model: &Model, owner_name: &str, query: &ListQuery) -> bool {
    if let Some(name) = &query.name {
        if !model.name.contains(name.as_str()) {
            return false;
        }
    }
    if let Some(domain) = &query.domain {
        if &model.domain != domain {
            return false;
        }
    }
    if let Some(username) = &query.username {
        if owner_name != username {
            return false;
        }
    }
    true
}

fn model_info(state: &AppState, model: &Model) -> serde_json::Value {
    let owner = state
        .store
        .user(model.user_id)
        .map(|u| u.username)
        .unwrap_or_default();
    serde_json::json!({
        "model_id": model.id,
        "name": model.name,
        "type": model.model_type,
        "sub_type": model.sub_type,
        "owner": owner,
        "domain": model.domain,
        "access_level": model.access_level,
        "parent_id": model.parent_id,
        "train_status": model.train_status,
        "deploy_status": model.deploy_status,
        "status_message": model.status_message,
        "created_at": model.created_at,
    })
}

pub async fn public_list(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<ApiResponse> {
    let models: Vec<serde_json::Value> = state
        .store
        .list_models()
        .into_iter()
        .filter(|m| m.access_level == AccessLevel::Public && m.train_status == Status::Complete)
        .filter(|m| {
            let owner = state
                .store
                .user(m.user_id)
                .map(|u| u.username)
                .unwrap_or_default();
            matches(m, &owner, &query)
        })
        .map(|m| model_info(&state, &m))
        .collect();
    Ok(ApiResponse::ok(
        "public model list",
        serde_json::json!({ "models": models }),
    ))
}

pub async fn list(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Query(query): Query<ListQuery>,
) -> Result<ApiResponse> {
    let mut models = Vec::new();
    for model in state.store.list_models() {
        let decision = state.permissions.decision(user.id, model.id)?;
        if !decision.read {
            continue;
        }
        let owner = state
            .store
            .user(model.user_id)
            .map(|u| u.username)
            .unwrap_or_default();
        if matches(&model, &owner, &query) {
            models.push(model_info(&state, &model));
        }
    }
    Ok(ApiResponse::ok("model list", serde_json::json!({ "models": models })))
}

pub async fn get(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Path(model_id): Path<Uuid>,
) -> Result<ApiResponse> {
    state.permissions.authorize(user.id, model_id, ModelOp::Read)?;
    let model = state.store.model(model_id)?;
    let mut info = model_info(&state, &model);
    info["dependencies"] = serde_json::json!(state.store.dependencies_of(model_id));
    info["attributes"] = serde_json::json!(state
        .store
        .attributes_of(model_id)
        .into_iter()
        .map(|a| (a.key, a.value))
        .collect::<std::collections::BTreeMap<_, _>>());
    info["usage"] = serde_json::json!(state.store.usage_of(model_id));
    Ok(ApiResponse::ok("model detail", info))
}

pub async fn permissions(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Path(model_id): Path<Uuid>,
) -> Result<ApiResponse> {
    // The row must exist, but looking up your own permissions is not
    // itself permission-gated.
    state.store.model(model_id)?;
    let decision = state.permissions.decision(user.id, model_id)?;
    Ok(ApiResponse::ok(
        "permission decision",
        serde_json::json!({ "read": decision.read, "write": decision.write }),
    ))
}

#[derive(Debug, Deserialize)]
pub struct ResetStatusRequest {
    pub kind: String,
}

pub async fn reset_status(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Path(model_id): Path<Uuid>,
    Json(req): Json<ResetStatusRequest>,
) -> Result<ApiResponse> {
    require_admin(&user)?;
    let kind = match req.kind.as_str() {
        "train" => StatusKind::Train,
        "deploy" => StatusKind::Deploy,
        "cache_refresh" => StatusKind::CacheRefresh,
        other => {
            return Err(mb_domain::error::Error::InvalidArgument(format!(
                "unknown status kind {other:?}"
            )))
        }
    };
    let model = state.store.reset_status(model_id, kind)?;
    tracing::warn!(model_id = %model_id, kind = %req.kind, "status reset by admin");
    Ok(ApiResponse::ok("status reset", model_info(&state, &model)))
}

pub async fn delete(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Path(model_id): Path<Uuid>,
) -> Result<ApiResponse> {
    state.permissions.authorize(user.id, model_id, ModelOp::Write)?;
    let model = state.store.model(model_id)?;

    // Stop a live deployment before hiding the row. The artifact stays
    // on disk for the backup retention policy.
    if matches!(
        model.deploy_status,
        Status::Starting | Status::InProgress | Status::Complete
    ) {
        state.jobs.delete(&model.deploy_job_name()).await?;
    }
    state.store.delete_model(model_id)?;
    tracing::info!(model_id = %model_id, "model deleted");
    Ok(ApiResponse::ok("model deleted", serde_json::Value::Null))
}
