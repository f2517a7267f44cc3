//! Deployment lifecycle endpoints.
//!
//! - `POST   /api/deploy/{model_id}`       — submit the deployment job
//! - `POST   /api/deploy/update-status`    — called by the worker itself
//! - `POST   /api/deploy/{model_id}/save`  — persist worker state, optionally
//!                                           registering a derived model
//! - `DELETE /api/deploy/{model_id}`       — stop the deployment

use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::{Extension, Json};
use chrono::Utc;
use serde::Deserialize;
use uuid::Uuid;

use mb_domain::envelope::ApiResponse;
use mb_domain::error::{Error, Result};
use mb_domain::model::{ModelOp, Status};
use mb_metadata::store::StatusKind;
use mb_metadata::Model;

use crate::api::auth::CurrentUser;
use crate::api::train::valid_name;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct DeployRequest {
    #[serde(default = "default_replicas")]
    pub replicas: u32,
    /// Optional token-classifier model composed in front of retrieval.
    #[serde(default)]
    pub guardrail_id: Option<Uuid>,
}

fn default_replicas() -> u32 {
    1
}

pub async fn deploy(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Path(model_id): Path<Uuid>,
    Json(req): Json<DeployRequest>,
) -> Result<ApiResponse> {
    state.permissions.authorize(user.id, model_id, ModelOp::Write)?;
    let model = state.store.model(model_id)?;

    if model.train_status != Status::Complete {
        return Err(Error::PreconditionFailed(format!(
            "model is not trained (train_status={})",
            model.train_status
        )));
    }
    if matches!(
        model.deploy_status,
        Status::Starting | Status::InProgress | Status::Complete
    ) {
        return Err(Error::PreconditionFailed(format!(
            "a deployment is already live (deploy_status={})",
            model.deploy_status
        )));
    }
    if let Some(guardrail_id) = req.guardrail_id {
        state.store.model(guardrail_id)?;
        state
            .permissions
            .authorize(user.id, guardrail_id, ModelOp::Read)?;
    }

    state.store.transition(
        model_id,
        StatusKind::Deploy,
        Status::Starting,
        Some("deployment requested".to_string()),
    )?;

    let job_token = state.signer.issue_job(model_id)?;
    let model_type = serde_json::to_value(model.model_type)?
        .as_str()
        .unwrap_or("ndb")
        .to_string();
    let spec = state.jobs.builder().deploy_job(
        model_id,
        &model_type,
        &job_token,
        req.guardrail_id,
        req.replicas,
    );
    let deployment_id = match state.jobs.submit(spec).await {
        Ok(job_id) => job_id,
        Err(e) => {
            state.store.transition(
                model_id,
                StatusKind::Deploy,
                Status::Failed,
                Some(format!("deployment submission failed: {e}")),
            )?;
            return Err(e);
        }
    };

    tracing::info!(model_id = %model_id, deployment_id = %deployment_id, "deployment submitted");
    Ok(ApiResponse::ok(
        "deployment started",
        serde_json::json!({ "deployment_id": deployment_id }),
    ))
}

#[derive(Debug, Deserialize)]
pub struct UpdateStatusRequest {
    pub model_id: Uuid,
    pub status: Status,
    #[serde(default)]
    pub message: Option<String>,
}

/// Job-token authenticated: the worker reports its own lifecycle here
/// so the metadata store reflects reality even when the job crashes.
pub async fn update_status(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<UpdateStatusRequest>,
) -> Result<ApiResponse> {
    let token = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or_else(|| Error::Unauthorized("missing job token".into()))?;
    let claims = state.signer.verify_job(token)?;
    if claims.model_id != req.model_id {
        return Err(Error::Forbidden(
            "job token is not scoped to this model".into(),
        ));
    }

    let model = state
        .store
        .transition(req.model_id, StatusKind::Deploy, req.status, req.message)?;
    tracing::info!(model_id = %req.model_id, status = %req.status, "deploy status reported");
    Ok(ApiResponse::ok(
        "status updated",
        serde_json::json!({ "deploy_status": model.deploy_status }),
    ))
}

#[derive(Debug, Deserialize)]
pub struct SaveRequest {
    /// Register the saved state as a new derived model under this name.
    #[serde(default)]
    pub model_name: Option<String>,
}

pub async fn save(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Path(model_id): Path<Uuid>,
    Json(req): Json<SaveRequest>,
) -> Result<ApiResponse> {
    state.permissions.authorize(user.id, model_id, ModelOp::Write)?;
    let model = state.store.model(model_id)?;
    if model.deploy_status != Status::Complete {
        return Err(Error::PreconditionFailed(
            "no live deployment to save".into(),
        ));
    }

    // Ask the worker (via service discovery) to flush its state.
    let service = state
        .scheduler
        .get_service_info(&model.deploy_job_name())
        .await?
        .ok_or_else(|| Error::NotFound("deployment service not registered".into()))?;
    let job_token = state.signer.issue_job(model_id)?;
    let url = format!(
        "http://{}:{}/{model_id}/save",
        service.address, service.port
    );
    let response = state
        .http
        .post(&url)
        .bearer_auth(&job_token)
        .timeout(std::time::Duration::from_secs(60))
        .send()
        .await
        .map_err(|e| Error::Internal(format!("worker save call failed: {e}")))?;
    if !response.status().is_success() {
        return Err(Error::Internal(format!(
            "worker save returned {}",
            response.status()
        )));
    }

    // Optionally register the snapshot as a derived model.
    let derived = match req.model_name {
        Some(name) => {
            if !valid_name(&name) {
                return Err(Error::InvalidArgument(format!(
                    "{name} is not a valid model name"
                )));
            }
            let new_id = Uuid::new_v4();
            copy_artifact(
                &state.config.model_dir(&model_id),
                &state.config.model_dir(&new_id),
            )?;
            let derived = state.store.create_model(
                Model {
                    id: new_id,
                    user_id: user.id,
                    team_id: model.team_id,
                    name,
                    model_type: model.model_type,
                    sub_type: model.sub_type,
                    domain: model.domain.clone(),
                    access_level: model.access_level,
                    parent_id: Some(model_id),
                    train_status: Status::Complete,
                    deploy_status: Status::NotStarted,
                    cache_refresh_status: Status::NotStarted,
                    status_message: None,
                    deleted: false,
                    created_at: Utc::now(),
                },
                false,
            )?;
            Some(derived.id)
        }
        None => None,
    };

    Ok(ApiResponse::ok(
        "model saved",
        serde_json::json!({ "model_id": model_id, "derived_model_id": derived }),
    ))
}

pub async fn undeploy(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Path(model_id): Path<Uuid>,
) -> Result<ApiResponse> {
    state.permissions.authorize(user.id, model_id, ModelOp::Write)?;
    let model = state.store.model(model_id)?;
    if !matches!(
        model.deploy_status,
        Status::Starting | Status::InProgress | Status::Complete
    ) {
        return Err(Error::PreconditionFailed(format!(
            "no live deployment (deploy_status={})",
            model.deploy_status
        )));
    }

    state.jobs.delete(&model.deploy_job_name()).await?;
    state.store.transition(
        model_id,
        StatusKind::Deploy,
        Status::Stopped,
        Some("undeployed".to_string()),
    )?;
    tracing::info!(model_id = %model_id, "deployment stopped");
    Ok(ApiResponse::ok("deployment stopped", serde_json::Value::Null))
}

/// Recursive artifact copy, skipping the writer lock.
fn copy_artifact(from: &std::path::Path, to: &std::path::Path) -> Result<()> {
    std::fs::create_dir_all(to)?;
    for entry in std::fs::read_dir(from)? {
        let entry = entry?;
        let name = entry.file_name();
        if name == "WRITER.lock" {
            continue;
        }
        let target = to.join(&name);
        if entry.file_type()?.is_dir() {
            copy_artifact(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}
