//! Workflow composition.
//!
//! - `POST /api/workflow/enterprise-search` — compose a retrieval model
//!   with an optional guardrail classifier. Workflows never get a job;
//!   their value is the dependency rows.

use axum::extract::State;
use axum::{Extension, Json};
use chrono::Utc;
use serde::Deserialize;
use uuid::Uuid;

use mb_domain::envelope::ApiResponse;
use mb_domain::error::{Error, Result};
use mb_domain::model::{AccessLevel, ModelOp, ModelSubType, ModelType, Status};
use mb_metadata::Model;

use crate::api::auth::CurrentUser;
use crate::api::train::valid_name;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct EnterpriseSearchRequest {
    pub workflow_name: String,
    pub retrieval_id: Uuid,
    #[serde(default)]
    pub guardrail_id: Option<Uuid>,
    #[serde(default)]
    pub llm_provider: Option<String>,
    #[serde(default)]
    pub default_mode: Option<String>,
}

pub async fn enterprise_search(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Json(req): Json<EnterpriseSearchRequest>,
) -> Result<ApiResponse> {
    if !valid_name(&req.workflow_name) {
        return Err(Error::InvalidArgument(format!(
            "{} is not a valid model name",
            req.workflow_name
        )));
    }

    // The search component must be a retrieval model the caller can read.
    let retrieval = state.store.model(req.retrieval_id)?;
    if retrieval.model_type != ModelType::Ndb {
        return Err(Error::InvalidArgument(format!(
            "search component {} is not a retrieval model",
            req.retrieval_id
        )));
    }
    state
        .permissions
        .authorize(user.id, req.retrieval_id, ModelOp::Read)?;

    // The guardrail, when present, must be a token classifier.
    if let Some(guardrail_id) = req.guardrail_id {
        let guardrail = state.store.model(guardrail_id)?;
        if guardrail.model_type != ModelType::Udt || guardrail.sub_type != ModelSubType::Token {
            return Err(Error::InvalidArgument(format!(
                "guardrail component {guardrail_id} is not a token classifier"
            )));
        }
        state
            .permissions
            .authorize(user.id, guardrail_id, ModelOp::Read)?;
    }

    let mut dependencies = vec![req.retrieval_id];
    dependencies.extend(req.guardrail_id);

    let mut attributes = vec![("retrieval_id".to_string(), req.retrieval_id.to_string())];
    if let Some(guardrail_id) = req.guardrail_id {
        attributes.push(("guardrail_id".to_string(), guardrail_id.to_string()));
    }
    if let Some(llm_provider) = &req.llm_provider {
        attributes.push(("llm_provider".to_string(), llm_provider.clone()));
    }
    if let Some(default_mode) = &req.default_mode {
        attributes.push(("default_mode".to_string(), default_mode.clone()));
    }

    let workflow = state.store.create_workflow(
        Model {
            id: Uuid::new_v4(),
            user_id: user.id,
            team_id: None,
            name: req.workflow_name,
            model_type: ModelType::EnterpriseSearch,
            sub_type: ModelSubType::None,
            domain: user.domain.clone(),
            access_level: AccessLevel::Private,
            parent_id: None,
            // Workflows are compositions; there is nothing to train.
            train_status: Status::Complete,
            deploy_status: Status::NotStarted,
            cache_refresh_status: Status::NotStarted,
            status_message: None,
            deleted: false,
            created_at: Utc::now(),
        },
        dependencies,
        attributes,
    )?;

    tracing::info!(workflow_id = %workflow.id, name = %workflow.name, "workflow created");
    Ok(ApiResponse::ok(
        "workflow created",
        serde_json::json!({ "model_id": workflow.id }),
    ))
}
