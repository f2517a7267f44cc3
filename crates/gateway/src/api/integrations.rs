//! External LLM endpoint registry.
//!
//! - `GET  /api/integrations`  — list (API keys masked)
//! - `POST /api/integrations`  — admin registers or replaces one

use axum::extract::State;
use axum::{Extension, Json};
use serde::Deserialize;
use uuid::Uuid;

use mb_domain::envelope::ApiResponse;
use mb_domain::error::Result;
use mb_domain::model::IntegrationType;
use mb_metadata::{Integration, IntegrationData};

use crate::api::auth::{require_admin, CurrentUser};
use crate::state::AppState;

pub async fn list(
    State(state): State<AppState>,
    Extension(CurrentUser(_user)): Extension<CurrentUser>,
) -> Result<ApiResponse> {
    let integrations: Vec<serde_json::Value> = state
        .store
        .list_integrations()
        .into_iter()
        .map(|i| {
            serde_json::json!({
                "id": i.id,
                "type": i.integration_type,
                "base_url": i.data.base_url,
                "model": i.data.model,
                "has_api_key": i.data.api_key.is_some(),
            })
        })
        .collect();
    Ok(ApiResponse::ok(
        "integration list",
        serde_json::json!({ "integrations": integrations }),
    ))
}

#[derive(Debug, Deserialize)]
pub struct UpsertIntegration {
    #[serde(rename = "type")]
    pub integration_type: IntegrationType,
    #[serde(default)]
    pub data: IntegrationData,
}

pub async fn upsert(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Json(req): Json<UpsertIntegration>,
) -> Result<ApiResponse> {
    require_admin(&user)?;
    let integration = Integration {
        id: Uuid::new_v4(),
        integration_type: req.integration_type,
        data: req.data,
    };
    let id = integration.id;
    state.store.upsert_integration(integration)?;
    Ok(ApiResponse::ok(
        "integration saved",
        serde_json::json!({ "id": id }),
    ))
}
