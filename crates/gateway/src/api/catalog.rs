//! Generated-dataset catalog.
//!
//! - `GET  /api/catalog`  — list registered datasets
//! - `POST /api/catalog`  — admin registers one (usually called by a
//!   data-generation job when it finishes)

use axum::extract::State;
use axum::{Extension, Json};
use serde::Deserialize;
use uuid::Uuid;

use mb_domain::envelope::ApiResponse;
use mb_domain::error::Result;
use mb_metadata::CatalogEntry;

use crate::api::auth::{require_admin, CurrentUser};
use crate::state::AppState;

pub async fn list(
    State(state): State<AppState>,
    Extension(CurrentUser(_user)): Extension<CurrentUser>,
) -> Result<ApiResponse> {
    let entries = state.store.list_catalog();
    Ok(ApiResponse::ok(
        "catalog list",
        serde_json::json!({ "catalog": entries }),
    ))
}

#[derive(Debug, Deserialize)]
pub struct RegisterEntry {
    pub name: String,
    pub task: String,
    #[serde(default)]
    pub target_labels: Vec<String>,
    pub num_generated_samples: u64,
}

pub async fn register(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Json(req): Json<RegisterEntry>,
) -> Result<ApiResponse> {
    require_admin(&user)?;
    let entry = CatalogEntry {
        id: Uuid::new_v4(),
        name: req.name,
        task: req.task,
        target_labels: req.target_labels,
        num_generated_samples: req.num_generated_samples,
    };
    let id = entry.id;
    state.store.add_catalog_entry(entry)?;
    Ok(ApiResponse::ok(
        "catalog entry registered",
        serde_json::json!({ "id": id }),
    ))
}
