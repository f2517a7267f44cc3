//! `POST /api/backup` — persist the backup configuration and trigger a
//! backup job on the scheduler.

use axum::extract::State;
use axum::{Extension, Json};

use mb_domain::envelope::ApiResponse;
use mb_domain::error::Result;

use crate::api::auth::{require_admin, CurrentUser};
use crate::backup::BackupConfig;
use crate::state::AppState;

pub async fn trigger(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Json(config): Json<BackupConfig>,
) -> Result<ApiResponse> {
    require_admin(&user)?;
    config.validate()?;
    let config_path = config.save(&state.config.model_bazaar_dir)?;
    tracing::info!(path = %config_path.display(), "backup config saved");

    let job_id = state.jobs.submit(state.jobs.builder().backup_job()).await?;
    Ok(ApiResponse::ok(
        "backup started",
        serde_json::json!({ "job_id": job_id }),
    ))
}
