//! `POST /api/train` — create a model row and submit its training job.
//!
//! Accepts JSON (`files` are shared-filesystem paths or S3/Azure/GCS
//! URIs) or multipart (an `options` JSON field plus uploaded file
//! parts, staged under `{MODEL_BAZAAR_DIR}/uploads/{model_id}`).
//!
//! Idempotent on `(owner, name)`: a duplicate fails with
//! `already_exists` unless the earlier attempt finished `failed` and
//! the caller sets `overwrite=true`.

use std::sync::OnceLock;

use axum::extract::{FromRequest, Multipart, Request, State};
use axum::{Extension, Json};
use chrono::Utc;
use serde::Deserialize;
use uuid::Uuid;

use mb_domain::envelope::ApiResponse;
use mb_domain::error::{Error, Result};
use mb_domain::model::{AccessLevel, ModelOp, ModelSubType, ModelType, Status};
use mb_metadata::store::StatusKind;
use mb_metadata::Model;

use crate::api::auth::CurrentUser;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct TrainRequest {
    pub name: String,
    #[serde(rename = "type")]
    pub model_type: ModelType,
    #[serde(default)]
    pub sub_type: ModelSubType,
    /// Shared-filesystem paths or cloud URIs. Multipart uploads are
    /// appended here after staging.
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub base_model_id: Option<Uuid>,
    #[serde(default)]
    pub overwrite: bool,
    #[serde(default)]
    pub access_level: Option<AccessLevel>,
    #[serde(default)]
    pub team_id: Option<Uuid>,
    /// Opaque training hyperparameters, passed through to the job.
    #[serde(default)]
    pub options: serde_json::Value,
}

/// `^[\w-]+$`
pub fn valid_name(name: &str) -> bool {
    static NAME_RE: OnceLock<regex::Regex> = OnceLock::new();
    NAME_RE
        .get_or_init(|| regex::Regex::new(r"^[\w-]+$").expect("static regex"))
        .is_match(name)
}

pub async fn train(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    req: Request,
) -> Result<ApiResponse> {
    let model_id = Uuid::new_v4();
    let content_type = req
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();

    let train_req = if content_type.starts_with("multipart/form-data") {
        let multipart = Multipart::from_request(req, &())
            .await
            .map_err(|e| Error::InvalidArgument(format!("bad multipart body: {e}")))?;
        parse_multipart(&state, model_id, multipart).await?
    } else {
        let Json(body): Json<TrainRequest> = Json::from_request(req, &())
            .await
            .map_err(|e| Error::InvalidArgument(format!("bad request body: {e}")))?;
        body
    };

    // ── Validate ─────────────────────────────────────────────────────
    if !valid_name(&train_req.name) {
        return Err(Error::InvalidArgument(format!(
            "{} is not a valid model name",
            train_req.name
        )));
    }
    if train_req.model_type.is_workflow() {
        return Err(Error::InvalidArgument(
            "workflow models are created through /api/workflow endpoints".into(),
        ));
    }
    if train_req.files.is_empty() {
        return Err(Error::InvalidArgument("no training data provided".into()));
    }
    if let Some(base_model_id) = train_req.base_model_id {
        state.store.model(base_model_id)?;
        state
            .permissions
            .authorize(user.id, base_model_id, ModelOp::Read)?;
    }

    // ── Persist intent ───────────────────────────────────────────────
    let model = state.store.create_model(
        Model {
            id: model_id,
            user_id: user.id,
            team_id: train_req.team_id,
            name: train_req.name.clone(),
            model_type: train_req.model_type,
            sub_type: train_req.sub_type,
            domain: user.domain.clone(),
            access_level: train_req.access_level.unwrap_or_default(),
            parent_id: train_req.base_model_id,
            train_status: Status::Starting,
            deploy_status: Status::NotStarted,
            cache_refresh_status: Status::NotStarted,
            status_message: None,
            deleted: false,
            created_at: Utc::now(),
        },
        train_req.overwrite,
    )?;

    // ── Submit ───────────────────────────────────────────────────────
    let job_token = state.signer.issue_job(model.id)?;
    let model_type = serde_json::to_value(train_req.model_type)?
        .as_str()
        .unwrap_or("ndb")
        .to_string();
    let mut spec = state.jobs.builder().train_job(
        model.id,
        &model_type,
        &job_token,
        &train_req.files,
        train_req.base_model_id,
    );
    if !train_req.options.is_null() {
        spec.env.insert(
            "TRAIN_OPTIONS".to_string(),
            serde_json::to_string(&train_req.options)?,
        );
    }

    if let Err(e) = state.jobs.submit(spec).await {
        // The row must not linger in `starting` when nothing runs.
        state.store.transition(
            model.id,
            StatusKind::Train,
            Status::Failed,
            Some(format!("job submission failed: {e}")),
        )?;
        return Err(e);
    }

    // Charge staged bytes to the model's usage counters.
    let bytes_stored: u64 = train_req
        .files
        .iter()
        .filter_map(|f| std::fs::metadata(f).ok())
        .map(|m| m.len())
        .sum();
    state.store.record_usage(model.id, 1, bytes_stored, 0.0)?;

    tracing::info!(model_id = %model.id, name = %model.name, "training started");
    Ok(ApiResponse::ok(
        "training started",
        serde_json::json!({ "model_id": model.id }),
    ))
}

/// Pull the `options` JSON field and stage every file part to the
/// shared filesystem.
async fn parse_multipart(
    state: &AppState,
    model_id: Uuid,
    mut multipart: Multipart,
) -> Result<TrainRequest> {
    let mut options: Option<TrainRequest> = None;
    let mut staged: Vec<String> = Vec::new();

    let upload_dir = state
        .config
        .model_bazaar_dir
        .join("uploads")
        .join(model_id.to_string());

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| Error::InvalidArgument(format!("bad multipart field: {e}")))?
    {
        let field_name = field.name().unwrap_or("").to_string();
        match field_name.as_str() {
            "options" => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| Error::InvalidArgument(format!("bad options field: {e}")))?;
                options = Some(
                    serde_json::from_str(&text)
                        .map_err(|e| Error::InvalidArgument(format!("bad options JSON: {e}")))?,
                );
            }
            "files" => {
                let file_name = field
                    .file_name()
                    .map(sanitize_file_name)
                    .ok_or_else(|| Error::InvalidArgument("file part without a name".into()))?;
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| Error::InvalidArgument(format!("bad file part: {e}")))?;
                std::fs::create_dir_all(&upload_dir)?;
                let path = upload_dir.join(file_name);
                std::fs::write(&path, &bytes)?;
                staged.push(path.display().to_string());
            }
            other => {
                return Err(Error::InvalidArgument(format!(
                    "unexpected multipart field {other:?}"
                )))
            }
        }
    }

    let mut train_req =
        options.ok_or_else(|| Error::InvalidArgument("missing options field".into()))?;
    train_req.files.extend(staged);
    Ok(train_req)
}

/// Strip any path components an upload filename tries to smuggle in.
fn sanitize_file_name(name: &str) -> String {
    std::path::Path::new(name)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("upload")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_regex_accepts_word_chars_and_dashes() {
        assert!(valid_name("docs"));
        assert!(valid_name("my-model_2"));
        assert!(!valid_name("bad name"));
        assert!(!valid_name("slash/y"));
        assert!(!valid_name(""));
    }

    #[test]
    fn file_names_cannot_escape_the_upload_dir() {
        assert_eq!(sanitize_file_name("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_file_name("report.pdf"), "report.pdf");
    }
}
