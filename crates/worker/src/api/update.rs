//! Update path.
//!
//! - `POST /{model_id}/insert`         — validate files, append insert record
//! - `POST /{model_id}/delete`         — append delete record
//! - `POST /{model_id}/upvote`         — append upvote record
//! - `POST /{model_id}/implicit-upvote`— append implicit-upvote record
//! - `POST /{model_id}/associate`      — append associate record
//! - `POST /{model_id}/save`           — writer persists the snapshot
//!
//! Replicas never mutate the model here: every accepted update is one
//! flushed line in this replica's log, applied later by the writer. A
//! file that fails validation returns 4xx and is never appended.

use axum::extract::State;
use axum::Json;
use serde::Deserialize;
use uuid::Uuid;

use mb_domain::envelope::ApiResponse;
use mb_domain::error::{Error, Result};
use mb_domain::update::{FileInfo, UpdateRecord};

use crate::kernel::{parse_file, stage_file};
use crate::state::WorkerState;

#[derive(Debug, Deserialize)]
pub struct InsertRequest {
    pub documents: Vec<FileInfo>,
}

pub async fn insert(
    State(state): State<WorkerState>,
    Json(req): Json<InsertRequest>,
) -> Result<ApiResponse> {
    if req.documents.is_empty() {
        return Err(Error::InvalidArgument("no documents to insert".into()));
    }

    // Assign doc ids now so the logged record and the API response agree,
    // and validate every file before anything is appended.
    let staging = state.config.deployment_dir().join("staging");
    let mut documents = Vec::with_capacity(req.documents.len());
    for mut info in req.documents {
        if info.doc_id.is_none() {
            info.doc_id = Some(Uuid::new_v4().to_string());
        }
        let local = stage_file(&info, &staging).await?;
        parse_file(&info, &local)?;
        documents.push(info);
    }

    let doc_ids: Vec<String> = documents.iter().filter_map(|d| d.doc_id.clone()).collect();
    state
        .update_log
        .log(&UpdateRecord::Insert { documents })?;
    state.pending.record_append();

    Ok(ApiResponse::ok(
        "insert queued",
        serde_json::json!({ "doc_ids": doc_ids }),
    ))
}

#[derive(Debug, Deserialize)]
pub struct DeleteRequest {
    pub doc_ids: Vec<String>,
}

pub async fn delete(
    State(state): State<WorkerState>,
    Json(req): Json<DeleteRequest>,
) -> Result<ApiResponse> {
    if req.doc_ids.is_empty() {
        return Err(Error::InvalidArgument("no doc_ids to delete".into()));
    }
    state
        .update_log
        .log(&UpdateRecord::Delete { doc_ids: req.doc_ids.clone() })?;
    state.pending.record_append();
    Ok(ApiResponse::ok(
        "delete queued",
        serde_json::json!({ "doc_ids": req.doc_ids }),
    ))
}

#[derive(Debug, Deserialize)]
pub struct UpvoteRequest {
    pub chunk_ids: Vec<u64>,
    pub queries: Vec<String>,
}

pub async fn upvote(
    State(state): State<WorkerState>,
    Json(req): Json<UpvoteRequest>,
) -> Result<ApiResponse> {
    if req.chunk_ids.is_empty() || req.queries.is_empty() {
        return Err(Error::InvalidArgument(
            "upvote requires chunk_ids and queries".into(),
        ));
    }
    state.update_log.log(&UpdateRecord::Upvote {
        chunk_ids: req.chunk_ids,
        queries: req.queries,
    })?;
    state.pending.record_append();
    Ok(ApiResponse::ok("upvote queued", serde_json::Value::Null))
}

#[derive(Debug, Deserialize)]
pub struct ImplicitUpvoteRequest {
    pub chunk_id: u64,
    pub query: String,
    pub event_desc: String,
}

pub async fn implicit_upvote(
    State(state): State<WorkerState>,
    Json(req): Json<ImplicitUpvoteRequest>,
) -> Result<ApiResponse> {
    state.update_log.log(&UpdateRecord::ImplicitUpvote {
        chunk_id: req.chunk_id,
        query: req.query,
        event_desc: req.event_desc,
    })?;
    state.pending.record_append();
    Ok(ApiResponse::ok("feedback queued", serde_json::Value::Null))
}

#[derive(Debug, Deserialize)]
pub struct AssociateRequest {
    pub sources: Vec<String>,
    pub targets: Vec<String>,
}

pub async fn associate(
    State(state): State<WorkerState>,
    Json(req): Json<AssociateRequest>,
) -> Result<ApiResponse> {
    if req.sources.is_empty() || req.sources.len() != req.targets.len() {
        return Err(Error::InvalidArgument(
            "associate requires equally many sources and targets".into(),
        ));
    }
    state.update_log.log(&UpdateRecord::Associate {
        sources: req.sources,
        targets: req.targets,
    })?;
    state.pending.record_append();
    Ok(ApiResponse::ok("associate queued", serde_json::Value::Null))
}

/// Persist the current model state back to the artifact path. Only the
/// writer replica can do this; read replicas refuse.
pub async fn save(State(state): State<WorkerState>) -> Result<ApiResponse> {
    if !state.is_writer {
        return Err(Error::PreconditionFailed(
            "this replica is not the writer".into(),
        ));
    }
    let artifact = state.config.artifact_path();
    state.kernel.get().save(&artifact)?;
    std::fs::write(
        artifact.join("last_updated"),
        chrono::Utc::now().to_rfc3339(),
    )?;
    Ok(ApiResponse::ok("model saved", serde_json::Value::Null))
}
