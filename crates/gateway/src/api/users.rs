//! User endpoints.
//!
//! - `POST /api/user/signup`         — create an account (password backend)
//! - `POST /api/user/login`          — credentials → access token
//! - `POST /api/user/refresh`        — reissue against a still-valid token
//! - `POST /api/user/reset-request`  — mail a single-use reset code
//! - `POST /api/user/reset`          — consume the code, set a new password
//! - `GET  /api/user/list`           — admin
//! - `DELETE /api/user/{id}`         — admin; owned models are reassigned
//! - `POST /api/user/{id}/promote`   — admin

use axum::extract::{Path, State};
use axum::{Extension, Json};
use serde::Deserialize;
use uuid::Uuid;

use mb_domain::envelope::ApiResponse;
use mb_domain::error::Result;
use mb_identity::SignupRequest;

use crate::api::auth::{require_admin, CurrentUser};
use crate::state::AppState;

pub async fn signup(
    State(state): State<AppState>,
    Json(req): Json<SignupRequest>,
) -> Result<ApiResponse> {
    let user = state.identity.create_user(req).await?;
    tracing::info!(username = %user.username, "user created");
    Ok(ApiResponse::ok(
        "user created",
        serde_json::json!({ "user_id": user.id, "username": user.username }),
    ))
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    /// Username or email.
    pub username: String,
    pub password: String,
}

pub async fn login(
    State(state): State<AppState>,
    Json(req): Json<LoginRequest>,
) -> Result<ApiResponse> {
    let user = state
        .identity
        .authenticate(&req.username, &req.password)
        .await?;
    let access_token = state.signer.issue_access(user.id)?;
    Ok(ApiResponse::ok(
        "login successful",
        serde_json::json!({
            "access_token": access_token,
            "user_id": user.id,
            "global_admin": user.global_admin,
        }),
    ))
}

pub async fn refresh(
    State(state): State<AppState>,
    headers: axum::http::HeaderMap,
) -> Result<ApiResponse> {
    // The route is behind the auth middleware, so the token here is
    // known-valid; reissue against it.
    let token = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .unwrap_or("");
    let access_token = state.signer.refresh(token)?;
    Ok(ApiResponse::ok(
        "token refreshed",
        serde_json::json!({ "access_token": access_token }),
    ))
}

#[derive(Debug, Deserialize)]
pub struct ResetRequest {
    pub email: String,
}

pub async fn reset_request(
    State(state): State<AppState>,
    Json(req): Json<ResetRequest>,
) -> Result<ApiResponse> {
    state.identity.request_password_reset(&req.email).await?;
    Ok(ApiResponse::ok("reset code sent", serde_json::Value::Null))
}

#[derive(Debug, Deserialize)]
pub struct ResetConfirm {
    pub email: String,
    pub code: String,
    pub new_password: String,
}

pub async fn reset(
    State(state): State<AppState>,
    Json(req): Json<ResetConfirm>,
) -> Result<ApiResponse> {
    state
        .identity
        .reset_password(&req.email, &req.code, &req.new_password)
        .await?;
    Ok(ApiResponse::ok("password reset", serde_json::Value::Null))
}

pub async fn list(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
) -> Result<ApiResponse> {
    require_admin(&user)?;
    let users: Vec<serde_json::Value> = state
        .store
        .list_users()
        .into_iter()
        .map(|u| {
            serde_json::json!({
                "id": u.id,
                "username": u.username,
                "email": u.email,
                "domain": u.domain,
                "global_admin": u.global_admin,
            })
        })
        .collect();
    Ok(ApiResponse::ok("user list", serde_json::json!({ "users": users })))
}

pub async fn delete(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Path(user_id): Path<Uuid>,
) -> Result<ApiResponse> {
    require_admin(&user)?;
    state.identity.delete_user(user_id).await?;
    tracing::info!(%user_id, "user deleted");
    Ok(ApiResponse::ok("user deleted", serde_json::Value::Null))
}

pub async fn promote(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Path(user_id): Path<Uuid>,
) -> Result<ApiResponse> {
    require_admin(&user)?;
    state.store.set_global_admin(user_id, true)?;
    Ok(ApiResponse::ok("user promoted", serde_json::Value::Null))
}
