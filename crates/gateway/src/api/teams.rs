//! Team endpoints.
//!
//! - `POST /api/team`                      — admin creates a team
//! - `GET  /api/team/list`
//! - `POST /api/team/{id}/members`         — add or re-role a member
//! - `DELETE /api/team/{id}/members/{uid}` — remove a member

use axum::extract::{Path, State};
use axum::{Extension, Json};
use serde::Deserialize;
use uuid::Uuid;

use mb_domain::envelope::ApiResponse;
use mb_domain::error::{Error, Result};
use mb_domain::model::TeamRole;

use crate::api::auth::{require_admin, CurrentUser};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateTeamRequest {
    pub name: String,
}

pub async fn create(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Json(req): Json<CreateTeamRequest>,
) -> Result<ApiResponse> {
    require_admin(&user)?;
    let team = state.store.create_team(&req.name)?;
    Ok(ApiResponse::ok(
        "team created",
        serde_json::json!({ "team_id": team.id, "name": team.name }),
    ))
}

pub async fn list(State(state): State<AppState>) -> Result<ApiResponse> {
    let teams: Vec<serde_json::Value> = state
        .store
        .list_teams()
        .into_iter()
        .map(|t| serde_json::json!({ "id": t.id, "name": t.name }))
        .collect();
    Ok(ApiResponse::ok("team list", serde_json::json!({ "teams": teams })))
}

#[derive(Debug, Deserialize)]
pub struct AddMemberRequest {
    pub user_id: Uuid,
    pub role: TeamRole,
}

/// Global admins and the team's admins may manage membership.
fn require_team_admin(state: &AppState, user: &mb_metadata::User, team_id: Uuid) -> Result<()> {
    if user.global_admin || state.store.team_role(user.id, team_id) == Some(TeamRole::TeamAdmin) {
        Ok(())
    } else {
        Err(Error::Forbidden("team admin required".into()))
    }
}

pub async fn add_member(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Path(team_id): Path<Uuid>,
    Json(req): Json<AddMemberRequest>,
) -> Result<ApiResponse> {
    require_team_admin(&state, &user, team_id)?;
    state.store.add_team_member(team_id, req.user_id, req.role)?;
    Ok(ApiResponse::ok("member added", serde_json::Value::Null))
}

pub async fn remove_member(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Path((team_id, user_id)): Path<(Uuid, Uuid)>,
) -> Result<ApiResponse> {
    require_team_admin(&state, &user, team_id)?;
    state.store.remove_team_member(team_id, user_id)?;
    Ok(ApiResponse::ok("member removed", serde_json::Value::Null))
}
