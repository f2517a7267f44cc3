//! Bearer-token authentication for the control-plane API.
//!
//! The middleware verifies the HS256 access token, loads the user row,
//! and stores a [`CurrentUser`] in the request extensions for handlers
//! to extract. Admin-only handlers call [`require_admin`].

use axum::body::Body;
use axum::extract::State;
use axum::http::Request;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use mb_domain::error::{Error, Result};
use mb_metadata::User;

use crate::state::AppState;

/// The authenticated caller, cloned into request extensions.
#[derive(Clone)]
pub struct CurrentUser(pub User);

pub async fn require_user(
    State(state): State<AppState>,
    mut req: Request<Body>,
    next: Next,
) -> Response {
    let token = req
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .unwrap_or("");

    let claims = match state.signer.verify_access(token) {
        Ok(claims) => claims,
        Err(e) => return e.into_response(),
    };
    let user = match state.store.user(claims.sub) {
        Ok(user) => user,
        Err(_) => {
            return Error::Unauthorized("token subject no longer exists".into()).into_response()
        }
    };

    req.extensions_mut().insert(CurrentUser(user));
    next.run(req).await
}

/// Guard for endpoints restricted to global admins.
pub fn require_admin(user: &User) -> Result<()> {
    if user.global_admin {
        Ok(())
    } else {
        Err(Error::Forbidden("global admin required".into()))
    }
}
