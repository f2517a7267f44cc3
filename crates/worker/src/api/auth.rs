//! Job-token authentication middleware.
//!
//! Every protected endpoint must carry `Authorization: Bearer
//! <JOB_TOKEN>`. The hash of the expected token is computed once at
//! startup and compared in constant time. A successful hit resets the
//! auto-idle timer.

use axum::body::Body;
use axum::extract::State;
use axum::http::Request;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use mb_domain::error::Error;

use crate::state::WorkerState;

pub async fn require_job_token(
    State(state): State<WorkerState>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let provided = req
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .unwrap_or("");

    let provided_hash = Sha256::digest(provided.as_bytes());
    if !bool::from(provided_hash.ct_eq(state.job_token_hash.as_slice())) {
        return Error::Unauthorized("invalid or missing job token".into()).into_response();
    }

    state.idle.touch();
    next.run(req).await
}
