pub mod auth;
pub mod read;
pub mod update;

use axum::middleware;
use axum::routing::{get, post};
use axum::Router;

use mb_domain::envelope::ApiResponse;

use crate::state::WorkerState;

/// Build the worker router. All routes live under `/{model_id}`; the
/// health probe is public, everything else requires the job token.
pub fn router(state: WorkerState) -> Router<WorkerState> {
    let prefix = format!("/{}", state.config.model_id);

    let public = Router::new().route("/health", get(health));

    let protected = Router::new()
        .route("/predict", post(read::predict))
        .route("/insert", post(update::insert))
        .route("/delete", post(update::delete))
        .route("/upvote", post(update::upvote))
        .route("/implicit-upvote", post(update::implicit_upvote))
        .route("/associate", post(update::associate))
        .route("/save", post(update::save))
        .route_layer(middleware::from_fn_with_state(
            state,
            auth::require_job_token,
        ));

    Router::new().nest(&prefix, public.merge(protected))
}

async fn health() -> ApiResponse {
    ApiResponse::ok("ok", serde_json::Value::Null)
}
