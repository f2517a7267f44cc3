//! Public health probe.

use axum::extract::State;

use mb_domain::envelope::ApiResponse;

use crate::state::AppState;

pub async fn health(State(state): State<AppState>) -> ApiResponse {
    ApiResponse::ok(
        "ok",
        serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "models": state.store.list_models().len(),
        }),
    )
}
