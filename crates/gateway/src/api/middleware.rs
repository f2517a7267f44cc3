//! Cross-cutting request middleware: correlation ids, the global
//! request timeout, and the low-disk guard on mutating endpoints.

use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderValue, Method, Request};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use uuid::Uuid;

use mb_domain::error::Error;

use crate::state::AppState;

/// Attach a correlation id to every request and echo it in the
/// response. Errors logged downstream carry the same id.
pub async fn correlation_id(mut req: Request<Body>, next: Next) -> Response {
    let id = req
        .headers()
        .get("x-correlation-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    req.extensions_mut().insert(CorrelationId(id.clone()));
    let mut response = next.run(req).await;
    if let Ok(value) = HeaderValue::from_str(&id) {
        response.headers_mut().insert("x-correlation-id", value);
    }
    response
}

#[derive(Clone)]
pub struct CorrelationId(pub String);

/// Enforce the global request deadline; a breach returns `504` in the
/// standard envelope.
pub async fn request_timeout(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let deadline = std::time::Duration::from_secs(state.config.request_timeout_secs);
    match tokio::time::timeout(deadline, next.run(req)).await {
        Ok(response) => response,
        Err(_) => (
            axum::http::StatusCode::GATEWAY_TIMEOUT,
            axum::Json(mb_domain::envelope::Envelope::failed(format!(
                "request exceeded {}s deadline",
                deadline.as_secs()
            ))),
        )
            .into_response(),
    }
}

/// Refuse mutations while the shared filesystem is nearly full.
pub async fn disk_guard(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let mutating = matches!(*req.method(), Method::POST | Method::PUT | Method::DELETE);
    if mutating {
        let dir = &state.config.model_bazaar_dir;
        if let (Ok(available), Ok(total)) = (fs2::available_space(dir), fs2::total_space(dir)) {
            if total > 0 {
                let free_ratio = available as f64 / total as f64;
                if free_ratio < state.config.min_free_disk_ratio {
                    tracing::warn!(free_ratio, "rejecting mutation, disk nearly full");
                    return Error::LowDisk(format!(
                        "free disk below {:.0}%",
                        state.config.min_free_disk_ratio * 100.0
                    ))
                    .into_response();
                }
            }
        }
    }
    next.run(req).await
}
