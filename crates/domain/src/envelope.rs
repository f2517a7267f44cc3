//! Uniform JSON response envelope.
//!
//! Every API endpoint — gateway, deployment worker, cache job — returns
//! `{"status": "success"|"failed", "message": ..., "data": ...}` with a
//! matching HTTP code.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde::{Deserialize, Serialize};

use crate::error::Error;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub status: EnvelopeStatus,
    pub message: String,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub data: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvelopeStatus {
    Success,
    Failed,
}

impl Envelope {
    pub fn success(message: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            status: EnvelopeStatus::Success,
            message: message.into(),
            data,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: EnvelopeStatus::Failed,
            message: message.into(),
            data: serde_json::Value::Null,
        }
    }
}

/// A `(status code, envelope)` pair that renders straight from a handler.
pub struct ApiResponse {
    pub code: StatusCode,
    pub body: Envelope,
}

impl ApiResponse {
    pub fn ok(message: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            code: StatusCode::OK,
            body: Envelope::success(message, data),
        }
    }
}

impl IntoResponse for ApiResponse {
    fn into_response(self) -> Response {
        (self.code, Json(self.body)).into_response()
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let code = self.status_code();
        if code.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }
        (code, Json(Envelope::failed(self.to_string()))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_serializes_lowercase_status() {
        let env = Envelope::success("ok", serde_json::json!({"model_id": "m1"}));
        let text = serde_json::to_string(&env).unwrap();
        assert!(text.contains("\"status\":\"success\""));
        assert!(text.contains("\"model_id\":\"m1\""));
    }

    #[test]
    fn failed_envelope_omits_null_data() {
        let env = Envelope::failed("nope");
        let text = serde_json::to_string(&env).unwrap();
        assert!(!text.contains("\"data\""));
    }
}
