//! Query path.
//!
//! - `POST /{model_id}/predict` — ranked references, optional generated
//!   answer. Guardrail redaction happens before the query reaches
//!   retrieval.

use std::collections::HashMap;
use std::time::Instant;

use axum::extract::State;
use axum::Json;
use serde::Deserialize;

use mb_domain::envelope::ApiResponse;
use mb_domain::error::Result;
use mb_llm::GenerateRequest;

use crate::kernel::redact;
use crate::state::WorkerState;

#[derive(Debug, Deserialize)]
pub struct PredictRequest {
    pub query: String,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    /// Metadata equality constraints on candidate chunks.
    #[serde(default)]
    pub constraints: HashMap<String, String>,
    /// Also produce an LLM answer grounded on the references.
    #[serde(default)]
    pub generate_answer: bool,
}

fn default_top_k() -> usize {
    5
}

pub async fn predict(
    State(state): State<WorkerState>,
    Json(req): Json<PredictRequest>,
) -> Result<ApiResponse> {
    let started = Instant::now();

    let query = match &state.guardrail {
        Some(classifier) => redact(&req.query, classifier.as_ref()),
        None => req.query.clone(),
    };

    let references = state
        .kernel
        .get()
        .predict(&query, req.top_k, &req.constraints)?;

    let answer = if req.generate_answer {
        match &state.llm {
            Some(provider) => {
                let generated = provider
                    .generate(GenerateRequest {
                        query: query.clone(),
                        references: references.iter().map(|r| r.text.clone()).collect(),
                        ..Default::default()
                    })
                    .await;
                match generated {
                    Ok(response) => Some(response.text),
                    Err(e) => {
                        tracing::warn!(error = %e, "answer generation failed");
                        None
                    }
                }
            }
            None => None,
        }
    } else {
        None
    };

    state.telemetry.record(
        &query,
        req.top_k,
        references.len(),
        started.elapsed().as_millis() as u64,
    );

    Ok(ApiResponse::ok(
        "prediction complete",
        serde_json::json!({
            "query": query,
            "references": references,
            "answer": answer,
        }),
    ))
}
