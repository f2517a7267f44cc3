//! Test double for the provider trait.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use mb_domain::error::{Error, Result};

use crate::traits::{GenerateRequest, GenerateResponse, LlmProvider};

/// Returns a fixed answer and counts calls.
pub struct StubLlm {
    answer: String,
    calls: AtomicU32,
    failing: AtomicBool,
}

impl StubLlm {
    pub fn new(answer: impl Into<String>) -> Self {
        Self {
            answer: answer.into(),
            calls: AtomicU32::new(0),
            failing: AtomicBool::new(false),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::Relaxed)
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Relaxed);
    }
}

#[async_trait::async_trait]
impl LlmProvider for StubLlm {
    async fn generate(&self, _req: GenerateRequest) -> Result<GenerateResponse> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        if self.failing.load(Ordering::Relaxed) {
            return Err(Error::Internal("stub provider failing".into()));
        }
        Ok(GenerateResponse {
            text: self.answer.clone(),
            model: "stub-model".into(),
        })
    }

    fn provider_id(&self) -> &str {
        "stub"
    }
}
