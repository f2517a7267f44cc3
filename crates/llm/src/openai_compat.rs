//! OpenAI-compatible adapter.
//!
//! Covers OpenAI itself and self-hosted endpoints that speak the
//! `/v1/chat/completions` dialect (vLLM, llama.cpp servers, gateways).

use serde_json::Value;

use mb_domain::error::{Error, Result};

use crate::traits::{GenerateRequest, GenerateResponse, LlmProvider};

pub struct OpenAiCompatProvider {
    id: String,
    base_url: String,
    api_key: Option<String>,
    default_model: String,
    client: reqwest::Client,
}

impl OpenAiCompatProvider {
    pub fn new(
        id: impl Into<String>,
        base_url: impl Into<String>,
        api_key: Option<String>,
        default_model: Option<String>,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(60))
            .build()
            .map_err(|e| Error::Internal(format!("http client: {e}")))?;
        Ok(Self {
            id: id.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            default_model: default_model.unwrap_or_else(|| "gpt-4o-mini".into()),
            client,
        })
    }
}

#[async_trait::async_trait]
impl LlmProvider for OpenAiCompatProvider {
    async fn generate(&self, req: GenerateRequest) -> Result<GenerateResponse> {
        let model = req.model.clone().unwrap_or_else(|| self.default_model.clone());
        let mut body = serde_json::json!({
            "model": model,
            "messages": [{ "role": "user", "content": req.prompt() }],
        });
        if let Some(temp) = req.temperature {
            body["temperature"] = serde_json::json!(temp);
        }
        if let Some(max_tokens) = req.max_tokens {
            body["max_tokens"] = serde_json::json!(max_tokens);
        }

        let mut request = self
            .client
            .post(format!("{}/v1/chat/completions", self.base_url))
            .json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response: Value = request
            .send()
            .await
            .map_err(|e| Error::Internal(format!("provider {}: {e}", self.id)))?
            .error_for_status()
            .map_err(|e| Error::Internal(format!("provider {}: {e}", self.id)))?
            .json()
            .await
            .map_err(|e| Error::Internal(format!("provider {}: {e}", self.id)))?;

        let text = response["choices"][0]["message"]["content"]
            .as_str()
            .unwrap_or_default()
            .to_string();
        let model = response["model"].as_str().unwrap_or(&model).to_string();
        Ok(GenerateResponse { text, model })
    }

    fn provider_id(&self) -> &str {
        &self.id
    }
}
