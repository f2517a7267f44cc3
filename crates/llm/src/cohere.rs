//! Cohere chat adapter.

use serde_json::Value;

use mb_domain::error::{Error, Result};

use crate::traits::{GenerateRequest, GenerateResponse, LlmProvider};

const DEFAULT_BASE_URL: &str = "https://api.cohere.com";

pub struct CohereProvider {
    id: String,
    base_url: String,
    api_key: String,
    default_model: String,
    client: reqwest::Client,
}

impl CohereProvider {
    pub fn new(
        id: impl Into<String>,
        base_url: Option<String>,
        api_key: String,
        default_model: Option<String>,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(60))
            .build()
            .map_err(|e| Error::Internal(format!("http client: {e}")))?;
        Ok(Self {
            id: id.into(),
            base_url: base_url
                .unwrap_or_else(|| DEFAULT_BASE_URL.into())
                .trim_end_matches('/')
                .to_string(),
            api_key,
            default_model: default_model.unwrap_or_else(|| "command-r".into()),
            client,
        })
    }
}

#[async_trait::async_trait]
impl LlmProvider for CohereProvider {
    async fn generate(&self, req: GenerateRequest) -> Result<GenerateResponse> {
        let model = req.model.clone().unwrap_or_else(|| self.default_model.clone());
        let mut body = serde_json::json!({
            "model": model,
            "message": req.prompt(),
        });
        if let Some(temp) = req.temperature {
            body["temperature"] = serde_json::json!(temp);
        }
        if let Some(max_tokens) = req.max_tokens {
            body["max_tokens"] = serde_json::json!(max_tokens);
        }

        let response: Value = self
            .client
            .post(format!("{}/v1/chat", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Internal(format!("provider {}: {e}", self.id)))?
            .error_for_status()
            .map_err(|e| Error::Internal(format!("provider {}: {e}", self.id)))?
            .json()
            .await
            .map_err(|e| Error::Internal(format!("provider {}: {e}", self.id)))?;

        let text = response["text"].as_str().unwrap_or_default().to_string();
        Ok(GenerateResponse { text, model })
    }

    fn provider_id(&self) -> &str {
        &self.id
    }
}
