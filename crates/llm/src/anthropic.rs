//! Anthropic Messages API adapter.

use serde_json::Value;

use mb_domain::error::{Error, Result};

use crate::traits::{GenerateRequest, GenerateResponse, LlmProvider};

const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";

pub struct AnthropicProvider {
    id: String,
    base_url: String,
    api_key: String,
    default_model: String,
    client: reqwest::Client,
}

impl AnthropicProvider {
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
            default_model: default_model.unwrap_or_else(|| "claude-3-5-haiku-latest".into()),
            client,
        })
    }
}

#[async_trait::async_trait]
impl LlmProvider for AnthropicProvider {
    async fn generate(&self, req: GenerateRequest) -> Result<GenerateResponse> {
        let model = req.model.clone().unwrap_or_else(|| self.default_model.clone());
        let mut body = serde_json::json!({
            "model": model,
            "max_tokens": req.max_tokens.unwrap_or(1024),
            "messages": [{ "role": "user", "content": req.prompt() }],
        });
        if let Some(temp) = req.temperature {
            body["temperature"] = serde_json::json!(temp);
        }

        let response: Value = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Internal(format!("provider {}: {e}", self.id)))?
            .error_for_status()
            .map_err(|e| Error::Internal(format!("provider {}: {e}", self.id)))?
            .json()
            .await
            .map_err(|e| Error::Internal(format!("provider {}: {e}", self.id)))?;

        // Concatenate text blocks; tool blocks are not requested.
        let text = response["content"]
            .as_array()
            .map(|blocks| {
                blocks
                    .iter()
                    .filter_map(|b| b["text"].as_str())
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default();
        let model = response["model"].as_str().unwrap_or(&model).to_string();
        Ok(GenerateResponse { text, model })
    }

    fn provider_id(&self) -> &str {
        &self.id
    }
}
