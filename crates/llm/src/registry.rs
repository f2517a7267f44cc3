//! Provider registry.
//!
//! Builds adapter instances from Integration rows at startup. A
//! provider that fails to initialize is logged and skipped rather than
//! aborting startup; callers asking for it later get an error.

use std::collections::HashMap;
use std::sync::Arc;

use mb_domain::error::{Error, Result};
use mb_domain::model::IntegrationType;
use mb_metadata::Integration;

use crate::anthropic::AnthropicProvider;
use crate::cohere::CohereProvider;
use crate::openai_compat::OpenAiCompatProvider;
use crate::traits::LlmProvider;

pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn LlmProvider>>,
}

impl ProviderRegistry {
    pub fn empty() -> Self {
        Self {
            providers: HashMap::new(),
        }
    }

    /// Instantiate an adapter for every Integration row.
    pub fn from_integrations(integrations: &[Integration]) -> Self {
        let mut providers: HashMap<String, Arc<dyn LlmProvider>> = HashMap::new();
        for integration in integrations {
            let id = integration.id.to_string();
            let data = &integration.data;
            let result: Result<Arc<dyn LlmProvider>> = match integration.integration_type {
                IntegrationType::Openai => OpenAiCompatProvider::new(
                    id.clone(),
                    data.base_url
                        .clone()
                        .unwrap_or_else(|| "https://api.openai.com".into()),
                    data.api_key.clone(),
                    data.model.clone(),
                )
                .map(|p| Arc::new(p) as Arc<dyn LlmProvider>),
                IntegrationType::SelfHosted => match &data.base_url {
                    Some(base_url) => OpenAiCompatProvider::new(
                        id.clone(),
                        base_url.clone(),
                        data.api_key.clone(),
                        data.model.clone(),
                    )
                    .map(|p| Arc::new(p) as Arc<dyn LlmProvider>),
                    None => Err(Error::InvalidArgument(
                        "self_hosted integration requires base_url".into(),
                    )),
                },
                IntegrationType::Anthropic => match &data.api_key {
                    Some(key) => AnthropicProvider::new(
                        id.clone(),
                        data.base_url.clone(),
                        key.clone(),
                        data.model.clone(),
                    )
                    .map(|p| Arc::new(p) as Arc<dyn LlmProvider>),
                    None => Err(Error::InvalidArgument(
                        "anthropic integration requires api_key".into(),
                    )),
                },
                IntegrationType::Cohere => match &data.api_key {
                    Some(key) => CohereProvider::new(
                        id.clone(),
                        data.base_url.clone(),
                        key.clone(),
                        data.model.clone(),
                    )
                    .map(|p| Arc::new(p) as Arc<dyn LlmProvider>),
                    None => Err(Error::InvalidArgument(
                        "cohere integration requires api_key".into(),
                    )),
                },
            };
            match result {
                Ok(provider) => {
                    tracing::info!(
                        provider_id = %id,
                        kind = ?integration.integration_type,
                        "registered LLM provider"
                    );
                    providers.insert(id, provider);
                }
                Err(e) => {
                    tracing::warn!(
                        provider_id = %id,
                        kind = ?integration.integration_type,
                        error = %e,
                        "failed to initialize LLM provider, skipping"
                    );
                }
            }
        }
        Self { providers }
    }

    pub fn get(&self, provider_id: &str) -> Result<Arc<dyn LlmProvider>> {
        self.providers
            .get(provider_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("llm provider {provider_id}")))
    }

    /// Any provider, when the caller doesn't care which.
    pub fn any(&self) -> Option<Arc<dyn LlmProvider>> {
        self.providers.values().next().cloned()
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mb_metadata::IntegrationData;
    use uuid::Uuid;

    fn integration(kind: IntegrationType, data: IntegrationData) -> Integration {
        Integration {
            id: Uuid::new_v4(),
            integration_type: kind,
            data,
        }
    }

    #[test]
    fn valid_integrations_register() {
        let rows = vec![
            integration(
                IntegrationType::Openai,
                IntegrationData {
                    api_key: Some("sk-test".into()),
                    ..Default::default()
                },
            ),
            integration(
                IntegrationType::Anthropic,
                IntegrationData {
                    api_key: Some("key".into()),
                    ..Default::default()
                },
            ),
        ];
        let registry = ProviderRegistry::from_integrations(&rows);
        assert_eq!(registry.len(), 2);
        assert!(registry.get(&rows[0].id.to_string()).is_ok());
    }

    #[test]
    fn misconfigured_integrations_are_skipped() {
        let rows = vec![integration(IntegrationType::SelfHosted, IntegrationData::default())];
        let registry = ProviderRegistry::from_integrations(&rows);
        assert!(registry.is_empty());
        assert!(registry.any().is_none());
    }
}
