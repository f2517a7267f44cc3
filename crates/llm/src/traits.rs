use mb_domain::error::Result;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Request / Response types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A provider-agnostic generation request.
#[derive(Debug, Clone, Default)]
pub struct GenerateRequest {
    /// The user's query.
    pub query: String,
    /// Retrieved reference passages grounding the answer.
    pub references: Vec<String>,
    /// Sampling temperature. `None` lets the provider choose.
    pub temperature: Option<f32>,
    /// Maximum tokens in the response. `None` lets the provider choose.
    pub max_tokens: Option<u32>,
    /// Model identifier override. When `None`, the provider uses its default.
    pub model: Option<String>,
}

impl GenerateRequest {
    /// The grounded prompt sent to every provider: references first,
    /// then the question.
    pub fn prompt(&self) -> String {
        if self.references.is_empty() {
            return self.query.clone();
        }
        let mut prompt = String::from("Answer the question using only these passages:\n\n");
        for (i, reference) in self.references.iter().enumerate() {
            prompt.push_str(&format!("[{}] {}\n", i + 1, reference));
        }
        prompt.push_str(&format!("\nQuestion: {}", self.query));
        prompt
    }
}

#[derive(Debug, Clone)]
pub struct GenerateResponse {
    pub text: String,
    /// The model that actually produced the response.
    pub model: String,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Core provider trait
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Trait every LLM adapter implements.
///
/// Implementations translate between [`GenerateRequest`] and the wire
/// format of each provider's HTTP API.
#[async_trait::async_trait]
pub trait LlmProvider: Send + Sync {
    /// Send a generation request and wait for the full response.
    async fn generate(&self, req: GenerateRequest) -> Result<GenerateResponse>;

    /// A unique identifier for this provider instance.
    fn provider_id(&self) -> &str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_grounds_on_references() {
        let req = GenerateRequest {
            query: "what is the term?".into(),
            references: vec!["The term is five years.".into()],
            ..Default::default()
        };
        let prompt = req.prompt();
        assert!(prompt.contains("[1] The term is five years."));
        assert!(prompt.ends_with("Question: what is the term?"));
    }

    #[test]
    fn prompt_without_references_is_the_query() {
        let req = GenerateRequest {
            query: "hello".into(),
            ..Default::default()
        };
        assert_eq!(req.prompt(), "hello");
    }
}
