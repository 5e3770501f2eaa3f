//! `Groq` LLM provider (OpenAI-compatible chat API).
//!
//! Used as the fast graph-LLM override for extraction-heavy workloads.

use async_trait::async_trait;
use reqwest::Client;

use crate::errors::{MemForgeError, MemForgeResult};

use super::azure::{ChatRequest, ChatResponse};
use super::{LlmProviderTrait, LlmRequest, LlmResponse};

const DEFAULT_BASE_URL: &str = "https://api.groq.com/openai/v1";

/// `Groq` chat provider.
pub struct GroqProvider {
    client: Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl GroqProvider {
    /// Create a new `Groq` provider.
    pub fn new(api_key: String, model: String, base_url: Option<String>) -> MemForgeResult<Self> {
        if api_key.is_empty() {
            return Err(MemForgeError::config("Groq api_key is required"));
        }
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(60))
            .pool_max_idle_per_host(10)
            .build()
            .map_err(|e| {
                MemForgeError::llm_provider("groq", format!("Failed to create HTTP client: {e}"))
            })?;

        Ok(Self {
            client,
            api_key,
            model,
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
        })
    }
}

#[async_trait]
impl LlmProviderTrait for GroqProvider {
    fn provider_name(&self) -> &str {
        "groq"
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, request: LlmRequest) -> MemForgeResult<LlmResponse> {
        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        let body = ChatRequest::from_request(&request, Some(self.model.clone()));

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| MemForgeError::llm_provider("groq", format!("Request failed: {e}")))?;

        if !response.status().is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(MemForgeError::llm_provider(
                "groq",
                format!("API error: {error_text}"),
            ));
        }

        let parsed: ChatResponse = response.json().await.map_err(|e| {
            MemForgeError::llm_provider("groq", format!("Failed to parse response: {e}"))
        })?;

        parsed.into_llm_response(&self.model)
    }
}
