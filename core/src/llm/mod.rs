//! LLM provider abstraction.
//!
//! MemForge uses chat completion with JSON response formatting for intent
//! classification, dedup pair verification, entity extraction,
//! categorization, and community summaries. Providers are interchangeable
//! behind [`LlmProviderTrait`]; the [`LlmClient`] wrapper adds the per-call
//! timeout and single-retry budget every call site relies on.

mod azure;
mod groq;

pub use azure::AzureOpenAiProvider;
pub use groq::GroqProvider;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::{MemForgeError, MemForgeResult};

/// Default per-call timeout.
pub const DEFAULT_LLM_TIMEOUT_SECS: u64 = 30;

/// Role of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmRole {
    /// System instruction.
    System,
    /// End-user turn.
    User,
    /// Model turn (few-shot examples).
    Assistant,
}

/// A single chat message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmMessage {
    /// Message role.
    pub role: LlmRole,
    /// Message text.
    pub content: String,
}

impl LlmMessage {
    /// A system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: LlmRole::System,
            content: content.into(),
        }
    }

    /// A user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: LlmRole::User,
            content: content.into(),
        }
    }

    /// An assistant message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: LlmRole::Assistant,
            content: content.into(),
        }
    }
}

/// A chat completion request.
#[derive(Debug, Clone)]
pub struct LlmRequest {
    /// Conversation messages, in order.
    pub messages: Vec<LlmMessage>,
    /// Completion token cap.
    pub max_tokens: Option<u32>,
    /// Sampling temperature. Pipeline calls pin this to 0.
    pub temperature: Option<f32>,
    /// Request a single JSON object as the response body.
    pub json_response: bool,
}

impl LlmRequest {
    /// A request with one user message.
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            messages: vec![LlmMessage::user(prompt)],
            max_tokens: None,
            temperature: None,
            json_response: false,
        }
    }

    /// A request from explicit messages.
    pub fn from_messages(messages: Vec<LlmMessage>) -> Self {
        Self {
            messages,
            max_tokens: None,
            temperature: None,
            json_response: false,
        }
    }

    /// Set the completion token cap.
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    /// Set the sampling temperature.
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// Ask the provider for a single JSON object.
    pub fn expect_json(mut self) -> Self {
        self.json_response = true;
        self
    }
}

/// Token accounting reported by the provider.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LlmUsage {
    /// Prompt tokens consumed.
    pub prompt_tokens: u32,
    /// Completion tokens produced.
    pub completion_tokens: u32,
}

/// A chat completion response.
#[derive(Debug, Clone)]
pub struct LlmResponse {
    /// Response text.
    pub content: String,
    /// Model that produced it.
    pub model: String,
    /// Token usage.
    pub usage: LlmUsage,
}

/// Configuration for the supported LLM providers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "provider")]
pub enum LlmConfig {
    /// `Azure OpenAI` chat deployment.
    AzureOpenAi {
        /// API key for authentication.
        api_key: String,
        /// Deployment name to use.
        deployment_name: String,
        /// `Azure OpenAI` endpoint URL.
        endpoint: String,
        /// API version to use.
        api_version: String,
    },
    /// `Groq` (OpenAI-compatible), used as the fast graph-LLM override.
    Groq {
        /// API key for authentication.
        api_key: String,
        /// Model name to use.
        model: String,
        /// Optional custom base URL.
        base_url: Option<String>,
    },
    /// Unconfigured state - requires explicit configuration.
    Unconfigured {
        /// Error message explaining the configuration requirement.
        message: String,
    },
}

impl LlmConfig {
    /// Create `Azure OpenAI` configuration.
    pub fn azure_openai(
        api_key: impl Into<String>,
        deployment_name: impl Into<String>,
        endpoint: impl Into<String>,
        api_version: impl Into<String>,
    ) -> Self {
        Self::AzureOpenAi {
            api_key: api_key.into(),
            deployment_name: deployment_name.into(),
            endpoint: endpoint.into(),
            api_version: api_version.into(),
        }
    }

    /// Create `Groq` configuration.
    pub fn groq(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self::Groq {
            api_key: api_key.into(),
            model: model.into(),
            base_url: None,
        }
    }

    /// Get the provider name.
    pub fn provider_name(&self) -> &str {
        match self {
            Self::AzureOpenAi { .. } => "azure_openai",
            Self::Groq { .. } => "groq",
            Self::Unconfigured { .. } => "unconfigured",
        }
    }

    /// Get the model (or deployment) name.
    pub fn model_name(&self) -> &str {
        match self {
            Self::AzureOpenAi {
                deployment_name, ..
            } => deployment_name,
            Self::Groq { model, .. } => model,
            Self::Unconfigured { .. } => "none",
        }
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self::Unconfigured {
            message: "LLM provider not configured. Set an explicit configuration with \
                      LlmConfig::azure_openai() or LlmConfig::groq()."
                .to_string(),
        }
    }
}

/// Trait all LLM providers implement.
#[async_trait]
pub trait LlmProviderTrait: Send + Sync {
    /// Provider identifier.
    fn provider_name(&self) -> &str;

    /// Model identifier.
    fn model_name(&self) -> &str;

    /// Send a request and collect the full response.
    async fn complete(&self, request: LlmRequest) -> MemForgeResult<LlmResponse>;
}

/// Factory for creating providers from configuration.
pub struct LlmProviderFactory;

impl LlmProviderFactory {
    /// Create a provider from configuration.
    pub fn create_provider(config: LlmConfig) -> MemForgeResult<Arc<dyn LlmProviderTrait>> {
        match config {
            LlmConfig::AzureOpenAi {
                api_key,
                deployment_name,
                endpoint,
                api_version,
            } => Ok(Arc::new(AzureOpenAiProvider::new(
                api_key,
                deployment_name,
                endpoint,
                api_version,
            )?)),
            LlmConfig::Groq {
                api_key,
                model,
                base_url,
            } => Ok(Arc::new(GroqProvider::new(api_key, model, base_url)?)),
            LlmConfig::Unconfigured { message } => Err(MemForgeError::config(message)),
        }
    }
}

/// Provider wrapper enforcing the per-call timeout and retry budget.
///
/// Every outbound call is bounded by `timeout` (default 30 s) and retried at
/// most `max_retries` times (default 1). A timeout is treated like any other
/// LLM failure: callers fail open.
#[derive(Clone)]
pub struct LlmClient {
    provider: Arc<dyn LlmProviderTrait>,
    timeout: Duration,
    max_retries: u32,
}

impl LlmClient {
    /// Wrap a provider with default timeout and retry budget.
    pub fn new(provider: Arc<dyn LlmProviderTrait>) -> Self {
        Self {
            provider,
            timeout: Duration::from_secs(DEFAULT_LLM_TIMEOUT_SECS),
            max_retries: 1,
        }
    }

    /// Build a client directly from configuration.
    pub fn from_config(config: LlmConfig) -> MemForgeResult<Self> {
        Ok(Self::new(LlmProviderFactory::create_provider(config)?))
    }

    /// Override the per-call timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Provider identifier.
    pub fn provider_name(&self) -> &str {
        self.provider.provider_name()
    }

    /// Model identifier.
    pub fn model_name(&self) -> &str {
        self.provider.model_name()
    }

    /// Complete a request within the timeout, retrying once on failure.
    pub async fn complete(&self, request: LlmRequest) -> MemForgeResult<LlmResponse> {
        let mut last_err = None;
        for attempt in 0..=self.max_retries {
            let call = self.provider.complete(request.clone());
            match tokio::time::timeout(self.timeout, call).await {
                Ok(Ok(response)) => return Ok(response),
                Ok(Err(err)) => {
                    tracing::warn!(attempt, %err, provider = self.provider.provider_name(), "LLM call failed");
                    last_err = Some(err);
                }
                Err(_) => {
                    tracing::warn!(attempt, provider = self.provider.provider_name(), "LLM call timed out");
                    last_err = Some(MemForgeError::llm(format!(
                        "request timed out after {}s",
                        self.timeout.as_secs()
                    )));
                }
            }
        }
        Err(last_err.unwrap_or_else(|| MemForgeError::llm("no attempts made")))
    }

    /// Complete a request and parse the response body as one JSON object.
    ///
    /// Providers occasionally wrap JSON in markdown fences even when a JSON
    /// response format was requested; fences are stripped before parsing.
    pub async fn complete_json(&self, request: LlmRequest) -> MemForgeResult<serde_json::Value> {
        let response = self.complete(request.expect_json()).await?;
        let body = strip_code_fences(&response.content);
        serde_json::from_str(body)
            .map_err(|e| MemForgeError::llm(format!("response is not valid JSON: {e}")))
    }
}

/// Strip a single surrounding markdown code fence, if present.
fn strip_code_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.trim_start_matches(['\r', '\n'])
        .strip_suffix("```")
        .map_or(trimmed, str::trim_end)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_names() {
        let config = LlmConfig::azure_openai("key", "gpt-4o-mini", "https://x.openai.azure.com", "2024-10-21");
        assert_eq!(config.provider_name(), "azure_openai");
        assert_eq!(config.model_name(), "gpt-4o-mini");

        let config = LlmConfig::groq("key", "llama-3.3-70b-versatile");
        assert_eq!(config.provider_name(), "groq");
    }

    #[test]
    fn test_default_config_is_unconfigured() {
        assert!(LlmProviderFactory::create_provider(LlmConfig::default()).is_err());
    }

    #[test]
    fn test_strip_code_fences() {
        assert_eq!(strip_code_fences("{\"a\":1}"), "{\"a\":1}");
        assert_eq!(strip_code_fences("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_code_fences("```\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_code_fences("  {\"a\":1}  "), "{\"a\":1}");
    }

    #[test]
    fn test_request_builder() {
        let request = LlmRequest::new("hello")
            .with_max_tokens(100)
            .with_temperature(0.0)
            .expect_json();
        assert_eq!(request.messages.len(), 1);
        assert_eq!(request.max_tokens, Some(100));
        assert_eq!(request.temperature, Some(0.0));
        assert!(request.json_response);
    }
}
