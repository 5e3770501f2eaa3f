//! `Azure OpenAI` LLM provider implementation.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::errors::{MemForgeError, MemForgeResult};

use super::{LlmMessage, LlmProviderTrait, LlmRequest, LlmResponse, LlmRole, LlmUsage};

/// `Azure OpenAI` chat provider.
pub struct AzureOpenAiProvider {
    client: Client,
    api_key: String,
    deployment_name: String,
    endpoint: String,
    api_version: String,
}

impl AzureOpenAiProvider {
    /// Create a new `Azure OpenAI` provider.
    pub fn new(
        api_key: String,
        deployment_name: String,
        endpoint: String,
        api_version: String,
    ) -> MemForgeResult<Self> {
        if api_key.is_empty() {
            return Err(MemForgeError::config("Azure OpenAI api_key is required"));
        }
        if endpoint.is_empty() {
            return Err(MemForgeError::config("Azure OpenAI endpoint is required"));
        }
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(60))
            .pool_max_idle_per_host(10)
            .build()
            .map_err(|e| {
                MemForgeError::llm_provider("azure_openai", format!("Failed to create HTTP client: {e}"))
            })?;

        Ok(Self {
            client,
            api_key,
            deployment_name,
            endpoint,
            api_version,
        })
    }

    fn chat_url(&self) -> String {
        let endpoint = self.endpoint.trim_end_matches('/');
        format!(
            "{}/openai/deployments/{}/chat/completions?api-version={}",
            endpoint, self.deployment_name, self.api_version
        )
    }
}

#[async_trait]
impl LlmProviderTrait for AzureOpenAiProvider {
    fn provider_name(&self) -> &str {
        "azure_openai"
    }

    fn model_name(&self) -> &str {
        &self.deployment_name
    }

    async fn complete(&self, request: LlmRequest) -> MemForgeResult<LlmResponse> {
        let body = ChatRequest::from_request(&request, None);

        let response = self
            .client
            .post(self.chat_url())
            .header("api-key", &self.api_key)
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                MemForgeError::llm_provider("azure_openai", format!("Request failed: {e}"))
            })?;

        if !response.status().is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(MemForgeError::llm_provider(
                "azure_openai",
                format!("API error: {error_text}"),
            ));
        }

        let parsed: ChatResponse = response.json().await.map_err(|e| {
            MemForgeError::llm_provider("azure_openai", format!("Failed to parse response: {e}"))
        })?;

        parsed.into_llm_response(&self.deployment_name)
    }
}

// ---------------------------------------------------------------------------
// Wire types (OpenAI chat schema, shared by Azure deployments)
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub(super) struct ChatRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(super) model: Option<String>,
    pub(super) messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(super) max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(super) temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(super) response_format: Option<ResponseFormat>,
}

impl ChatRequest {
    pub(super) fn from_request(request: &LlmRequest, model: Option<String>) -> Self {
        Self {
            model,
            messages: request.messages.iter().map(ChatMessage::from).collect(),
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            response_format: request
                .json_response
                .then(|| ResponseFormat {
                    format_type: "json_object".to_string(),
                }),
        }
    }
}

#[derive(Serialize)]
pub(super) struct ResponseFormat {
    #[serde(rename = "type")]
    pub(super) format_type: String,
}

#[derive(Serialize)]
pub(super) struct ChatMessage {
    pub(super) role: String,
    pub(super) content: String,
}

impl From<&LlmMessage> for ChatMessage {
    fn from(message: &LlmMessage) -> Self {
        Self {
            role: match message.role {
                LlmRole::System => "system".to_string(),
                LlmRole::User => "user".to_string(),
                LlmRole::Assistant => "assistant".to_string(),
            },
            content: message.content.clone(),
        }
    }
}

#[derive(Deserialize)]
pub(super) struct ChatResponse {
    #[serde(default)]
    pub(super) model: Option<String>,
    pub(super) choices: Vec<ChatChoice>,
    #[serde(default)]
    pub(super) usage: Option<ChatUsage>,
}

impl ChatResponse {
    pub(super) fn into_llm_response(self, fallback_model: &str) -> MemForgeResult<LlmResponse> {
        let model = self
            .model
            .unwrap_or_else(|| fallback_model.to_string());
        let choice = self
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| MemForgeError::llm("No choices in response"))?;
        let usage = self.usage.unwrap_or_default();

        Ok(LlmResponse {
            content: choice.message.content.unwrap_or_default(),
            model,
            usage: LlmUsage {
                prompt_tokens: usage.prompt_tokens,
                completion_tokens: usage.completion_tokens,
            },
        })
    }
}

#[derive(Deserialize)]
pub(super) struct ChatChoice {
    pub(super) message: ChatChoiceMessage,
}

#[derive(Deserialize)]
pub(super) struct ChatChoiceMessage {
    #[serde(default)]
    pub(super) content: Option<String>,
}

#[derive(Deserialize, Default)]
pub(super) struct ChatUsage {
    #[serde(default)]
    pub(super) prompt_tokens: u32,
    #[serde(default)]
    pub(super) completion_tokens: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chat_url() {
        let provider = AzureOpenAiProvider::new(
            "key".to_string(),
            "gpt-4o-mini".to_string(),
            "https://example.openai.azure.com/".to_string(),
            "2024-10-21".to_string(),
        )
        .expect("provider should build");
        assert_eq!(
            provider.chat_url(),
            "https://example.openai.azure.com/openai/deployments/gpt-4o-mini/chat/completions?api-version=2024-10-21"
        );
    }

    #[test]
    fn test_missing_credentials_rejected() {
        assert!(AzureOpenAiProvider::new(
            String::new(),
            "d".to_string(),
            "https://e".to_string(),
            "v".to_string()
        )
        .is_err());
    }

    #[test]
    fn test_json_response_format() {
        let request = LlmRequest::new("classify").expect_json();
        let body = ChatRequest::from_request(&request, None);
        let json = serde_json::to_value(&body).expect("serializes");
        assert_eq!(json["response_format"]["type"], "json_object");
        assert!(json.get("model").is_none());
    }
}
