//! `Azure OpenAI` embedding provider.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use crate::errors::{MemForgeError, MemForgeResult};

use super::{EmbeddingConfig, EmbeddingProviderTrait};

/// `Azure OpenAI` embedding provider (1536-dimensional deployments).
pub struct AzureEmbeddingProvider {
    client: reqwest::Client,
    api_key: String,
    deployment_name: String,
    endpoint: String,
    api_version: String,
    dimension: usize,
}

impl AzureEmbeddingProvider {
    /// Create a new `Azure` embedding provider from configuration.
    pub fn new(config: &EmbeddingConfig) -> MemForgeResult<Self> {
        let deployment_name = config
            .deployment_name
            .clone()
            .ok_or_else(|| MemForgeError::config("deployment_name is required for Azure"))?;
        let endpoint = config
            .endpoint
            .clone()
            .ok_or_else(|| MemForgeError::config("endpoint is required for Azure"))?;
        let api_version = config
            .api_version
            .clone()
            .unwrap_or_else(|| "2024-02-01".to_string());

        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(
                config.timeout_seconds.unwrap_or(30),
            ))
            .build()
            .map_err(|e| MemForgeError::embedding(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            api_key: config.api_key.clone(),
            deployment_name,
            endpoint,
            api_version,
            dimension: config.dimension(),
        })
    }

    fn embeddings_url(&self) -> String {
        let endpoint = self.endpoint.trim_end_matches('/');
        format!(
            "{}/openai/deployments/{}/embeddings?api-version={}",
            endpoint, self.deployment_name, self.api_version
        )
    }
}

#[async_trait]
impl EmbeddingProviderTrait for AzureEmbeddingProvider {
    fn provider_name(&self) -> &str {
        "azure"
    }

    fn model_name(&self) -> &str {
        &self.deployment_name
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed_batch(&self, texts: &[String]) -> MemForgeResult<Vec<Vec<f32>>> {
        let body = json!({ "input": texts });

        let response = self
            .client
            .post(self.embeddings_url())
            .header("api-key", &self.api_key)
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| MemForgeError::embedding(format!("Azure request failed: {e}")))?;

        if !response.status().is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(MemForgeError::embedding(format!(
                "Azure API error: {error_text}"
            )));
        }

        let parsed: EmbeddingsResponse = response
            .json()
            .await
            .map_err(|e| MemForgeError::embedding(format!("Failed to parse Azure response: {e}")))?;

        let mut data = parsed.data;
        data.sort_by_key(|item| item.index);
        Ok(data.into_iter().map(|item| item.embedding).collect())
    }
}

#[derive(Deserialize)]
struct EmbeddingsResponse {
    data: Vec<EmbeddingItem>,
}

#[derive(Deserialize)]
struct EmbeddingItem {
    #[serde(default)]
    index: usize,
    embedding: Vec<f32>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::EmbeddingBackend;

    #[test]
    fn test_embeddings_url() {
        let mut config = EmbeddingConfig::for_backend(EmbeddingBackend::Azure, "key");
        config.deployment_name = Some("text-embedding-3-small".to_string());
        config.endpoint = Some("https://example.openai.azure.com/".to_string());
        let provider = AzureEmbeddingProvider::new(&config).expect("provider should build");
        assert_eq!(
            provider.embeddings_url(),
            "https://example.openai.azure.com/openai/deployments/text-embedding-3-small/embeddings?api-version=2024-02-01"
        );
        assert_eq!(provider.dimension(), 1536);
    }

    #[test]
    fn test_missing_deployment_rejected() {
        let config = EmbeddingConfig::for_backend(EmbeddingBackend::Azure, "key");
        assert!(AzureEmbeddingProvider::new(&config).is_err());
    }
}
