//! Intelli embedding provider (OpenAI-compatible embeddings API).
//!
//! The default backend: 1024-dimensional vectors.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use crate::errors::{MemForgeError, MemForgeResult};

use super::{EmbeddingConfig, EmbeddingProviderTrait};

const DEFAULT_BASE_URL: &str = "https://api.intellinode.ai/v1";
const DEFAULT_MODEL: &str = "intelli-embed-v3";

/// Intelli embedding provider.
pub struct IntelliEmbeddingProvider {
    client: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
    dimension: usize,
}

impl IntelliEmbeddingProvider {
    /// Create a new Intelli provider from configuration.
    pub fn new(config: &EmbeddingConfig) -> MemForgeResult<Self> {
        if config.api_key.is_empty() {
            return Err(MemForgeError::config("Intelli api_key is required"));
        }
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(
                config.timeout_seconds.unwrap_or(30),
            ))
            .build()
            .map_err(|e| MemForgeError::embedding(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            api_key: config.api_key.clone(),
            model: if config.model.is_empty() {
                DEFAULT_MODEL.to_string()
            } else {
                config.model.clone()
            },
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            dimension: config.dimension(),
        })
    }
}

#[async_trait]
impl EmbeddingProviderTrait for IntelliEmbeddingProvider {
    fn provider_name(&self) -> &str {
        "intelli"
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed_batch(&self, texts: &[String]) -> MemForgeResult<Vec<Vec<f32>>> {
        let url = format!("{}/embeddings", self.base_url.trim_end_matches('/'));
        let body = json!({
            "model": self.model,
            "input": texts,
        });

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| MemForgeError::embedding(format!("Intelli request failed: {e}")))?;

        if !response.status().is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(MemForgeError::embedding(format!(
                "Intelli API error: {error_text}"
            )));
        }

        let parsed: EmbeddingsResponse = response
            .json()
            .await
            .map_err(|e| MemForgeError::embedding(format!("Failed to parse Intelli response: {e}")))?;

        // The API returns items with an index; sort to guarantee input order.
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
