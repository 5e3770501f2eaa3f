//! Nomic Atlas embedding provider.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use crate::errors::{MemForgeError, MemForgeResult};

use super::{EmbeddingConfig, EmbeddingProviderTrait};

const DEFAULT_BASE_URL: &str = "https://api-atlas.nomic.ai/v1";
const DEFAULT_MODEL: &str = "nomic-embed-text-v1.5";

/// Nomic text embedding provider (768-dimensional).
pub struct NomicEmbeddingProvider {
    client: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
    dimension: usize,
}

impl NomicEmbeddingProvider {
    /// Create a new Nomic provider from configuration.
    pub fn new(config: &EmbeddingConfig) -> MemForgeResult<Self> {
        if config.api_key.is_empty() {
            return Err(MemForgeError::config("Nomic api_key is required"));
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
impl EmbeddingProviderTrait for NomicEmbeddingProvider {
    fn provider_name(&self) -> &str {
        "nomic"
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed_batch(&self, texts: &[String]) -> MemForgeResult<Vec<Vec<f32>>> {
        let url = format!("{}/embedding/text", self.base_url.trim_end_matches('/'));
        let body = json!({
            "model": self.model,
            "texts": texts,
            "task_type": "search_document",
        });

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| MemForgeError::embedding(format!("Nomic request failed: {e}")))?;

        if !response.status().is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(MemForgeError::embedding(format!(
                "Nomic API error: {error_text}"
            )));
        }

        let parsed: EmbeddingsResponse = response
            .json()
            .await
            .map_err(|e| MemForgeError::embedding(format!("Failed to parse Nomic response: {e}")))?;

        Ok(parsed.embeddings)
    }
}

#[derive(Deserialize)]
struct EmbeddingsResponse {
    embeddings: Vec<Vec<f32>>,
}
