//! Embedding support for MemForge.
//!
//! One backend is selected by configuration at boot and used for every
//! embedding in the process: memory content, entity descriptions, and search
//! queries all share the same vector space. Switching backends changes the
//! vector dimension, invalidates all stored embeddings, and requires the
//! schema initializer to be rerun.

mod azure;
mod intelli;
mod nomic;

pub use azure::AzureEmbeddingProvider;
pub use intelli::IntelliEmbeddingProvider;
pub use nomic::NomicEmbeddingProvider;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::{MemForgeError, MemForgeResult};

/// Supported embedding backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingBackend {
    /// Intelli embedding service (default), 1024 dimensions.
    Intelli,
    /// `Azure OpenAI` embedding deployment, 1536 dimensions.
    Azure,
    /// Nomic Atlas text embeddings, 768 dimensions.
    Nomic,
}

impl EmbeddingBackend {
    /// Native vector dimension of the backend.
    pub fn default_dimension(&self) -> usize {
        match self {
            Self::Intelli => 1024,
            Self::Azure => 1536,
            Self::Nomic => 768,
        }
    }

    /// Parse a backend name, case-insensitively.
    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "azure" => Self::Azure,
            "nomic" => Self::Nomic,
            _ => Self::Intelli,
        }
    }
}

/// Configuration for the embedding layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    /// Which backend to use.
    pub backend: EmbeddingBackend,
    /// API key for the backend.
    pub api_key: String,
    /// Model name (backend-specific default when empty).
    pub model: String,
    /// Custom base URL (intelli, nomic).
    pub base_url: Option<String>,
    /// Azure endpoint URL.
    pub endpoint: Option<String>,
    /// Azure deployment name.
    pub deployment_name: Option<String>,
    /// Azure API version.
    pub api_version: Option<String>,
    /// Override the reported vector dimension.
    pub dimension_override: Option<usize>,
    /// Request timeout in seconds.
    pub timeout_seconds: Option<u64>,
}

impl EmbeddingConfig {
    /// A config for the given backend with everything else defaulted.
    pub fn for_backend(backend: EmbeddingBackend, api_key: impl Into<String>) -> Self {
        Self {
            backend,
            api_key: api_key.into(),
            model: String::new(),
            base_url: None,
            endpoint: None,
            deployment_name: None,
            api_version: None,
            dimension_override: None,
            timeout_seconds: None,
        }
    }

    /// Effective vector dimension (override wins).
    pub fn dimension(&self) -> usize {
        self.dimension_override
            .unwrap_or_else(|| self.backend.default_dimension())
    }
}

/// Trait all embedding providers implement.
#[async_trait]
pub trait EmbeddingProviderTrait: Send + Sync {
    /// Provider identifier.
    fn provider_name(&self) -> &str;

    /// Model identifier.
    fn model_name(&self) -> &str;

    /// Native vector dimension.
    fn dimension(&self) -> usize;

    /// Embed a batch of texts, preserving input order.
    async fn embed_batch(&self, texts: &[String]) -> MemForgeResult<Vec<Vec<f32>>>;
}

/// Factory for creating embedding providers.
pub struct EmbeddingProviderFactory;

impl EmbeddingProviderFactory {
    /// Create a provider from configuration.
    pub fn create_provider(
        config: &EmbeddingConfig,
    ) -> MemForgeResult<Arc<dyn EmbeddingProviderTrait>> {
        match config.backend {
            EmbeddingBackend::Intelli => Ok(Arc::new(IntelliEmbeddingProvider::new(config)?)),
            EmbeddingBackend::Azure => Ok(Arc::new(AzureEmbeddingProvider::new(config)?)),
            EmbeddingBackend::Nomic => Ok(Arc::new(NomicEmbeddingProvider::new(config)?)),
        }
    }
}

/// Result of an embedding health probe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingHealth {
    /// Whether a probe embedding succeeded.
    pub ok: bool,
    /// Probe round-trip latency.
    pub latency_ms: u64,
    /// Model identifier.
    pub model: String,
    /// Vector dimension.
    pub dim: usize,
    /// Failure description when `ok` is false.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// High-level embedding front door: one selected backend, single and
/// batched embedding, health probe.
#[derive(Clone)]
pub struct EmbeddingRouter {
    provider: Arc<dyn EmbeddingProviderTrait>,
    backend: EmbeddingBackend,
    dimension: usize,
}

impl EmbeddingRouter {
    /// Select and construct the backend from configuration.
    pub fn new(config: &EmbeddingConfig) -> MemForgeResult<Self> {
        let provider = EmbeddingProviderFactory::create_provider(config)?;
        Ok(Self {
            provider,
            backend: config.backend,
            dimension: config.dimension(),
        })
    }

    /// Wrap an existing provider (used by tests with deterministic fakes).
    pub fn from_provider(
        provider: Arc<dyn EmbeddingProviderTrait>,
        backend: EmbeddingBackend,
    ) -> Self {
        let dimension = provider.dimension();
        Self {
            provider,
            backend,
            dimension,
        }
    }

    /// Embed a single text.
    pub async fn embed(&self, text: &str) -> MemForgeResult<Vec<f32>> {
        let mut vectors = self.provider.embed_batch(&[text.to_string()]).await?;
        if vectors.is_empty() {
            return Err(MemForgeError::embedding("No embeddings returned"));
        }
        Ok(vectors.swap_remove(0))
    }

    /// Embed a batch of texts, preserving order. Empty input short-circuits.
    pub async fn embed_batch(&self, texts: &[String]) -> MemForgeResult<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let vectors = self.provider.embed_batch(texts).await?;
        if vectors.len() != texts.len() {
            return Err(MemForgeError::embedding(format!(
                "expected {} embeddings, got {}",
                texts.len(),
                vectors.len()
            )));
        }
        Ok(vectors)
    }

    /// The configured backend.
    pub fn backend(&self) -> EmbeddingBackend {
        self.backend
    }

    /// The vector dimension D every stored embedding uses.
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Provider identifier.
    pub fn provider_name(&self) -> &str {
        self.provider.provider_name()
    }

    /// Probe the backend with a tiny embedding call.
    pub async fn health_check(&self) -> EmbeddingHealth {
        let started = std::time::Instant::now();
        let result = self.provider.embed_batch(&["ping".to_string()]).await;
        let latency_ms = started.elapsed().as_millis() as u64;
        match result {
            Ok(_) => EmbeddingHealth {
                ok: true,
                latency_ms,
                model: self.provider.model_name().to_string(),
                dim: self.dimension,
                error: None,
            },
            Err(err) => EmbeddingHealth {
                ok: false,
                latency_ms,
                model: self.provider.model_name().to_string(),
                dim: self.dimension,
                error: Some(err.to_string()),
            },
        }
    }

    /// Cosine similarity between two vectors.
    pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
        if a.len() != b.len() {
            return 0.0;
        }
        let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
        let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm_a == 0.0 || norm_b == 0.0 {
            return 0.0;
        }
        dot / (norm_a * norm_b)
    }
}
