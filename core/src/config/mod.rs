//! Typed configuration for the MemForge core.
//!
//! The server binary loads the environment once into a [`Settings`] value
//! and hands it down; core components never read the environment
//! themselves. Runtime-tunable knobs (dedup thresholds) additionally live in
//! `:Config` store nodes behind the TTL [`ConfigCache`].

pub mod cache;

pub use cache::ConfigCache;

use serde::{Deserialize, Serialize};

use crate::embeddings::{EmbeddingBackend, EmbeddingConfig};
use crate::errors::MemForgeResult;
use crate::llm::LlmConfig;

/// Connection settings for the graph store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreSettings {
    /// Bolt URL (e.g. `bolt://localhost:7687`).
    pub url: String,
    /// Username.
    pub user: String,
    /// Password.
    pub password: String,
    /// Connection pool size.
    pub pool_size: usize,
    /// Pool acquisition timeout in seconds.
    pub acquisition_timeout_secs: u64,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            url: "bolt://localhost:7687".to_string(),
            user: String::new(),
            password: String::new(),
            pool_size: 25,
            acquisition_timeout_secs: 10,
        }
    }
}

/// Deduplication thresholds, keyed by embedding backend.
///
/// The effective threshold is resolved in exactly one place
/// ([`DedupConfig::effective_threshold`]); components never read the raw
/// fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupConfig {
    /// Master switch for pre-write dedup.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Generic similarity threshold.
    #[serde(default = "default_threshold")]
    pub threshold: f32,
    /// Threshold when the azure backend embeds.
    #[serde(default = "default_provider_threshold", rename = "azureThreshold")]
    pub azure_threshold: f32,
    /// Threshold when the intelli backend embeds.
    #[serde(default = "default_provider_threshold", rename = "intelliThreshold")]
    pub intelli_threshold: f32,
}

fn default_true() -> bool {
    true
}
fn default_threshold() -> f32 {
    0.75
}
fn default_provider_threshold() -> f32 {
    0.55
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: 0.75,
            azure_threshold: 0.55,
            intelli_threshold: 0.55,
        }
    }
}

impl DedupConfig {
    /// The threshold in effect for the configured embedding backend.
    pub fn effective_threshold(&self, backend: EmbeddingBackend) -> f32 {
        match backend {
            EmbeddingBackend::Azure => self.azure_threshold,
            EmbeddingBackend::Intelli => self.intelli_threshold,
            EmbeddingBackend::Nomic => self.threshold,
        }
    }
}

/// Recent-memory context window mixed into embedding text on add.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextWindowConfig {
    /// Feature flag; stored content is never affected.
    pub enabled: bool,
    /// Number of recent memories prefixed.
    pub size: usize,
}

impl Default for ContextWindowConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            size: 5,
        }
    }
}

/// Process-wide settings assembled from the environment by the server.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Graph store connection.
    pub store: StoreSettings,
    /// Embedding backend selection.
    pub embedding: EmbeddingConfig,
    /// Primary chat LLM.
    pub llm: LlmConfig,
    /// Model override for categorization calls.
    pub categorization_model: Option<String>,
    /// LLM provider requests-per-minute budget (drives bulk concurrency).
    pub requests_per_minute: u32,
    /// Context-window embedding feature.
    pub context_window: ContextWindowConfig,
}

impl Settings {
    /// Assemble settings from the process environment. Unrecognized keys
    /// are ignored; missing credentials leave the respective provider
    /// unconfigured rather than failing boot.
    pub fn from_env() -> MemForgeResult<Self> {
        let get = |key: &str| std::env::var(key).ok().filter(|v| !v.is_empty());

        let store = StoreSettings {
            url: get("MEMGRAPH_URL").unwrap_or_else(|| "bolt://localhost:7687".to_string()),
            user: get("MEMGRAPH_USER").unwrap_or_default(),
            password: get("MEMGRAPH_PASSWORD").unwrap_or_default(),
            ..StoreSettings::default()
        };

        let backend = get("EMBEDDING_PROVIDER")
            .map(|v| EmbeddingBackend::from_str_lossy(&v))
            .unwrap_or(EmbeddingBackend::Intelli);
        let mut embedding = match backend {
            EmbeddingBackend::Intelli => {
                let mut config = EmbeddingConfig::for_backend(
                    backend,
                    get("INTELLI_API_KEY").unwrap_or_default(),
                );
                config.base_url = get("INTELLI_BASE_URL");
                config
            }
            EmbeddingBackend::Azure => {
                let mut config = EmbeddingConfig::for_backend(
                    backend,
                    get("EMBEDDINGS_AZURE_OPENAI_API_KEY")
                        .or_else(|| get("MEMFORGE_AZURE_OPENAI_API_KEY"))
                        .unwrap_or_default(),
                );
                config.endpoint = get("EMBEDDINGS_AZURE_ENDPOINT")
                    .or_else(|| get("MEMFORGE_AZURE_ENDPOINT"));
                config.deployment_name = get("EMBEDDINGS_AZURE_DEPLOYMENT");
                config.api_version = get("EMBEDDINGS_AZURE_API_VERSION");
                config
            }
            EmbeddingBackend::Nomic => {
                EmbeddingConfig::for_backend(backend, get("NOMIC_API_KEY").unwrap_or_default())
            }
        };
        if let Some(dims) = get("EMBEDDING_DIMS").and_then(|v| v.parse::<usize>().ok()) {
            embedding.dimension_override = Some(dims);
        }

        // GROQ_API_KEY opts into the fast graph-LLM; Azure otherwise.
        let llm = if let Some(groq_key) = get("GROQ_API_KEY") {
            LlmConfig::groq(
                groq_key,
                get("GROQ_MODEL").unwrap_or_else(|| "llama-3.3-70b-versatile".to_string()),
            )
        } else if let Some(api_key) = get("MEMFORGE_AZURE_OPENAI_API_KEY") {
            LlmConfig::azure_openai(
                api_key,
                get("MEMFORGE_AZURE_DEPLOYMENT").unwrap_or_else(|| "gpt-4o-mini".to_string()),
                get("MEMFORGE_AZURE_ENDPOINT").unwrap_or_default(),
                get("MEMFORGE_AZURE_API_VERSION").unwrap_or_else(|| "2024-10-21".to_string()),
            )
        } else {
            LlmConfig::default()
        };

        Ok(Self {
            store,
            embedding,
            llm,
            categorization_model: get("MEMFORGE_CATEGORIZATION_MODEL"),
            requests_per_minute: get("OPENAI_REQUESTS_PER_MINUTE")
                .and_then(|v| v.parse().ok())
                .unwrap_or(100),
            context_window: ContextWindowConfig::default(),
        })
    }

    /// Bulk ingestion concurrency derived from the provider RPM budget.
    pub fn bulk_concurrency(&self) -> usize {
        (self.requests_per_minute as usize / 20).clamp(1, 5)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dedup_effective_threshold() {
        let config = DedupConfig::default();
        assert!((config.effective_threshold(EmbeddingBackend::Azure) - 0.55).abs() < f32::EPSILON);
        assert!(
            (config.effective_threshold(EmbeddingBackend::Intelli) - 0.55).abs() < f32::EPSILON
        );
        assert!((config.effective_threshold(EmbeddingBackend::Nomic) - 0.75).abs() < f32::EPSILON);
    }

    #[test]
    fn test_dedup_config_partial_json() {
        let config: DedupConfig =
            serde_json::from_str(r#"{"threshold": 0.8}"#).expect("partial config parses");
        assert!(config.enabled);
        assert!((config.threshold - 0.8).abs() < f32::EPSILON);
        assert!((config.azure_threshold - 0.55).abs() < f32::EPSILON);
    }

    #[test]
    fn test_settings_from_env() {
        temp_env::with_vars(
            [
                ("EMBEDDING_PROVIDER", Some("nomic")),
                ("NOMIC_API_KEY", Some("nk-123")),
                ("MEMGRAPH_URL", Some("bolt://db:7687")),
                ("GROQ_API_KEY", Some("gsk-456")),
                ("OPENAI_REQUESTS_PER_MINUTE", Some("40")),
            ],
            || {
                let settings = Settings::from_env().expect("settings load");
                assert_eq!(settings.embedding.backend, EmbeddingBackend::Nomic);
                assert_eq!(settings.embedding.dimension(), 768);
                assert_eq!(settings.store.url, "bolt://db:7687");
                assert_eq!(settings.llm.provider_name(), "groq");
                assert_eq!(settings.bulk_concurrency(), 2);
            },
        );
    }

    #[test]
    fn test_embedding_dims_override() {
        temp_env::with_vars(
            [
                ("EMBEDDING_PROVIDER", Some("intelli")),
                ("INTELLI_API_KEY", Some("ik")),
                ("EMBEDDING_DIMS", Some("512")),
                ("GROQ_API_KEY", None),
                ("MEMFORGE_AZURE_OPENAI_API_KEY", None),
            ],
            || {
                let settings = Settings::from_env().expect("settings load");
                assert_eq!(settings.embedding.dimension(), 512);
                assert_eq!(settings.llm.provider_name(), "unconfigured");
            },
        );
    }

    #[test]
    fn test_bulk_concurrency_clamped() {
        let mut settings = Settings {
            store: StoreSettings::default(),
            embedding: EmbeddingConfig::for_backend(EmbeddingBackend::Intelli, "k"),
            llm: LlmConfig::default(),
            categorization_model: None,
            requests_per_minute: 1000,
            context_window: ContextWindowConfig::default(),
        };
        assert_eq!(settings.bulk_concurrency(), 5);
        settings.requests_per_minute = 10;
        assert_eq!(settings.bulk_concurrency(), 1);
    }
}
