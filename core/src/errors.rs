//! Error types for the MemForge core.
//!
//! All fallible operations in this crate return [`MemForgeResult`]. Variants
//! carry enough context to decide retry behavior at the gateway and HTTP
//! status mapping at the surface, without leaking internals to callers.

use thiserror::Error;

/// Result type used throughout the MemForge core.
pub type MemForgeResult<T> = Result<T, MemForgeError>;

/// Top-level error type for all MemForge operations.
#[derive(Error, Debug)]
pub enum MemForgeError {
    /// A request field was missing or ill-typed.
    #[error("Validation error for '{field}': {message}")]
    Validation {
        /// Name of the offending field.
        field: String,
        /// Human-readable description.
        message: String,
    },

    /// The addressed resource does not exist for the calling user.
    ///
    /// Ownership violations are deliberately reported as this variant so a
    /// foreign id is indistinguishable from a missing one.
    #[error("Not found: {0}")]
    NotFound(String),

    /// A failure reported by the graph store or its driver.
    #[error("Store error: {0}")]
    Store(String),

    /// A failure from a specific LLM provider backend.
    #[error("LLM provider '{provider}' error: {message}")]
    LlmProvider {
        /// Provider identifier (e.g. "azure_openai", "groq").
        provider: String,
        /// Human-readable description.
        message: String,
    },

    /// A generic LLM failure (parsing, empty response, timeout).
    #[error("LLM error: {0}")]
    Llm(String),

    /// A failure from the embedding backend.
    #[error("Embedding error: {0}")]
    Embedding(String),

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// JSON (de)serialization failure.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A memory-pipeline failure not covered by the other variants.
    #[error("Memory error: {0}")]
    Memory(String),

    /// A concurrency primitive failed (pool exhaustion, task join).
    #[error("Concurrency error: {0}")]
    Concurrency(String),
}

impl MemForgeError {
    /// Create a validation error.
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Create a not-found error.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    /// Create a store error.
    pub fn store(message: impl Into<String>) -> Self {
        Self::Store(message.into())
    }

    /// Create a provider-specific LLM error.
    pub fn llm_provider(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::LlmProvider {
            provider: provider.into(),
            message: message.into(),
        }
    }

    /// Create a generic LLM error.
    pub fn llm(message: impl Into<String>) -> Self {
        Self::Llm(message.into())
    }

    /// Create an embedding error.
    pub fn embedding(message: impl Into<String>) -> Self {
        Self::Embedding(message.into())
    }

    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Create a serialization error.
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization(message.into())
    }

    /// Create a memory-pipeline error.
    pub fn memory(message: impl Into<String>) -> Self {
        Self::Memory(message.into())
    }

    /// Create a concurrency error.
    pub fn concurrency(message: impl Into<String>) -> Self {
        Self::Concurrency(message.into())
    }
}

impl From<serde_json::Error> for MemForgeError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
