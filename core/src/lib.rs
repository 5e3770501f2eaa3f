//! # MemForge Core
//!
//! The write-and-recall core of the MemForge agentic memory service:
//! the ingestion pipeline (intent classification, deduplication,
//! bi-temporal writes, asynchronous entity extraction), the hybrid search
//! engine (lexical + vector fused by reciprocal rank), and the graph data
//! model that binds them. Surfaces (HTTP, MCP) and the store binding live
//! in `memforge-server`; this crate talks to the store only through the
//! [`store::StoreDriver`] seam.

pub mod config;
pub mod embeddings;
pub mod errors;
pub mod llm;
pub mod memory;
pub mod store;
pub mod types;

// Re-export the types most callers need.
pub use config::{ConfigCache, ContextWindowConfig, DedupConfig, Settings, StoreSettings};
pub use embeddings::{EmbeddingBackend, EmbeddingConfig, EmbeddingHealth, EmbeddingRouter};
pub use errors::{MemForgeError, MemForgeResult};
pub use llm::{LlmClient, LlmConfig, LlmMessage, LlmRequest, LlmResponse};
pub use memory::{
    AddMemoriesRequest, AddMemoriesResponse, BulkIngester, BulkItem, BulkOptions, BulkOutcome,
    Categorizer, CommunityBuilder, DedupOutcome, DeduplicationEngine, EntityDirectory,
    EntityExtractor, HybridSearchEngine, IngestionOrchestrator, IntentClassifier, MemoryRecord,
    MemoryState, MemoryWriter, SearchFilters, SearchHit, SearchMemoryRequest, SearchMemoryResponse,
    SearchMode, SessionContext, TaskSupervisor,
};
pub use store::{CypherStatement, Row, SchemaInitializer, StoreDriver, StoreGateway};
pub use types::Hex32Id;

/// Version information.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
