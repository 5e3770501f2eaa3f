//! The write-and-recall pipeline: intent classification, deduplication,
//! bi-temporal writes, asynchronous entity extraction, hybrid search, bulk
//! ingestion, and the tool-host orchestrator that binds them.

pub mod bulk;
pub mod categorize;
pub mod community;
pub mod dedup;
pub mod entities;
pub mod extraction;
pub mod intent;
pub mod orchestrator;
pub mod search;
pub mod tasks;
pub mod types;
pub mod writer;

pub use bulk::{BulkIngester, BulkItem, BulkOptions, BulkOutcome};
pub use categorize::{Categorizer, CATEGORY_VOCABULARY};
pub use community::{CommunityBuilder, CommunityRebuild};
pub use dedup::{DedupOutcome, DeduplicationEngine};
pub use entities::{EntityDirectory, EntityMatch, EntityRelationship};
pub use extraction::EntityExtractor;
pub use intent::IntentClassifier;
pub use orchestrator::{
    AddMemoriesRequest, AddMemoriesResponse, IngestionOrchestrator, SearchMemoryRequest,
    SearchMemoryResponse, SessionContext,
};
pub use search::{HybridSearchEngine, SearchFilters, SearchMode};
pub use tasks::{TaskHandle, TaskSupervisor};
pub use types::{
    EntityRecord, ExtractionStatus, HistoryAction, Intent, MemoryRecord, MemoryState, MetadataMap,
    SearchHit,
};
pub use writer::{AddOptions, MemoryWriter, WriteReceipt};
