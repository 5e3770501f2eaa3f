//! Process-lifecycle service construction.
//!
//! Every component is built once here and handed down by injection; there
//! are no global registration slots. Teardown drains the background task
//! supervisors.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;

use memforge_core::config::{ConfigCache, Settings};
use memforge_core::embeddings::EmbeddingRouter;
use memforge_core::llm::{LlmClient, LlmConfig};
use memforge_core::memory::{
    BulkIngester, Categorizer, CommunityBuilder, DeduplicationEngine, EntityDirectory,
    EntityExtractor, HybridSearchEngine, IngestionOrchestrator, IntentClassifier, MemoryWriter,
    TaskSupervisor,
};
use memforge_core::store::{SchemaInitializer, StoreGateway};

use crate::bolt::BoltDriver;

/// Extraction worker-pool bound: re-extraction backlogs drain at this rate
/// instead of fanning out one task per memory.
const EXTRACTION_WORKERS: usize = 8;

/// All shared services, constructed once at boot.
pub struct AppState {
    /// Process settings.
    pub settings: Settings,
    /// Store gateway.
    pub gateway: Arc<StoreGateway>,
    /// TTL config cache.
    pub config_cache: Arc<ConfigCache>,
    /// Embedding front door.
    pub embeddings: EmbeddingRouter,
    /// General background-task supervisor.
    pub tasks: Arc<TaskSupervisor>,
    /// Bi-temporal write path.
    pub writer: Arc<MemoryWriter>,
    /// Hybrid search engine.
    pub search: Arc<HybridSearchEngine>,
    /// Pre-write dedup.
    pub dedup: Arc<DeduplicationEngine>,
    /// Entity lookups.
    pub entities: Arc<EntityDirectory>,
    /// Extraction worker.
    pub extractor: Arc<EntityExtractor>,
    /// Bulk ingestion.
    pub bulk: Arc<BulkIngester>,
    /// Tool host.
    pub orchestrator: Arc<IngestionOrchestrator>,
    /// Community clustering.
    pub community: Arc<CommunityBuilder>,
}

impl AppState {
    /// Wire every service from settings; connects the store pool.
    pub async fn initialize(settings: Settings) -> anyhow::Result<Arc<Self>> {
        let driver = BoltDriver::connect(&settings.store)
            .await
            .context("connecting to the graph store")?;
        let embeddings =
            EmbeddingRouter::new(&settings.embedding).context("selecting embedding backend")?;
        let gateway = Arc::new(StoreGateway::new(
            Arc::new(driver),
            embeddings.dimension(),
        ));
        let config_cache = Arc::new(ConfigCache::new(gateway.clone()));

        let llm = LlmClient::from_config(settings.llm.clone()).context("configuring LLM")?;
        let categorizer_llm = match (&settings.categorization_model, settings.llm.clone()) {
            (Some(model), LlmConfig::Groq { api_key, base_url, .. }) => {
                LlmClient::from_config(LlmConfig::Groq {
                    api_key,
                    model: model.clone(),
                    base_url,
                })?
            }
            (Some(model), LlmConfig::AzureOpenAi {
                api_key,
                endpoint,
                api_version,
                ..
            }) => LlmClient::from_config(LlmConfig::AzureOpenAi {
                api_key,
                deployment_name: model.clone(),
                endpoint,
                api_version,
            })?,
            _ => llm.clone(),
        };

        let tasks = Arc::new(TaskSupervisor::new());
        let extraction_tasks = Arc::new(TaskSupervisor::with_concurrency_limit(
            EXTRACTION_WORKERS,
        ));

        let categorizer = Arc::new(Categorizer::new(gateway.clone(), categorizer_llm));
        let extractor = Arc::new(EntityExtractor::new(
            gateway.clone(),
            embeddings.clone(),
            llm.clone(),
            extraction_tasks,
        ));
        let writer = Arc::new(MemoryWriter::new(
            gateway.clone(),
            embeddings.clone(),
            tasks.clone(),
            categorizer.clone(),
            extractor.clone(),
            settings.context_window.clone(),
        ));
        let dedup = Arc::new(DeduplicationEngine::new(
            gateway.clone(),
            embeddings.clone(),
            llm.clone(),
            config_cache.clone(),
        ));
        let search = Arc::new(HybridSearchEngine::new(
            gateway.clone(),
            embeddings.clone(),
            tasks.clone(),
        ));
        let entities = Arc::new(EntityDirectory::new(gateway.clone(), embeddings.clone()));
        let bulk = Arc::new(BulkIngester::new(
            gateway.clone(),
            embeddings.clone(),
            dedup.clone(),
            tasks.clone(),
            extractor.clone(),
            categorizer.clone(),
            settings.bulk_concurrency(),
        ));
        let orchestrator = Arc::new(IngestionOrchestrator::new(
            IntentClassifier::new(llm.clone()),
            dedup.clone(),
            writer.clone(),
            search.clone(),
            entities.clone(),
            categorizer.clone(),
            gateway.clone(),
        ));
        let community = Arc::new(CommunityBuilder::new(gateway.clone(), llm));

        Ok(Arc::new(Self {
            settings,
            gateway,
            config_cache,
            embeddings,
            tasks,
            writer,
            search,
            dedup,
            entities,
            extractor,
            bulk,
            orchestrator,
            community,
        }))
    }

    /// Apply the idempotent schema DDL.
    pub async fn init_schema(&self) -> anyhow::Result<()> {
        SchemaInitializer::new(self.gateway.clone())
            .apply()
            .await
            .context("applying schema")?;
        Ok(())
    }

    /// Flush background work before exit.
    pub async fn shutdown(&self) {
        self.tasks.drain(Duration::from_secs(10)).await;
    }
}
