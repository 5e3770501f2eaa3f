//! Scripted fakes for pipeline tests.
//!
//! The store fake matches queries by substring and answers with canned
//! rows, keeping a journal for assertions. The LLM fake routes on prompt
//! content; the embedder is deterministic and counts batch calls.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{Map, Value};

use memforge_core::config::{ConfigCache, ContextWindowConfig};
use memforge_core::embeddings::{EmbeddingBackend, EmbeddingProviderTrait, EmbeddingRouter};
use memforge_core::errors::{MemForgeError, MemForgeResult};
use memforge_core::llm::{LlmClient, LlmProviderTrait, LlmRequest, LlmResponse, LlmUsage};
use memforge_core::memory::{
    BulkIngester, Categorizer, DeduplicationEngine, EntityDirectory, EntityExtractor,
    HybridSearchEngine, IngestionOrchestrator, IntentClassifier, MemoryWriter, SessionContext,
    TaskSupervisor,
};
use memforge_core::store::{CypherStatement, Row, StoreDriver, StoreGateway, VectorIndexSpec};

/// A canned response: first matching fragment wins.
type RouteHandler = Box<dyn Fn(&CypherStatement) -> Vec<Row> + Send + Sync>;

/// Query-routing store driver with a journal.
pub struct ScriptedDriver {
    routes: Mutex<Vec<(String, RouteHandler)>>,
    journal: Mutex<Vec<CypherStatement>>,
}

impl ScriptedDriver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            routes: Mutex::new(Vec::new()),
            journal: Mutex::new(Vec::new()),
        })
    }

    /// Answer queries containing `fragment` with fixed rows.
    pub fn route_rows(self: &Arc<Self>, fragment: &str, rows: Vec<Row>) -> Arc<Self> {
        self.route_fn(fragment, move |_| rows.clone())
    }

    /// Answer queries containing `fragment` with a handler.
    pub fn route_fn<F>(self: &Arc<Self>, fragment: &str, handler: F) -> Arc<Self>
    where
        F: Fn(&CypherStatement) -> Vec<Row> + Send + Sync + 'static,
    {
        self.routes
            .lock()
            .unwrap()
            .push((fragment.to_string(), Box::new(handler)));
        self.clone()
    }

    /// Every statement executed so far.
    pub fn journal(&self) -> Vec<CypherStatement> {
        self.journal.lock().unwrap().clone()
    }

    /// Journal entries whose query contains `fragment`.
    pub fn queries_containing(&self, fragment: &str) -> Vec<CypherStatement> {
        self.journal()
            .into_iter()
            .filter(|s| s.query.contains(fragment))
            .collect()
    }

    fn answer(&self, statement: &CypherStatement) -> Vec<Row> {
        let routes = self.routes.lock().unwrap();
        for (fragment, handler) in routes.iter() {
            if statement.query.contains(fragment.as_str()) {
                return handler(statement);
            }
        }
        Vec::new()
    }
}

#[async_trait]
impl StoreDriver for ScriptedDriver {
    async fn execute(&self, statement: &CypherStatement) -> MemForgeResult<Vec<Row>> {
        self.journal.lock().unwrap().push(statement.clone());
        Ok(self.answer(statement))
    }

    async fn execute_batch(&self, statements: &[CypherStatement]) -> MemForgeResult<Vec<Vec<Row>>> {
        let mut results = Vec::with_capacity(statements.len());
        for statement in statements {
            self.journal.lock().unwrap().push(statement.clone());
            results.push(self.answer(statement));
        }
        Ok(results)
    }

    async fn vector_index_names(&self) -> MemForgeResult<Vec<String>> {
        Ok(vec![
            "memory_vectors".to_string(),
            "entity_vectors".to_string(),
        ])
    }

    async fn create_vector_index(&self, _spec: &VectorIndexSpec) -> MemForgeResult<()> {
        Ok(())
    }

    async fn reset(&self) -> MemForgeResult<()> {
        Ok(())
    }
}

/// Build a row from (column, value) pairs.
pub fn row(pairs: &[(&str, Value)]) -> Row {
    let mut map = Map::new();
    for (key, value) in pairs {
        map.insert((*key).to_string(), value.clone());
    }
    Row::new(map)
}

/// Deterministic embedder counting batch calls.
pub struct CountingEmbedder {
    pub batch_calls: AtomicUsize,
    pub batch_sizes: Mutex<Vec<usize>>,
}

impl CountingEmbedder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            batch_calls: AtomicUsize::new(0),
            batch_sizes: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl EmbeddingProviderTrait for CountingEmbedder {
    fn provider_name(&self) -> &str {
        "counting"
    }
    fn model_name(&self) -> &str {
        "counting-v1"
    }
    fn dimension(&self) -> usize {
        8
    }
    async fn embed_batch(&self, texts: &[String]) -> MemForgeResult<Vec<Vec<f32>>> {
        self.batch_calls.fetch_add(1, Ordering::SeqCst);
        self.batch_sizes.lock().unwrap().push(texts.len());
        Ok(texts
            .iter()
            .map(|text| {
                let mut vector = vec![0.0f32; 8];
                for (i, byte) in text.bytes().enumerate() {
                    vector[i % 8] += f32::from(byte) / 255.0;
                }
                vector
            })
            .collect())
    }
}

/// LLM fake routing on the last user message.
type LlmHandler = Box<dyn Fn(&str) -> Option<String> + Send + Sync>;

pub struct ScriptedLlm {
    handlers: Mutex<Vec<LlmHandler>>,
    pub calls: Mutex<Vec<String>>,
}

impl ScriptedLlm {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            handlers: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
        })
    }

    /// Add a handler; receives the last user message, returns a response
    /// when it wants to answer.
    pub fn on<F>(self: &Arc<Self>, handler: F) -> Arc<Self>
    where
        F: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        self.handlers.lock().unwrap().push(Box::new(handler));
        self.clone()
    }
}

#[async_trait]
impl LlmProviderTrait for ScriptedLlm {
    fn provider_name(&self) -> &str {
        "scripted"
    }
    fn model_name(&self) -> &str {
        "scripted"
    }
    async fn complete(&self, request: LlmRequest) -> MemForgeResult<LlmResponse> {
        let prompt = request
            .messages
            .last()
            .map(|m| m.content.clone())
            .unwrap_or_default();
        self.calls.lock().unwrap().push(prompt.clone());
        let handlers = self.handlers.lock().unwrap();
        for handler in handlers.iter() {
            if let Some(answer) = handler(&prompt) {
                return Ok(LlmResponse {
                    content: answer,
                    model: "scripted".to_string(),
                    usage: LlmUsage::default(),
                });
            }
        }
        Err(MemForgeError::llm("no scripted answer"))
    }
}

/// Fully wired pipeline over the fakes.
pub struct Harness {
    pub driver: Arc<ScriptedDriver>,
    pub embedder: Arc<CountingEmbedder>,
    pub llm: Arc<ScriptedLlm>,
    pub gateway: Arc<StoreGateway>,
    pub tasks: Arc<TaskSupervisor>,
    pub writer: Arc<MemoryWriter>,
    pub dedup: Arc<DeduplicationEngine>,
    pub search: Arc<HybridSearchEngine>,
    pub entities: Arc<EntityDirectory>,
    pub extractor: Arc<EntityExtractor>,
    pub bulk: Arc<BulkIngester>,
    pub orchestrator: Arc<IngestionOrchestrator>,
}

impl Harness {
    pub fn new(driver: Arc<ScriptedDriver>, llm: Arc<ScriptedLlm>) -> Self {
        let embedder = CountingEmbedder::new();
        let gateway = Arc::new(StoreGateway::new(driver.clone(), 8));
        let embeddings =
            EmbeddingRouter::from_provider(embedder.clone(), EmbeddingBackend::Intelli);
        let llm_client = LlmClient::new(llm.clone());
        let config_cache = Arc::new(ConfigCache::new(gateway.clone()));
        let tasks = Arc::new(TaskSupervisor::new());

        let categorizer = Arc::new(Categorizer::new(gateway.clone(), llm_client.clone()));
        let extractor = Arc::new(EntityExtractor::new(
            gateway.clone(),
            embeddings.clone(),
            llm_client.clone(),
            tasks.clone(),
        ));
        let writer = Arc::new(MemoryWriter::new(
            gateway.clone(),
            embeddings.clone(),
            tasks.clone(),
            categorizer.clone(),
            extractor.clone(),
            ContextWindowConfig::default(),
        ));
        let dedup = Arc::new(DeduplicationEngine::new(
            gateway.clone(),
            embeddings.clone(),
            llm_client.clone(),
            config_cache,
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
            3,
        ));
        let orchestrator = Arc::new(IngestionOrchestrator::new(
            IntentClassifier::new(llm_client),
            dedup.clone(),
            writer.clone(),
            search.clone(),
            entities.clone(),
            categorizer.clone(),
            gateway.clone(),
        ));

        Self {
            driver,
            embedder,
            llm,
            gateway,
            tasks,
            writer,
            dedup,
            search,
            entities,
            extractor,
            bulk,
            orchestrator,
        }
    }

    pub fn context(user_id: &str) -> SessionContext {
        SessionContext {
            user_id: user_id.to_string(),
            client_name: "e2e".to_string(),
        }
    }

    /// Flush fire-and-forget work so journal assertions are stable.
    pub async fn drain(&self) {
        self.tasks.drain(std::time::Duration::from_secs(2)).await;
    }
}
