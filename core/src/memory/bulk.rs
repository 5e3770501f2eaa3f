//! Bulk ingestion: many memories, constant round trips.
//!
//! A batch goes through in-batch exact dedup, cross-store near-dedup under
//! a bounded-concurrency semaphore, one `embed_batch` call for the
//! survivors, one MERGE round trip for the User/App anchors, and one UNWIND
//! write creating every surviving memory. Extraction and categorization
//! fire per created id afterwards.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::Semaphore;

use crate::embeddings::EmbeddingRouter;
use crate::errors::MemForgeResult;
use crate::store::{CypherStatement, StoreGateway};
use crate::types::Hex32Id;

use super::categorize::Categorizer;
use super::dedup::{DedupOutcome, DeduplicationEngine};
use super::extraction::EntityExtractor;
use super::tasks::TaskSupervisor;
use super::types::{normalize_for_dedup, MetadataMap};

/// One item of a bulk request.
#[derive(Debug, Clone, Deserialize)]
pub struct BulkItem {
    /// Memory content.
    pub text: String,
    /// Open metadata.
    pub metadata: Option<MetadataMap>,
    /// Explicit truth-time onset.
    pub valid_at: Option<DateTime<Utc>>,
}

/// Per-position outcome of a bulk request.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BulkOutcome {
    /// A memory was created.
    Added {
        /// Id of the new memory.
        id: String,
    },
    /// The item duplicated an in-batch or stored memory.
    SkippedDuplicate {
        /// Id of the existing memory, when known.
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },
    /// The item could not be written.
    Failed {
        /// Failure description.
        error: String,
    },
}

/// Options for a bulk request.
#[derive(Debug, Clone)]
pub struct BulkOptions {
    /// Dedup fan-out bound; defaults to the RPM-derived value.
    pub concurrency: Option<usize>,
    /// Disable cross-store dedup for trusted imports.
    pub dedup_enabled: bool,
}

impl Default for BulkOptions {
    fn default() -> Self {
        Self {
            concurrency: None,
            dedup_enabled: true,
        }
    }
}

/// Batch writer with constant round-trip count.
pub struct BulkIngester {
    gateway: Arc<StoreGateway>,
    embeddings: EmbeddingRouter,
    dedup: Arc<DeduplicationEngine>,
    tasks: Arc<TaskSupervisor>,
    extractor: Arc<EntityExtractor>,
    categorizer: Arc<Categorizer>,
    default_concurrency: usize,
}

impl BulkIngester {
    /// Create an ingester over the shared services.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        gateway: Arc<StoreGateway>,
        embeddings: EmbeddingRouter,
        dedup: Arc<DeduplicationEngine>,
        tasks: Arc<TaskSupervisor>,
        extractor: Arc<EntityExtractor>,
        categorizer: Arc<Categorizer>,
        default_concurrency: usize,
    ) -> Self {
        Self {
            gateway,
            embeddings,
            dedup,
            tasks,
            extractor,
            categorizer,
            default_concurrency: default_concurrency.max(1),
        }
    }

    /// Ingest a batch, returning one outcome per input position.
    pub async fn bulk_add(
        &self,
        user_id: &str,
        app_name: &str,
        items: Vec<BulkItem>,
        options: BulkOptions,
    ) -> MemForgeResult<Vec<BulkOutcome>> {
        let mut outcomes: Vec<Option<BulkOutcome>> = vec![None; items.len()];

        // Stage 1: in-batch exact dedup on normalized text.
        let mut first_seen: HashMap<String, usize> = HashMap::new();
        let mut candidates: Vec<usize> = Vec::new();
        for (index, item) in items.iter().enumerate() {
            if item.text.trim().is_empty() {
                outcomes[index] = Some(BulkOutcome::Failed {
                    error: "text must not be empty".to_string(),
                });
                continue;
            }
            let normalized = normalize_for_dedup(&item.text);
            if first_seen.contains_key(&normalized) {
                outcomes[index] = Some(BulkOutcome::SkippedDuplicate { id: None });
            } else {
                first_seen.insert(normalized, index);
                candidates.push(index);
            }
        }

        // Stage 2: cross-store near-dedup under a bounded semaphore. Dedup
        // is fail-open, so an errored check falls through as unique.
        let mut survivors: Vec<usize> = Vec::new();
        if options.dedup_enabled {
            let concurrency = options
                .concurrency
                .unwrap_or(self.default_concurrency)
                .max(1);
            let semaphore = Arc::new(Semaphore::new(concurrency));
            let checks = candidates.iter().map(|&index| {
                let semaphore = semaphore.clone();
                let text = items[index].text.clone();
                let dedup = &self.dedup;
                async move {
                    let _permit = semaphore.acquire_owned().await.ok();
                    (index, dedup.check(user_id, &text).await)
                }
            });
            for (index, outcome) in join_all(checks).await {
                match outcome {
                    DedupOutcome::Insert => survivors.push(index),
                    DedupOutcome::Skip { existing_id }
                    | DedupOutcome::Supersede { existing_id } => {
                        outcomes[index] = Some(BulkOutcome::SkippedDuplicate {
                            id: Some(existing_id),
                        });
                    }
                }
            }
            survivors.sort_unstable();
        } else {
            survivors = candidates;
        }

        if survivors.is_empty() {
            return Ok(finalize(outcomes));
        }

        // Stage 3: one embedding batch for every survivor.
        let texts: Vec<String> = survivors.iter().map(|&i| items[i].text.clone()).collect();
        let embeddings = match self.embeddings.embed_batch(&texts).await {
            Ok(embeddings) => embeddings,
            Err(err) => {
                let message = err.to_string();
                for &index in &survivors {
                    outcomes[index] = Some(BulkOutcome::Failed {
                        error: message.clone(),
                    });
                }
                return Ok(finalize(outcomes));
            }
        };

        // Stage 4: one round trip anchoring the User and App nodes.
        let now = Utc::now().to_rfc3339();
        self.gateway
            .write(
                CypherStatement::new(
                    "MERGE (u:User {userId: $userId}) \
                     ON CREATE SET u.id = $userGraphId, u.createdAt = $now \
                     MERGE (a:App {appName: $appName, userId: $userId}) \
                     ON CREATE SET a.id = $appId, a.isActive = true, a.createdAt = $now",
                )
                .param("userId", user_id)
                .param("userGraphId", Hex32Id::from_content(user_id).to_string())
                .param("appName", app_name)
                .param("appId", Hex32Id::generate().to_string())
                .param("now", &now),
            )
            .await?;

        // Stage 5: one UNWIND creating all surviving memories.
        let mut created: Vec<(usize, String)> = Vec::new();
        let memories: Vec<serde_json::Value> = survivors
            .iter()
            .zip(embeddings.iter())
            .map(|(&index, embedding)| {
                let id = Hex32Id::generate().to_string();
                let item = &items[index];
                let memory = json!({
                    "id": id,
                    "content": item.text,
                    "embedding": embedding,
                    "metadata": item
                        .metadata
                        .as_ref()
                        .map(|m| serde_json::Value::Object(m.clone()).to_string())
                        .unwrap_or_else(|| "{}".to_string()),
                    "validAt": item
                        .valid_at
                        .map(|t| t.to_rfc3339())
                        .unwrap_or_else(|| now.clone()),
                });
                created.push((index, id));
                memory
            })
            .collect();

        self.gateway
            .write(
                CypherStatement::new(
                    "MATCH (u:User {userId: $userId}) \
                     MATCH (a:App {appName: $appName, userId: $userId}) \
                     UNWIND $memories AS mem \
                     CREATE (m:Memory {id: mem.id, content: mem.content, \
                             embedding: mem.embedding, state: 'active', \
                             metadata: mem.metadata, tags: [], \
                             validAt: mem.validAt, invalidAt: null, \
                             createdAt: $now, updatedAt: $now, \
                             extractionStatus: 'pending', extractionAttempts: 0}) \
                     CREATE (u)-[:HAS_MEMORY]->(m) \
                     CREATE (m)-[:CREATED_BY]->(a)",
                )
                .param("userId", user_id)
                .param("appName", app_name)
                .param("memories", memories)
                .param("now", &now),
            )
            .await?;

        // Stage 6: background extraction and categorization per id.
        for (index, id) in created {
            self.fire_background(user_id, &id, &items[index].text);
            outcomes[index] = Some(BulkOutcome::Added { id });
        }

        Ok(finalize(outcomes))
    }

    fn fire_background(&self, user_id: &str, memory_id: &str, content: &str) {
        self.extractor.schedule(memory_id);

        let categorizer = self.categorizer.clone();
        let user_id = user_id.to_string();
        let memory_id = memory_id.to_string();
        let content = content.to_string();
        self.tasks.spawn("categorization", async move {
            categorizer
                .categorize_memory(&user_id, &memory_id, &content)
                .await
                .map(|_| ())
        });
    }
}

fn finalize(outcomes: Vec<Option<BulkOutcome>>) -> Vec<BulkOutcome> {
    outcomes
        .into_iter()
        .map(|outcome| {
            outcome.unwrap_or(BulkOutcome::Failed {
                error: "item was not processed".to_string(),
            })
        })
        .collect()
}
