//! The `add_memories` / `search_memory` tool host.
//!
//! Batch items run strictly sequentially: sequential writes avoid MVCC
//! conflicts on the shared User/App MERGE nodes and keep dedup TOCTOU-safe
//! (an item must see the memories its predecessors wrote). Between items
//! the handler drains the previous item's entity extraction, bounded per
//! item and per batch, so extraction results are visible to the next
//! item's dedup without letting a slow extraction stall the batch.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::errors::{MemForgeError, MemForgeResult};
use crate::store::{CypherStatement, StoreGateway};

use super::categorize::Categorizer;
use super::dedup::{DedupOutcome, DeduplicationEngine};
use super::entities::EntityDirectory;
use super::intent::IntentClassifier;
use super::search::{HybridSearchEngine, SearchFilters, SearchMode};
use super::tasks::TaskHandle;
use super::types::{normalize_for_dedup, parse_timestamp, Intent};
use super::writer::{AddOptions, MemoryWriter};

/// Longest wait for the previous item's extraction, per item.
pub const PER_ITEM_DRAIN_MAX_MS: u64 = 3_000;

/// Total extraction-drain budget for one batch.
pub const BATCH_DRAIN_BUDGET_MS: u64 = 12_000;

/// Minimum fused score for an INVALIDATE hit to be acted on.
pub const INVALIDATE_RRF_THRESHOLD: f64 = 0.015;

/// Browse-mode page size default and cap.
const BROWSE_DEFAULT_LIMIT: usize = 50;
const BROWSE_MAX_LIMIT: usize = 200;

/// Search-mode result cap default.
const SEARCH_DEFAULT_LIMIT: usize = 10;

/// Entity enrichment fetch size.
const ENTITY_ENRICH_LIMIT: usize = 5;

/// Per-connection identity for tool calls.
#[derive(Debug, Clone)]
pub struct SessionContext {
    /// Namespace owner of every operation.
    pub user_id: String,
    /// Connected client, credited as the App on writes and accesses.
    pub client_name: String,
}

/// `add_memories` request.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AddMemoriesRequest {
    /// One or more statements, processed in order.
    pub content: Vec<String>,
    /// Explicit categories attached to stored items.
    pub categories: Option<Vec<String>>,
    /// Tags stored on created memories.
    pub tags: Option<Vec<String>>,
    /// Suppress automatic categorization. Defaults to true when explicit
    /// categories are supplied.
    pub suppress_auto_categories: Option<bool>,
}

/// One failed batch position.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ItemError {
    /// Input position.
    pub index: usize,
    /// Failure description.
    pub message: String,
}

/// Index-correlated `add_memories` response.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AddMemoriesResponse {
    /// Ids touched per stored/skipped/superseded item, in input order.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub ids: Vec<String>,
    /// New memories created.
    #[serde(skip_serializing_if = "is_zero")]
    pub stored: usize,
    /// Memories superseded by newer content.
    #[serde(skip_serializing_if = "is_zero")]
    pub superseded: usize,
    /// Exact or near duplicates skipped.
    #[serde(skip_serializing_if = "is_zero")]
    pub skipped: usize,
    /// Memories soft-deleted by INVALIDATE intents.
    #[serde(skip_serializing_if = "is_zero")]
    pub invalidated: usize,
    /// Entities removed by DELETE_ENTITY intents.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub deleted: Vec<String>,
    /// Memories refreshed by TOUCH intents.
    #[serde(skip_serializing_if = "is_zero")]
    pub touched: usize,
    /// Memories archived by RESOLVE intents.
    #[serde(skip_serializing_if = "is_zero")]
    pub resolved: usize,
    /// Per-position failures.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<ItemError>,
}

fn is_zero(n: &usize) -> bool {
    *n == 0
}

/// `search_memory` request.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SearchMemoryRequest {
    /// Search query; browse mode when absent.
    pub query: Option<String>,
    /// Result cap (browse default 50, cap 200; search default 10).
    pub limit: Option<usize>,
    /// Browse-mode pagination offset.
    pub offset: Option<usize>,
    /// Case-insensitive category filter.
    pub category: Option<String>,
    /// ISO timestamp lower bound on creation.
    pub created_after: Option<String>,
    /// Enrich search results with matching entities.
    pub include_entities: Option<bool>,
    /// Case-insensitive tag filter.
    pub tag: Option<String>,
}

/// `search_memory` response; browse and search modes populate different
/// fields.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SearchMemoryResponse {
    /// Total matching memories (browse mode).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total: Option<i64>,
    /// Browse page, chronological descending.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub items: Option<Vec<Value>>,
    /// Distinct category names over the user's current memories (browse).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub categories: Option<Vec<String>>,
    /// Distinct tags over the user's current memories (browse).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    /// Ranked search results.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub results: Option<Vec<Value>>,
    /// Whether the result set passes the confidence heuristic (search).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confident: Option<bool>,
    /// Matching entities with relationships (search, opt-in).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entities: Option<Value>,
    /// Set when the tag filter starved the result set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tag_filter_warning: Option<String>,
}

/// Sequential tool host over the full pipeline.
pub struct IngestionOrchestrator {
    intent: IntentClassifier,
    dedup: Arc<DeduplicationEngine>,
    writer: Arc<MemoryWriter>,
    search: Arc<HybridSearchEngine>,
    entities: Arc<EntityDirectory>,
    categorizer: Arc<Categorizer>,
    gateway: Arc<StoreGateway>,
}

impl IngestionOrchestrator {
    /// Create an orchestrator over the shared services.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        intent: IntentClassifier,
        dedup: Arc<DeduplicationEngine>,
        writer: Arc<MemoryWriter>,
        search: Arc<HybridSearchEngine>,
        entities: Arc<EntityDirectory>,
        categorizer: Arc<Categorizer>,
        gateway: Arc<StoreGateway>,
    ) -> Self {
        Self {
            intent,
            dedup,
            writer,
            search,
            entities,
            categorizer,
            gateway,
        }
    }

    /// Process a batch of statements, strictly sequentially.
    pub async fn add_memories(
        &self,
        context: &SessionContext,
        request: AddMemoriesRequest,
    ) -> AddMemoriesResponse {
        let mut response = AddMemoriesResponse::default();
        let suppress_auto = request
            .suppress_auto_categories
            .unwrap_or(request.categories.is_some());
        let explicit_categories = request.categories.clone().unwrap_or_default();
        let tags = request.tags.clone().unwrap_or_default();

        let batch_started = Instant::now();
        let mut seen_in_batch: HashSet<String> = HashSet::new();
        let mut previous_extraction: Option<TaskHandle> = None;

        for (index, text) in request.content.iter().enumerate() {
            // Exact intra-batch duplicates short-circuit immediately.
            let normalized = normalize_for_dedup(text);
            if !seen_in_batch.insert(normalized) {
                response.skipped += 1;
                continue;
            }

            // Drain the previous item's extraction within the budgets so
            // its entities are visible to this item.
            if let Some(handle) = previous_extraction.take() {
                let batch_budget = Duration::from_millis(BATCH_DRAIN_BUDGET_MS)
                    .saturating_sub(batch_started.elapsed());
                let budget = Duration::from_millis(PER_ITEM_DRAIN_MAX_MS).min(batch_budget);
                if !budget.is_zero() && !handle.wait_with_budget(budget).await {
                    tracing::debug!(index, "extraction still running past drain budget");
                }
            }

            let outcome = self
                .process_item(
                    context,
                    text,
                    &tags,
                    &explicit_categories,
                    suppress_auto,
                    &mut response,
                )
                .await;
            match outcome {
                Ok(extraction) => previous_extraction = extraction,
                Err(err) => response.errors.push(ItemError {
                    index,
                    message: err.to_string(),
                }),
            }
        }

        response
    }

    /// Dispatch one item by intent. Returns the extraction handle when one
    /// was scheduled.
    async fn process_item(
        &self,
        context: &SessionContext,
        text: &str,
        tags: &[String],
        explicit_categories: &[String],
        suppress_auto: bool,
        response: &mut AddMemoriesResponse,
    ) -> MemForgeResult<Option<TaskHandle>> {
        let intent = self.intent.classify(text).await;
        tracing::debug!(intent = intent.name(), "dispatching batch item");
        match intent {
            Intent::Store => {
                self.store_item(
                    context,
                    text,
                    tags,
                    explicit_categories,
                    suppress_auto,
                    response,
                )
                .await
            }
            Intent::Invalidate { target } => {
                let hits = self
                    .search
                    .search(&context.user_id, &target, 10, SearchMode::Hybrid)
                    .await?;
                for hit in hits {
                    if hit.rrf_score >= INVALIDATE_RRF_THRESHOLD
                        && self.writer.delete(&context.user_id, &hit.id).await?
                    {
                        response.invalidated += 1;
                    }
                }
                Ok(None)
            }
            Intent::DeleteEntity { entity_name } => {
                let Some(entity) = self
                    .entities
                    .resolve_for_deletion(&context.user_id, &entity_name)
                    .await?
                else {
                    return Err(MemForgeError::not_found(format!(
                        "entity '{entity_name}'"
                    )));
                };
                tracing::info!(
                    entity = %entity.name,
                    mentions = entity.mention_count,
                    relationships = entity.relationship_count,
                    "deleting entity"
                );
                self.entities
                    .delete_entity(&context.user_id, &entity.id)
                    .await?;
                response.deleted.push(entity.name);
                Ok(None)
            }
            Intent::Touch { target } => {
                if let Some(hit) = self.best_match(&context.user_id, &target).await? {
                    if self.writer.touch(&context.user_id, &hit).await? {
                        response.touched += 1;
                    }
                }
                Ok(None)
            }
            Intent::Resolve { target } => {
                if let Some(hit) = self.best_match(&context.user_id, &target).await? {
                    if self.writer.archive(&context.user_id, &hit).await? {
                        response.resolved += 1;
                    }
                }
                Ok(None)
            }
        }
    }

    async fn store_item(
        &self,
        context: &SessionContext,
        text: &str,
        tags: &[String],
        explicit_categories: &[String],
        suppress_auto: bool,
        response: &mut AddMemoriesResponse,
    ) -> MemForgeResult<Option<TaskHandle>> {
        match self.dedup.check(&context.user_id, text).await {
            DedupOutcome::Skip { existing_id } => {
                response.skipped += 1;
                response.ids.push(existing_id);
                Ok(None)
            }
            DedupOutcome::Supersede { existing_id } => {
                let mut receipt = self
                    .writer
                    .supersede(
                        &context.user_id,
                        &existing_id,
                        text,
                        Some(context.client_name.as_str()),
                        (!tags.is_empty()).then(|| tags.to_vec()),
                    )
                    .await?;
                if !explicit_categories.is_empty() {
                    self.categorizer
                        .attach(&context.user_id, &receipt.id, explicit_categories)
                        .await?;
                }
                response.superseded += 1;
                response.ids.push(receipt.id.clone());
                Ok(receipt.extraction.take())
            }
            DedupOutcome::Insert => {
                let mut receipt = self
                    .writer
                    .add(
                        &context.user_id,
                        text,
                        AddOptions {
                            app_name: Some(context.client_name.clone()),
                            tags: tags.to_vec(),
                            suppress_categorization: suppress_auto,
                            ..AddOptions::default()
                        },
                    )
                    .await?;
                if !explicit_categories.is_empty() {
                    self.categorizer
                        .attach(&context.user_id, &receipt.id, explicit_categories)
                        .await?;
                }
                response.stored += 1;
                response.ids.push(receipt.id.clone());
                Ok(receipt.extraction.take())
            }
        }
    }

    /// The best hybrid hit for a target description, if any.
    async fn best_match(&self, user_id: &str, target: &str) -> MemForgeResult<Option<String>> {
        let hits = self
            .search
            .search(user_id, target, 1, SearchMode::Hybrid)
            .await?;
        Ok(hits.into_iter().next().map(|hit| hit.id))
    }

    /// Browse (no query) or search (query present).
    pub async fn search_memory(
        &self,
        context: &SessionContext,
        request: SearchMemoryRequest,
    ) -> MemForgeResult<SearchMemoryResponse> {
        match request.query.as_deref().map(str::trim) {
            Some(query) if !query.is_empty() => self.search_mode(context, query, &request).await,
            _ => self.browse_mode(context, &request).await,
        }
    }

    async fn search_mode(
        &self,
        context: &SessionContext,
        query: &str,
        request: &SearchMemoryRequest,
    ) -> MemForgeResult<SearchMemoryResponse> {
        let limit = request.limit.unwrap_or(SEARCH_DEFAULT_LIMIT);
        let filters = SearchFilters {
            category: request.category.clone(),
            created_after: parse_timestamp(request.created_after.clone()),
            tag: request.tag.clone(),
        };
        let filtered = self
            .search
            .search_filtered(
                &context.user_id,
                query,
                limit,
                SearchMode::Hybrid,
                &filters,
                Some(context.client_name.as_str()),
            )
            .await?;

        let confident = HybridSearchEngine::is_confident(&filtered.hits);
        let results: Vec<Value> = filtered
            .hits
            .iter()
            .map(|hit| {
                json!({
                    "id": hit.id,
                    "content": hit.content,
                    "created_at": hit.created_at.map(|t| t.to_rfc3339()),
                    "updated_at": hit.updated_at.map(|t| t.to_rfc3339()),
                    "app_name": hit.app_name,
                    "categories": hit.categories,
                    "tags": hit.tags,
                    "text_rank": hit.text_rank,
                    "vector_rank": hit.vector_rank,
                    "rrf_score": hit.rrf_score,
                    "score": HybridSearchEngine::display_score(hit.rrf_score),
                })
            })
            .collect();

        let entities = if request.include_entities.unwrap_or(false) {
            let matches = self
                .entities
                .search_entities(&context.user_id, query, ENTITY_ENRICH_LIMIT)
                .await?;
            Some(serde_json::to_value(matches)?)
        } else {
            None
        };

        Ok(SearchMemoryResponse {
            results: Some(results),
            confident: Some(confident),
            entities,
            tag_filter_warning: filtered.tag_filter_warning.then(|| {
                "tag filter removed most matches; use browse mode (no query) with the tag filter"
                    .to_string()
            }),
            ..SearchMemoryResponse::default()
        })
    }

    /// One transactional round trip: count + page + categories + tags.
    async fn browse_mode(
        &self,
        context: &SessionContext,
        request: &SearchMemoryRequest,
    ) -> MemForgeResult<SearchMemoryResponse> {
        let limit = request
            .limit
            .unwrap_or(BROWSE_DEFAULT_LIMIT)
            .min(BROWSE_MAX_LIMIT);
        let offset = request.offset.unwrap_or(0);

        let page_statement = CypherStatement::new(
            "MATCH (u:User {userId: $userId})-[:HAS_MEMORY]->(m:Memory) \
             WHERE m.invalidAt IS NULL AND m.state <> 'deleted' \
             OPTIONAL MATCH (m)-[:HAS_CATEGORY]->(c:Category) \
             WITH m, collect(c.name) AS categories \
             WHERE ($category IS NULL OR any(name IN categories WHERE toLower(name) = toLower($category))) \
               AND ($tag IS NULL OR any(t IN m.tags WHERE toLower(t) = toLower($tag))) \
               AND ($createdAfter IS NULL OR m.createdAt > $createdAfter) \
             WITH m, categories ORDER BY m.createdAt DESC \
             WITH collect({id: m.id, content: m.content, created_at: m.createdAt, \
                           updated_at: m.updatedAt, tags: m.tags, categories: categories}) AS items \
             RETURN size(items) AS total, \
                    items[toInteger($offset)..toInteger($offset) + toInteger($limit)] AS page",
        )
        .param("userId", &context.user_id)
        .param("category", &request.category)
        .param("tag", &request.tag)
        .param("createdAfter", &request.created_after)
        .param("offset", offset)
        .param("limit", limit);

        let categories_statement = CypherStatement::new(
            "MATCH (u:User {userId: $userId})-[:HAS_MEMORY]->(m:Memory)-[:HAS_CATEGORY]->(c:Category) \
             WHERE m.invalidAt IS NULL AND m.state <> 'deleted' \
             RETURN DISTINCT c.name AS name ORDER BY name",
        )
        .param("userId", &context.user_id);

        let tags_statement = CypherStatement::new(
            "MATCH (u:User {userId: $userId})-[:HAS_MEMORY]->(m:Memory) \
             WHERE m.invalidAt IS NULL AND m.state <> 'deleted' \
             UNWIND m.tags AS tag \
             RETURN DISTINCT tag ORDER BY tag",
        )
        .param("userId", &context.user_id);

        let mut result_sets = self
            .gateway
            .transaction(vec![page_statement, categories_statement, tags_statement])
            .await?;

        let tags: Vec<String> = result_sets
            .pop()
            .unwrap_or_default()
            .iter()
            .filter_map(|row| row.opt_string("tag"))
            .collect();
        let categories: Vec<String> = result_sets
            .pop()
            .unwrap_or_default()
            .iter()
            .filter_map(|row| row.opt_string("name"))
            .collect();
        let page_rows = result_sets.pop().unwrap_or_default();

        let (total, items) = match page_rows.first() {
            Some(row) => (
                row.opt_i64("total").unwrap_or(0),
                row.value("page")
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default(),
            ),
            None => (0, Vec::new()),
        };

        Ok(SearchMemoryResponse {
            total: Some(total),
            items: Some(items),
            categories: Some(categories),
            tags: Some(tags),
            ..SearchMemoryResponse::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_serialization_is_minimal() {
        let response = AddMemoriesResponse {
            ids: vec!["A".to_string()],
            stored: 1,
            ..AddMemoriesResponse::default()
        };
        let value = serde_json::to_value(&response).expect("serializes");
        assert_eq!(value["stored"], 1);
        assert_eq!(value["ids"][0], "A");
        assert!(value.get("superseded").is_none());
        assert!(value.get("errors").is_none());
        assert!(value.get("deleted").is_none());
    }

    #[test]
    fn test_suppress_auto_categories_defaulting() {
        // Explicit categories without the flag default suppression on.
        let request = AddMemoriesRequest {
            content: vec!["x".to_string()],
            categories: Some(vec!["health".to_string()]),
            ..AddMemoriesRequest::default()
        };
        let suppress = request
            .suppress_auto_categories
            .unwrap_or(request.categories.is_some());
        assert!(suppress);

        let request = AddMemoriesRequest {
            content: vec!["x".to_string()],
            ..AddMemoriesRequest::default()
        };
        let suppress = request
            .suppress_auto_categories
            .unwrap_or(request.categories.is_some());
        assert!(!suppress);
    }
}
