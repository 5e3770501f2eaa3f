//! Asynchronous entity extraction.
//!
//! For each memory, an LLM call extracts entities and typed relationships
//! (with co-reference context from the user's recent memories). Extracted
//! entities resolve against the user's existing entity set in two tiers:
//! exact normalized-name equality (batched in one UNWIND), then semantic
//! ANN over description embeddings. Resolution merges rather than
//! duplicates: longer type/description wins, open metadata shallow-merges.
//! Entities mentioned often enough get their description re-summarized.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use crate::embeddings::EmbeddingRouter;
use crate::errors::{MemForgeError, MemForgeResult};
use crate::llm::{LlmClient, LlmMessage, LlmRequest};
use crate::store::{CypherStatement, StoreGateway};
use crate::types::Hex32Id;

use super::tasks::{TaskHandle, TaskSupervisor};
use super::types::{ExtractionStatus, MetadataMap};

/// Recent memories used as co-reference context.
const CONTEXT_LIMIT: usize = 5;

/// Mentions at which an entity's description is re-summarized.
const SUMMARY_THRESHOLD: i64 = 3;

/// Tier-2 semantic match threshold over description embeddings.
const DEFAULT_SEMANTIC_THRESHOLD: f32 = 0.80;

/// Longest error string persisted on a failed memory.
const MAX_ERROR_LEN: usize = 300;

const EXTRACT_SYSTEM_PROMPT: &str = r#"Extract the entities and relationships present in a memory statement.

Respond with a single JSON object:
{"entities": [{"name": "...", "type": "...", "description": "...", "metadata": {...}}],
 "relationships": [{"source": "...", "target": "...", "type": "...", "description": "...", "metadata": {...}}]}

Rules:
- "type" is a short canonical category (person, place, organization, project, product, event, concept).
- "description" is one sentence about the entity as evidenced by the memory.
- relationship "source"/"target" must repeat entity names from the entities list.
- "metadata" is optional and must be a JSON object when present.
- Use the context only to resolve pronouns and shorthand; extract from the memory itself."#;

const CONSOLIDATE_SYSTEM_PROMPT: &str = "Merge two descriptions of the same entity into one \
concise description that keeps every distinct fact. Respond with the merged description only.";

const RELATION_ARBITER_PROMPT: &str = r#"An entity relationship of this type is already recorded with an older description. Decide whether the new observation changes it.

Respond with exactly one word:
UPDATE - the new description adds or changes information.
KEEP - the existing edge already covers it."#;

const SUMMARY_SYSTEM_PROMPT: &str = "Summarize what the following memories collectively say \
about one entity, in two sentences at most. Respond with the summary only.";

/// An entity extracted from a memory, post-normalization.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedEntity {
    /// Display name.
    pub name: String,
    /// Canonical type label.
    pub entity_type: String,
    /// One-sentence description.
    pub description: String,
    /// Open metadata (absent unless the LLM returned a JSON object).
    pub metadata: Option<MetadataMap>,
}

/// A typed relationship between two extracted entities.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedRelationship {
    /// Source entity name.
    pub source: String,
    /// Target entity name.
    pub target: String,
    /// Relationship type label.
    pub relation_type: String,
    /// Description of the relationship.
    pub description: String,
    /// Open metadata.
    pub metadata: Option<MetadataMap>,
}

/// Asynchronous entity extraction worker.
pub struct EntityExtractor {
    gateway: Arc<StoreGateway>,
    embeddings: EmbeddingRouter,
    llm: LlmClient,
    tasks: Arc<TaskSupervisor>,
    semantic_threshold: f32,
}

impl EntityExtractor {
    /// Create an extractor over the shared services.
    pub fn new(
        gateway: Arc<StoreGateway>,
        embeddings: EmbeddingRouter,
        llm: LlmClient,
        tasks: Arc<TaskSupervisor>,
    ) -> Self {
        Self {
            gateway,
            embeddings,
            llm,
            tasks,
            semantic_threshold: DEFAULT_SEMANTIC_THRESHOLD,
        }
    }

    /// Override the tier-2 semantic match threshold.
    pub fn with_semantic_threshold(mut self, threshold: f32) -> Self {
        self.semantic_threshold = threshold;
        self
    }

    /// Schedule extraction for one memory on the extractor's worker pool
    /// and return the addressable handle.
    pub fn schedule(self: &Arc<Self>, memory_id: &str) -> TaskHandle {
        let extractor = self.clone();
        let memory_id = memory_id.to_string();
        self.tasks.spawn("entity_extraction", async move {
            extractor.process_entity_extraction(&memory_id).await
        })
    }

    /// Enqueue extraction for every memory of a user. Already-completed
    /// memories return immediately from their task; the pool bound keeps a
    /// large backlog draining at a fixed rate. Returns the queued count.
    pub async fn reextract(self: &Arc<Self>, user_id: &str) -> MemForgeResult<usize> {
        let rows = self
            .gateway
            .read(
                CypherStatement::new(
                    "MATCH (u:User {userId: $userId})-[:HAS_MEMORY]->(m:Memory) \
                     WHERE m.state <> 'deleted' \
                     RETURN m.id AS id",
                )
                .param("userId", user_id),
            )
            .await?;
        let mut queued = 0;
        for row in &rows {
            let id = row.get_string("id")?;
            self.schedule(&id);
            queued += 1;
        }
        Ok(queued)
    }

    /// Process one memory. Idempotent: a memory whose extraction already
    /// completed returns immediately. On failure the memory is marked
    /// `failed` with a truncated error string and is not retried until a
    /// manual re-extraction.
    pub async fn process_entity_extraction(&self, memory_id: &str) -> MemForgeResult<()> {
        match self.process_inner(memory_id).await {
            Ok(()) => Ok(()),
            Err(err) => {
                let truncated: String = err.to_string().chars().take(MAX_ERROR_LEN).collect();
                if let Err(mark_err) = self
                    .mark_status(memory_id, ExtractionStatus::Failed, Some(&truncated))
                    .await
                {
                    tracing::warn!(%mark_err, memory_id, "failed to record extraction failure");
                }
                Err(err)
            }
        }
    }

    async fn process_inner(&self, memory_id: &str) -> MemForgeResult<()> {
        // 1. Load the memory and its owner through the ownership edge.
        let rows = self
            .gateway
            .read(
                CypherStatement::new(
                    "MATCH (u:User)-[:HAS_MEMORY]->(m:Memory {id: $memoryId}) \
                     RETURN m.extractionStatus AS status, m.content AS content, \
                            u.userId AS userId",
                )
                .param("memoryId", memory_id),
            )
            .await?;
        let row = rows
            .first()
            .ok_or_else(|| MemForgeError::not_found(format!("memory {memory_id}")))?;
        if row.opt_string("status").as_deref() == Some(ExtractionStatus::Done.as_str()) {
            return Ok(());
        }
        let content = row.get_string("content")?;
        let user_id = row.get_string("userId")?;

        // 2. Co-reference context from recent memories.
        let context = self.recent_memories(&user_id, memory_id).await?;

        // 3. LLM extraction + normalization.
        let (entities, relationships) = self.extract(&content, &context).await?;

        // 4. Tier-1 batch cache: one UNWIND over all normalized names.
        let names: Vec<String> = entities
            .iter()
            .map(|e| normalize_entity_name(&e.name))
            .collect();
        let tier1 = self.batch_lookup(&user_id, &names).await?;

        // 5. Resolve each entity and link the mention.
        let mut resolved: HashMap<String, String> = HashMap::new();
        for entity in &entities {
            let normalized = normalize_entity_name(&entity.name);
            let entity_id = match tier1.get(&normalized) {
                Some(existing) => {
                    self.absorb_into_existing(&user_id, existing, entity).await?;
                    existing.id.clone()
                }
                None => self.resolve_entity(&user_id, entity, &normalized).await?,
            };
            self.link_mention(&user_id, memory_id, &entity_id).await?;
            resolved.insert(normalized, entity_id);
        }

        // 6. Relationships whose endpoints both resolved.
        for relationship in &relationships {
            let source = resolved.get(&normalize_entity_name(&relationship.source));
            let target = resolved.get(&normalize_entity_name(&relationship.target));
            if let (Some(source_id), Some(target_id)) = (source, target) {
                self.link_entities(source_id, target_id, relationship).await?;
            }
        }

        // 7. Summary regeneration for frequently mentioned entities.
        for entity_id in resolved.values() {
            let mentions = self.mention_count(entity_id).await?;
            if mentions >= SUMMARY_THRESHOLD {
                self.schedule_summary(&user_id, entity_id);
            }
        }

        // 8. Terminal status.
        self.mark_status(memory_id, ExtractionStatus::Done, None).await
    }

    /// LLM extraction call plus strict payload normalization.
    async fn extract(
        &self,
        content: &str,
        context: &[String],
    ) -> MemForgeResult<(Vec<ExtractedEntity>, Vec<ExtractedRelationship>)> {
        let mut prompt = String::new();
        if !context.is_empty() {
            prompt.push_str("Context (recent memories):\n");
            for line in context {
                prompt.push_str("- ");
                prompt.push_str(line);
                prompt.push('\n');
            }
            prompt.push('\n');
        }
        prompt.push_str("Memory: ");
        prompt.push_str(content);

        let request = LlmRequest::from_messages(vec![
            LlmMessage::system(EXTRACT_SYSTEM_PROMPT),
            LlmMessage::user(prompt),
        ])
        .with_temperature(0.0)
        .with_max_tokens(800);

        let value = self.llm.complete_json(request).await?;
        Ok(parse_extraction(&value))
    }

    /// Recent memory contents for the user, excluding the one in flight.
    async fn recent_memories(
        &self,
        user_id: &str,
        memory_id: &str,
    ) -> MemForgeResult<Vec<String>> {
        let rows = self
            .gateway
            .read(
                CypherStatement::new(
                    "MATCH (u:User {userId: $userId})-[:HAS_MEMORY]->(m:Memory) \
                     WHERE m.id <> $memoryId AND m.state <> 'deleted' \
                     RETURN m.content AS content \
                     ORDER BY m.createdAt DESC LIMIT $limit",
                )
                .param("userId", user_id)
                .param("memoryId", memory_id)
                .param("limit", CONTEXT_LIMIT),
            )
            .await?;
        rows.iter().map(|row| row.get_string("content")).collect()
    }

    /// Tier-1 lookup: all normalized names in one UNWIND round trip.
    async fn batch_lookup(
        &self,
        user_id: &str,
        normalized_names: &[String],
    ) -> MemForgeResult<HashMap<String, ExistingEntity>> {
        if normalized_names.is_empty() {
            return Ok(HashMap::new());
        }
        let rows = self
            .gateway
            .read(
                CypherStatement::new(
                    "MATCH (u:User {userId: $userId}) \
                     UNWIND $names AS name \
                     MATCH (u)-[:HAS_ENTITY]->(e:Entity {normalizedName: name}) \
                     RETURN e.normalizedName AS normalizedName, e.id AS id, \
                            e.type AS type, e.description AS description, \
                            e.metadata AS metadata",
                )
                .param("userId", user_id)
                .param("names", normalized_names),
            )
            .await?;
        let mut map = HashMap::new();
        for row in &rows {
            map.insert(
                row.get_string("normalizedName")?,
                ExistingEntity {
                    id: row.get_string("id")?,
                    entity_type: row.opt_string("type").unwrap_or_default(),
                    description: row.opt_string("description").unwrap_or_default(),
                    metadata: row.opt_string("metadata").unwrap_or_else(|| "{}".to_string()),
                },
            );
        }
        Ok(map)
    }

    /// Merge an extracted entity into a tier-1 hit: consolidate differing
    /// descriptions asynchronously, shallow-merge non-empty metadata now.
    async fn absorb_into_existing(
        &self,
        user_id: &str,
        existing: &ExistingEntity,
        incoming: &ExtractedEntity,
    ) -> MemForgeResult<()> {
        if !incoming.description.is_empty() && incoming.description != existing.description {
            self.schedule_consolidation(user_id, &existing.id, existing.description.clone(), incoming.description.clone());
        }
        if let Some(metadata) = &incoming.metadata {
            if !metadata.is_empty() {
                let merged = shallow_merge(&existing.metadata, metadata);
                self.gateway
                    .write(
                        CypherStatement::new(
                            "MATCH (u:User {userId: $userId})-[:HAS_ENTITY]->(e:Entity {id: $id}) \
                             SET e.metadata = $metadata",
                        )
                        .param("userId", user_id)
                        .param("id", &existing.id)
                        .param("metadata", merged),
                    )
                    .await?;
            }
        }
        Ok(())
    }

    /// Tier-1 repeat, tier-2 semantic match, or create.
    async fn resolve_entity(
        &self,
        user_id: &str,
        entity: &ExtractedEntity,
        normalized: &str,
    ) -> MemForgeResult<String> {
        // (a) exact lookup (a concurrent extraction may have created it).
        let tier1 = self.batch_lookup(user_id, &[normalized.to_string()]).await?;
        if let Some(existing) = tier1.get(normalized) {
            self.upgrade_existing(user_id, existing, entity).await?;
            return Ok(existing.id.clone());
        }

        // (b) semantic match over description embeddings.
        let description_text = if entity.description.is_empty() {
            entity.name.clone()
        } else {
            entity.description.clone()
        };
        let embedding = self.embeddings.embed(&description_text).await?;
        self.gateway.ensure_vector_indexes().await?;
        let rows = self
            .gateway
            .read(
                CypherStatement::new(
                    "CALL vector_search.search('entity_vectors', $k, $embedding) \
                     YIELD node, similarity \
                     WITH node, similarity \
                     WHERE node.userId = $userId AND similarity >= $threshold \
                     RETURN node.id AS id, node.type AS type, \
                            node.description AS description, node.metadata AS metadata \
                     ORDER BY similarity DESC LIMIT 1",
                )
                .param("k", 5)
                .param("embedding", &embedding)
                .param("userId", user_id)
                .param("threshold", self.semantic_threshold),
            )
            .await?;
        if let Some(row) = rows.first() {
            let existing = ExistingEntity {
                id: row.get_string("id")?,
                entity_type: row.opt_string("type").unwrap_or_default(),
                description: row.opt_string("description").unwrap_or_default(),
                metadata: row.opt_string("metadata").unwrap_or_else(|| "{}".to_string()),
            };
            self.upgrade_existing(user_id, &existing, entity).await?;
            return Ok(existing.id);
        }

        // (c) create.
        let id = Hex32Id::generate().to_string();
        let metadata = entity
            .metadata
            .as_ref()
            .map(|m| Value::Object(m.clone()).to_string())
            .unwrap_or_else(|| "{}".to_string());
        self.gateway
            .write(
                CypherStatement::new(
                    "MATCH (u:User {userId: $userId}) \
                     CREATE (e:Entity {id: $id, name: $name, normalizedName: $normalizedName, \
                             type: $type, description: $description, \
                             descriptionEmbedding: $embedding, metadata: $metadata, \
                             userId: $userId}) \
                     CREATE (u)-[:HAS_ENTITY]->(e)",
                )
                .param("userId", user_id)
                .param("id", &id)
                .param("name", &entity.name)
                .param("normalizedName", normalized)
                .param("type", &entity.entity_type)
                .param("description", &entity.description)
                .param("embedding", &embedding)
                .param("metadata", metadata),
            )
            .await?;
        Ok(id)
    }

    /// Longer-wins upgrades plus metadata shallow-merge for a matched entity.
    async fn upgrade_existing(
        &self,
        user_id: &str,
        existing: &ExistingEntity,
        incoming: &ExtractedEntity,
    ) -> MemForgeResult<()> {
        let entity_type = if incoming.entity_type.len() > existing.entity_type.len() {
            incoming.entity_type.clone()
        } else {
            existing.entity_type.clone()
        };
        let description = if incoming.description.len() > existing.description.len() {
            incoming.description.clone()
        } else {
            existing.description.clone()
        };
        let metadata = match &incoming.metadata {
            Some(map) if !map.is_empty() => shallow_merge(&existing.metadata, map),
            _ => existing.metadata.clone(),
        };
        if entity_type == existing.entity_type
            && description == existing.description
            && metadata == existing.metadata
        {
            return Ok(());
        }
        self.gateway
            .write(
                CypherStatement::new(
                    "MATCH (u:User {userId: $userId})-[:HAS_ENTITY]->(e:Entity {id: $id}) \
                     SET e.type = $type, e.description = $description, e.metadata = $metadata",
                )
                .param("userId", user_id)
                .param("id", &existing.id)
                .param("type", entity_type)
                .param("description", description)
                .param("metadata", metadata),
            )
            .await?;
        Ok(())
    }

    /// Idempotent MENTIONS edge from the memory to the entity.
    async fn link_mention(
        &self,
        user_id: &str,
        memory_id: &str,
        entity_id: &str,
    ) -> MemForgeResult<()> {
        self.gateway
            .write(
                CypherStatement::new(
                    "MATCH (u:User {userId: $userId})-[:HAS_MEMORY]->(m:Memory {id: $memoryId}) \
                     MATCH (u)-[:HAS_ENTITY]->(e:Entity {id: $entityId}) \
                     MERGE (m)-[:MENTIONS]->(e)",
                )
                .param("userId", user_id)
                .param("memoryId", memory_id)
                .param("entityId", entity_id),
            )
            .await?;
        Ok(())
    }

    /// Create or refresh a typed RELATED_TO edge between two entities.
    async fn link_entities(
        &self,
        source_id: &str,
        target_id: &str,
        relationship: &ExtractedRelationship,
    ) -> MemForgeResult<()> {
        let rows = self
            .gateway
            .read(
                CypherStatement::new(
                    "MATCH (src:Entity {id: $srcId})-[r:RELATED_TO {type: $type}]->(tgt:Entity {id: $tgtId}) \
                     RETURN r.description AS description, r.metadata AS metadata LIMIT 1",
                )
                .param("srcId", source_id)
                .param("tgtId", target_id)
                .param("type", &relationship.relation_type),
            )
            .await?;

        let incoming_metadata = relationship
            .metadata
            .as_ref()
            .map(|m| Value::Object(m.clone()).to_string())
            .unwrap_or_else(|| "{}".to_string());

        if let Some(existing) = rows.first() {
            let existing_description = existing.opt_string("description").unwrap_or_default();
            let existing_metadata = existing
                .opt_string("metadata")
                .unwrap_or_else(|| "{}".to_string());
            let unchanged = existing_description == relationship.description
                && existing_metadata == incoming_metadata;
            if unchanged || !self.relation_needs_update(&existing_description, relationship).await {
                return Ok(());
            }
            // New edge carries the old metadata shallow-merged under the new.
            let merged = match &relationship.metadata {
                Some(map) => shallow_merge(&existing_metadata, map),
                None => existing_metadata,
            };
            return self
                .create_relation_edge(source_id, target_id, relationship, merged)
                .await;
        }

        self.create_relation_edge(source_id, target_id, relationship, incoming_metadata)
            .await
    }

    /// UPDATE/KEEP arbitration for an existing edge with drifted fields.
    async fn relation_needs_update(
        &self,
        existing_description: &str,
        relationship: &ExtractedRelationship,
    ) -> bool {
        let request = LlmRequest::from_messages(vec![
            LlmMessage::system(RELATION_ARBITER_PROMPT),
            LlmMessage::user(format!(
                "Relationship type: {}\nExisting: {}\nNew: {}",
                relationship.relation_type, existing_description, relationship.description
            )),
        ])
        .with_temperature(0.0)
        .with_max_tokens(5);

        match self.llm.complete(request).await {
            Ok(response) => response.content.trim().to_uppercase().starts_with("UPDATE"),
            Err(err) => {
                tracing::warn!(%err, "relation arbitration failed, keeping existing edge");
                false
            }
        }
    }

    async fn create_relation_edge(
        &self,
        source_id: &str,
        target_id: &str,
        relationship: &ExtractedRelationship,
        metadata: String,
    ) -> MemForgeResult<()> {
        self.gateway
            .write(
                CypherStatement::new(
                    "MATCH (src:Entity {id: $srcId}), (tgt:Entity {id: $tgtId}) \
                     CREATE (src)-[:RELATED_TO {type: $type, description: $description, \
                             metadata: $metadata, at: $now}]->(tgt)",
                )
                .param("srcId", source_id)
                .param("tgtId", target_id)
                .param("type", &relationship.relation_type)
                .param("description", &relationship.description)
                .param("metadata", metadata)
                .param("now", chrono::Utc::now().to_rfc3339()),
            )
            .await?;
        Ok(())
    }

    /// MENTIONS edge count for an entity.
    async fn mention_count(&self, entity_id: &str) -> MemForgeResult<i64> {
        let rows = self
            .gateway
            .read(
                CypherStatement::new(
                    "MATCH (:Memory)-[:MENTIONS]->(e:Entity {id: $entityId}) \
                     RETURN count(*) AS mentions",
                )
                .param("entityId", entity_id),
            )
            .await?;
        Ok(rows.first().and_then(|row| row.opt_i64("mentions")).unwrap_or(0))
    }

    /// Fire-and-forget description consolidation for a tier-1 hit.
    fn schedule_consolidation(
        &self,
        user_id: &str,
        entity_id: &str,
        existing: String,
        incoming: String,
    ) {
        let gateway = self.gateway.clone();
        let llm = self.llm.clone();
        let user_id = user_id.to_string();
        let entity_id = entity_id.to_string();
        self.tasks.spawn("description_consolidation", async move {
            let request = LlmRequest::from_messages(vec![
                LlmMessage::system(CONSOLIDATE_SYSTEM_PROMPT),
                LlmMessage::user(format!("First: {existing}\nSecond: {incoming}")),
            ])
            .with_temperature(0.0)
            .with_max_tokens(150);
            let merged = llm.complete(request).await?.content.trim().to_string();
            if merged.is_empty() {
                return Ok(());
            }
            gateway
                .write(
                    CypherStatement::new(
                        "MATCH (u:User {userId: $userId})-[:HAS_ENTITY]->(e:Entity {id: $id}) \
                         SET e.description = $description",
                    )
                    .param("userId", &user_id)
                    .param("id", &entity_id)
                    .param("description", merged),
                )
                .await?;
            Ok(())
        });
    }

    /// Fire-and-forget entity summary regeneration from its mentions.
    fn schedule_summary(&self, user_id: &str, entity_id: &str) {
        let gateway = self.gateway.clone();
        let llm = self.llm.clone();
        let embeddings = self.embeddings.clone();
        let user_id = user_id.to_string();
        let entity_id = entity_id.to_string();
        self.tasks.spawn("entity_summary", async move {
            let rows = gateway
                .read(
                    CypherStatement::new(
                        "MATCH (m:Memory)-[:MENTIONS]->(e:Entity {id: $entityId}) \
                         WHERE m.state <> 'deleted' \
                         RETURN m.content AS content \
                         ORDER BY m.createdAt DESC LIMIT 10",
                    )
                    .param("entityId", &entity_id),
                )
                .await?;
            let contents: Vec<String> = rows
                .iter()
                .filter_map(|row| row.opt_string("content"))
                .collect();
            if contents.is_empty() {
                return Ok(());
            }
            let request = LlmRequest::from_messages(vec![
                LlmMessage::system(SUMMARY_SYSTEM_PROMPT),
                LlmMessage::user(contents.join("\n")),
            ])
            .with_temperature(0.0)
            .with_max_tokens(150);
            let summary = llm.complete(request).await?.content.trim().to_string();
            if summary.is_empty() {
                return Ok(());
            }
            let embedding = embeddings.embed(&summary).await?;
            gateway
                .write(
                    CypherStatement::new(
                        "MATCH (u:User {userId: $userId})-[:HAS_ENTITY]->(e:Entity {id: $id}) \
                         SET e.description = $description, e.descriptionEmbedding = $embedding",
                    )
                    .param("userId", &user_id)
                    .param("id", &entity_id)
                    .param("description", summary)
                    .param("embedding", &embedding),
                )
                .await?;
            Ok(())
        });
    }

    /// Persist the extraction status (and truncated error) on the memory.
    async fn mark_status(
        &self,
        memory_id: &str,
        status: ExtractionStatus,
        error: Option<&str>,
    ) -> MemForgeResult<()> {
        let mut query = String::from(
            "MATCH (:User)-[:HAS_MEMORY]->(m:Memory {id: $memoryId}) \
             SET m.extractionStatus = $status, \
                 m.extractionAttempts = coalesce(m.extractionAttempts, 0) + 1",
        );
        let mut statement = CypherStatement::new(String::new())
            .param("memoryId", memory_id)
            .param("status", status.as_str());
        if let Some(error) = error {
            query.push_str(", m.extractionError = $error");
            statement = statement.param("error", error);
        }
        statement.query = query;
        self.gateway.write(statement).await?;
        Ok(())
    }
}

/// An already-stored entity, as needed for merging.
#[derive(Debug, Clone)]
struct ExistingEntity {
    id: String,
    entity_type: String,
    description: String,
    metadata: String,
}

/// Lowercase and trim a name for tier-1 equality.
pub(crate) fn normalize_entity_name(name: &str) -> String {
    name.trim().to_lowercase()
}

/// Shallow-merge an incoming metadata object into a stored JSON string.
/// Incoming keys win; nested objects are replaced, not merged.
pub(crate) fn shallow_merge(stored: &str, incoming: &MetadataMap) -> String {
    let mut base: MetadataMap = serde_json::from_str(stored).unwrap_or_default();
    for (key, value) in incoming {
        base.insert(key.clone(), value.clone());
    }
    Value::Object(base).to_string()
}

/// Normalize the raw LLM payload: entities need string name and type,
/// metadata must be a JSON object (anything else becomes absent), and
/// relationships need all four string fields.
pub(crate) fn parse_extraction(
    value: &Value,
) -> (Vec<ExtractedEntity>, Vec<ExtractedRelationship>) {
    let mut entities = Vec::new();
    if let Some(items) = value.get("entities").and_then(|v| v.as_array()) {
        for item in items {
            let (Some(name), Some(entity_type)) = (
                item.get("name").and_then(|v| v.as_str()),
                item.get("type").and_then(|v| v.as_str()),
            ) else {
                continue;
            };
            if name.trim().is_empty() || entity_type.trim().is_empty() {
                continue;
            }
            entities.push(ExtractedEntity {
                name: name.trim().to_string(),
                entity_type: entity_type.trim().to_string(),
                description: item
                    .get("description")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .trim()
                    .to_string(),
                metadata: item
                    .get("metadata")
                    .and_then(|v| v.as_object())
                    .cloned(),
            });
        }
    }

    let mut relationships = Vec::new();
    if let Some(items) = value.get("relationships").and_then(|v| v.as_array()) {
        for item in items {
            let fields = ["source", "target", "type"]
                .map(|key| item.get(key).and_then(|v| v.as_str()).map(str::to_string));
            let [Some(source), Some(target), Some(relation_type)] = fields else {
                continue;
            };
            relationships.push(ExtractedRelationship {
                source,
                target,
                relation_type,
                description: item
                    .get("description")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
                metadata: item
                    .get("metadata")
                    .and_then(|v| v.as_object())
                    .cloned(),
            });
        }
    }

    (entities, relationships)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_normalize_entity_name() {
        assert_eq!(normalize_entity_name("  Bob Smith "), "bob smith");
    }

    #[test]
    fn test_parse_extraction_drops_malformed_entries() {
        let value = json!({
            "entities": [
                {"name": "Bob", "type": "person", "description": "A colleague"},
                {"name": 42, "type": "person"},
                {"name": "NoType"},
                {"name": "Acme", "type": "organization", "metadata": {"industry": "tools"}},
                {"name": "BadMeta", "type": "thing", "metadata": ["not", "an", "object"]}
            ],
            "relationships": [
                {"source": "Bob", "target": "Acme", "type": "WORKS_AT", "description": "employment"},
                {"source": "Bob", "target": "Acme"}
            ]
        });
        let (entities, relationships) = parse_extraction(&value);
        assert_eq!(entities.len(), 3);
        assert_eq!(entities[0].name, "Bob");
        assert_eq!(
            entities[1].metadata.as_ref().unwrap()["industry"],
            json!("tools")
        );
        // Array metadata is rejected, entity kept.
        assert!(entities[2].metadata.is_none());
        assert_eq!(relationships.len(), 1);
        assert_eq!(relationships[0].relation_type, "WORKS_AT");
    }

    #[test]
    fn test_parse_extraction_empty_payload() {
        let (entities, relationships) = parse_extraction(&json!({}));
        assert!(entities.is_empty());
        assert!(relationships.is_empty());
    }

    #[test]
    fn test_shallow_merge() {
        let merged = shallow_merge(
            r#"{"a": 1, "keep": true}"#,
            &json!({"a": 2, "b": "new"}).as_object().unwrap().clone(),
        );
        let parsed: Value = serde_json::from_str(&merged).unwrap();
        assert_eq!(parsed["a"], json!(2));
        assert_eq!(parsed["b"], json!("new"));
        assert_eq!(parsed["keep"], json!(true));
    }

    #[test]
    fn test_shallow_merge_tolerates_bad_stored_json() {
        let merged = shallow_merge("not json", &json!({"k": "v"}).as_object().unwrap().clone());
        let parsed: Value = serde_json::from_str(&merged).unwrap();
        assert_eq!(parsed["k"], json!("v"));
    }
}
