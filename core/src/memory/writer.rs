//! Bi-temporal memory writes.
//!
//! Every statement is anchored on the owning user
//! (`MATCH (u:User {userId: $userId})-[:HAS_MEMORY]->(m)`); a bare id-only
//! memory lookup is a namespace-isolation bug. Writes record audit history
//! and fire categorization and entity extraction as background tasks.

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;

use crate::config::ContextWindowConfig;
use crate::embeddings::EmbeddingRouter;
use crate::errors::{MemForgeError, MemForgeResult};
use crate::store::{CypherStatement, StoreGateway};
use crate::types::Hex32Id;

use super::categorize::Categorizer;
use super::extraction::EntityExtractor;
use super::tasks::{TaskHandle, TaskSupervisor};
use super::types::{HistoryAction, MetadataMap};

/// Options for [`MemoryWriter::add`].
#[derive(Debug, Clone, Default)]
pub struct AddOptions {
    /// App to credit with the write (MERGEd per user).
    pub app_name: Option<String>,
    /// Tags stored on the memory.
    pub tags: Vec<String>,
    /// Open metadata stored as a JSON string.
    pub metadata: Option<MetadataMap>,
    /// Explicit truth-time onset; defaults to now.
    pub valid_at: Option<chrono::DateTime<Utc>>,
    /// Skip the automatic categorization task.
    pub suppress_categorization: bool,
    /// Skip scheduling entity extraction (bulk ingestion schedules its own).
    pub skip_extraction: bool,
}

/// Receipt for a completed add or supersede.
pub struct WriteReceipt {
    /// Id of the created memory.
    pub id: String,
    /// Handle to the scheduled extraction task, when one was fired.
    pub extraction: Option<TaskHandle>,
}

/// The write path for the memory graph.
pub struct MemoryWriter {
    gateway: Arc<StoreGateway>,
    embeddings: EmbeddingRouter,
    tasks: Arc<TaskSupervisor>,
    categorizer: Arc<Categorizer>,
    extractor: Arc<EntityExtractor>,
    context_window: ContextWindowConfig,
}

impl MemoryWriter {
    /// Create a writer over the shared services.
    pub fn new(
        gateway: Arc<StoreGateway>,
        embeddings: EmbeddingRouter,
        tasks: Arc<TaskSupervisor>,
        categorizer: Arc<Categorizer>,
        extractor: Arc<EntityExtractor>,
        context_window: ContextWindowConfig,
    ) -> Self {
        Self {
            gateway,
            embeddings,
            tasks,
            categorizer,
            extractor,
            context_window,
        }
    }

    /// Create a new memory for the user.
    ///
    /// When the context-window feature is enabled, the embedding is computed
    /// over the text prefixed with the user's most recent memories; the
    /// stored content is always the original text.
    pub async fn add(
        &self,
        user_id: &str,
        text: &str,
        options: AddOptions,
    ) -> MemForgeResult<WriteReceipt> {
        if text.trim().is_empty() {
            return Err(MemForgeError::validation("text", "must not be empty"));
        }

        let embedding_text = self.embedding_text(user_id, text).await;
        let embedding = self.embeddings.embed(&embedding_text).await?;

        let id = Hex32Id::generate().to_string();
        let now = Utc::now();
        let valid_at = options.valid_at.unwrap_or(now);
        let metadata = options
            .metadata
            .map(|m| Value::Object(m).to_string())
            .unwrap_or_else(|| "{}".to_string());

        let mut query = String::from(
            "MERGE (u:User {userId: $userId}) \
             ON CREATE SET u.id = $userGraphId, u.createdAt = $now \
             CREATE (m:Memory {id: $id, content: $content, embedding: $embedding, \
                     state: 'active', metadata: $metadata, tags: $tags, \
                     validAt: $validAt, invalidAt: null, \
                     createdAt: $now, updatedAt: $now, \
                     extractionStatus: 'pending', extractionAttempts: 0}) \
             CREATE (u)-[:HAS_MEMORY]->(m)",
        );
        let mut statement = CypherStatement::new(String::new())
            .param("userId", user_id)
            .param("userGraphId", Hex32Id::from_content(user_id).to_string())
            .param("id", &id)
            .param("content", text)
            .param("embedding", &embedding)
            .param("metadata", metadata)
            .param("tags", &options.tags)
            .param("validAt", valid_at.to_rfc3339())
            .param("now", now.to_rfc3339());

        if let Some(app_name) = &options.app_name {
            query.push_str(
                " MERGE (a:App {appName: $appName, userId: $userId}) \
                 ON CREATE SET a.id = $appId, a.isActive = true, a.createdAt = $now \
                 CREATE (m)-[:CREATED_BY]->(a)",
            );
            statement = statement
                .param("appName", app_name)
                .param("appId", Hex32Id::generate().to_string());
        }
        query.push_str(" RETURN m.id AS id");
        statement.query = query;

        self.gateway.write(statement).await?;

        self.record_history(&id, "", text, HistoryAction::Add);
        if !options.suppress_categorization {
            self.fire_categorization(user_id, &id, text);
        }
        let extraction = (!options.skip_extraction).then(|| self.fire_extraction(&id));

        Ok(WriteReceipt { id, extraction })
    }

    /// Atomically end an old memory's validity and create its replacement,
    /// linked by a SUPERSEDES edge. Omitted tags inherit from the old
    /// memory.
    pub async fn supersede(
        &self,
        user_id: &str,
        old_id: &str,
        new_text: &str,
        app_name: Option<&str>,
        tags: Option<Vec<String>>,
    ) -> MemForgeResult<WriteReceipt> {
        if new_text.trim().is_empty() {
            return Err(MemForgeError::validation("text", "must not be empty"));
        }

        let embedding_text = self.embedding_text(user_id, new_text).await;
        let embedding = self.embeddings.embed(&embedding_text).await?;

        let new_id = Hex32Id::generate().to_string();
        let now = Utc::now().to_rfc3339();

        let mut query = String::from(
            "MATCH (u:User {userId: $userId})-[:HAS_MEMORY]->(old:Memory {id: $oldId}) \
             SET old.invalidAt = $now, old.updatedAt = $now \
             CREATE (new:Memory {id: $newId, content: $content, embedding: $embedding, \
                     state: 'active', metadata: '{}', \
                     tags: CASE WHEN $tags IS NULL THEN old.tags ELSE $tags END, \
                     validAt: $now, invalidAt: null, createdAt: $now, updatedAt: $now, \
                     extractionStatus: 'pending', extractionAttempts: 0}) \
             CREATE (u)-[:HAS_MEMORY]->(new) \
             CREATE (new)-[:SUPERSEDES {at: $now}]->(old)",
        );
        let mut statement = CypherStatement::new(String::new())
            .param("userId", user_id)
            .param("oldId", old_id)
            .param("newId", &new_id)
            .param("content", new_text)
            .param("embedding", &embedding)
            .param("tags", tags)
            .param("now", &now);

        if let Some(app_name) = app_name {
            query.push_str(
                " MERGE (a:App {appName: $appName, userId: $userId}) \
                 ON CREATE SET a.id = $appId, a.isActive = true, a.createdAt = $now \
                 CREATE (new)-[:CREATED_BY]->(a)",
            );
            statement = statement
                .param("appName", app_name)
                .param("appId", Hex32Id::generate().to_string());
        }
        query.push_str(" RETURN new.id AS id, old.content AS oldContent");
        statement.query = query;

        let rows = self.gateway.write(statement).await?;
        let row = rows
            .first()
            .ok_or_else(|| MemForgeError::not_found(format!("memory {old_id}")))?;
        let old_content = row.opt_string("oldContent").unwrap_or_default();

        self.record_history(&new_id, &old_content, new_text, HistoryAction::Supersede);
        self.fire_categorization(user_id, &new_id, new_text);
        let extraction = Some(self.fire_extraction(&new_id));

        Ok(WriteReceipt {
            id: new_id,
            extraction,
        })
    }

    /// Soft-delete a memory. Returns whether a row matched.
    pub async fn delete(&self, user_id: &str, memory_id: &str) -> MemForgeResult<bool> {
        let now = Utc::now().to_rfc3339();
        let rows = self
            .gateway
            .write(
                CypherStatement::new(
                    "MATCH (u:User {userId: $userId})-[:HAS_MEMORY]->(m:Memory {id: $memoryId}) \
                     WHERE m.state <> 'deleted' \
                     SET m.state = 'deleted', m.invalidAt = $now, m.deletedAt = $now, \
                         m.updatedAt = $now \
                     RETURN m.id AS id, m.content AS content",
                )
                .param("userId", user_id)
                .param("memoryId", memory_id)
                .param("now", &now),
            )
            .await?;
        if let Some(row) = rows.first() {
            let content = row.opt_string("content").unwrap_or_default();
            self.record_history(memory_id, &content, "", HistoryAction::Delete);
            return Ok(true);
        }
        Ok(false)
    }

    /// Archive an active memory: it leaves current-time queries but stays
    /// in the graph. Returns whether a row matched.
    pub async fn archive(&self, user_id: &str, memory_id: &str) -> MemForgeResult<bool> {
        let now = Utc::now().to_rfc3339();
        let rows = self
            .gateway
            .write(
                CypherStatement::new(
                    "MATCH (u:User {userId: $userId})-[:HAS_MEMORY]->(m:Memory {id: $memoryId}) \
                     WHERE m.state = 'active' \
                     SET m.state = 'archived', m.archivedAt = $now, m.invalidAt = $now, \
                         m.updatedAt = $now \
                     RETURN m.id AS id, m.content AS content",
                )
                .param("userId", user_id)
                .param("memoryId", memory_id)
                .param("now", &now),
            )
            .await?;
        if let Some(row) = rows.first() {
            let content = row.opt_string("content").unwrap_or_default();
            self.record_history(memory_id, &content, "", HistoryAction::Archive);
            return Ok(true);
        }
        Ok(false)
    }

    /// Pause an active memory: it remains valid and searchable.
    pub async fn pause(&self, user_id: &str, memory_id: &str) -> MemForgeResult<bool> {
        let now = Utc::now().to_rfc3339();
        let rows = self
            .gateway
            .write(
                CypherStatement::new(
                    "MATCH (u:User {userId: $userId})-[:HAS_MEMORY]->(m:Memory {id: $memoryId}) \
                     WHERE m.state = 'active' \
                     SET m.state = 'paused', m.updatedAt = $now \
                     RETURN m.id AS id, m.content AS content",
                )
                .param("userId", user_id)
                .param("memoryId", memory_id)
                .param("now", &now),
            )
            .await?;
        if let Some(row) = rows.first() {
            let content = row.opt_string("content").unwrap_or_default();
            self.record_history(memory_id, &content, "", HistoryAction::Pause);
            return Ok(true);
        }
        Ok(false)
    }

    /// Refresh a memory's `updatedAt` (TOUCH intent).
    pub async fn touch(&self, user_id: &str, memory_id: &str) -> MemForgeResult<bool> {
        let rows = self
            .gateway
            .write(
                CypherStatement::new(
                    "MATCH (u:User {userId: $userId})-[:HAS_MEMORY]->(m:Memory {id: $memoryId}) \
                     SET m.updatedAt = $now \
                     RETURN m.id AS id",
                )
                .param("userId", user_id)
                .param("memoryId", memory_id)
                .param("now", Utc::now().to_rfc3339()),
            )
            .await?;
        Ok(!rows.is_empty())
    }

    /// In-place content overwrite, retained for back-compat. Prefer
    /// [`MemoryWriter::supersede`], which preserves the audit chain.
    #[deprecated(note = "use supersede; in-place updates lose bi-temporal history")]
    pub async fn update(
        &self,
        user_id: &str,
        memory_id: &str,
        new_text: &str,
    ) -> MemForgeResult<bool> {
        let embedding = self.embeddings.embed(new_text).await?;
        let rows = self
            .gateway
            .write(
                CypherStatement::new(
                    "MATCH (u:User {userId: $userId})-[:HAS_MEMORY]->(m:Memory {id: $memoryId}) \
                     SET m.content = $content, m.embedding = $embedding, m.updatedAt = $now \
                     RETURN m.id AS id",
                )
                .param("userId", user_id)
                .param("memoryId", memory_id)
                .param("content", new_text)
                .param("embedding", &embedding)
                .param("now", Utc::now().to_rfc3339()),
            )
            .await?;
        Ok(!rows.is_empty())
    }

    /// Schedule extraction for a memory on the extractor's worker pool.
    pub fn fire_extraction(&self, memory_id: &str) -> TaskHandle {
        self.extractor.schedule(memory_id)
    }

    /// Schedule categorization for a memory.
    pub fn fire_categorization(&self, user_id: &str, memory_id: &str, content: &str) {
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

    /// Append an audit-history record (fire-and-forget).
    fn record_history(
        &self,
        memory_id: &str,
        previous_value: &str,
        new_value: &str,
        action: HistoryAction,
    ) {
        let gateway = self.gateway.clone();
        let memory_id = memory_id.to_string();
        let previous_value = previous_value.to_string();
        let new_value = new_value.to_string();
        self.tasks.spawn("memory_history", async move {
            gateway
                .write(
                    CypherStatement::new(
                        "CREATE (h:MemoryHistory {id: $id, memoryId: $memoryId, \
                                 previousValue: $previousValue, newValue: $newValue, \
                                 action: $action, createdAt: $now})",
                    )
                    .param("id", Hex32Id::generate().to_string())
                    .param("memoryId", memory_id)
                    .param("previousValue", previous_value)
                    .param("newValue", new_value)
                    .param("action", action.to_string())
                    .param("now", Utc::now().to_rfc3339()),
                )
                .await?;
            Ok(())
        });
    }

    /// Embedding text, optionally prefixed with recent memories. Read
    /// failures degrade to the bare text.
    async fn embedding_text(&self, user_id: &str, text: &str) -> String {
        if !self.context_window.enabled {
            return text.to_string();
        }
        let rows = self
            .gateway
            .read(
                CypherStatement::new(
                    "MATCH (u:User {userId: $userId})-[:HAS_MEMORY]->(m:Memory) \
                     WHERE m.invalidAt IS NULL AND m.state <> 'deleted' \
                     RETURN m.content AS content \
                     ORDER BY m.createdAt DESC LIMIT $limit",
                )
                .param("userId", user_id)
                .param("limit", self.context_window.size),
            )
            .await;
        match rows {
            Ok(rows) if !rows.is_empty() => {
                let mut prefix: Vec<String> = rows
                    .iter()
                    .filter_map(|row| row.opt_string("content"))
                    .collect();
                prefix.push(text.to_string());
                prefix.join("\n")
            }
            Ok(_) => text.to_string(),
            Err(err) => {
                tracing::warn!(%err, "context window read failed, embedding bare text");
                text.to_string()
            }
        }
    }
}
