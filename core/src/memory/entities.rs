//! Entity lookup, enrichment search, and explicit removal.
//!
//! Backs the orchestrator's DELETE_ENTITY intent and the entity enrichment
//! of `search_memory`. Deleting an entity detaches and removes the node
//! only; the memories that mentioned it are untouched.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::embeddings::EmbeddingRouter;
use crate::errors::MemForgeResult;
use crate::store::{CypherStatement, StoreGateway};
use crate::types::Hex32Id;

use super::types::EntityRecord;

/// A relationship attached to a matched entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityRelationship {
    /// The other endpoint's id.
    pub peer_id: String,
    /// The other endpoint's name.
    pub peer_name: String,
    /// Relationship type label.
    pub relation_type: String,
    /// Relationship description.
    pub description: String,
    /// Whether the matched entity is the source of the edge.
    pub outgoing: bool,
}

/// An entity matched by `search_entities`, with its relationships.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityMatch {
    /// The entity.
    #[serde(flatten)]
    pub entity: EntityRecord,
    /// Relationships in both directions.
    pub relationships: Vec<EntityRelationship>,
}

/// An entity resolved for deletion, with its edge counts.
#[derive(Debug, Clone)]
pub struct EntityForDeletion {
    /// Entity id.
    pub id: String,
    /// Entity display name.
    pub name: String,
    /// MENTIONS edges pointing at it.
    pub mention_count: i64,
    /// RELATED_TO edges in either direction.
    pub relationship_count: i64,
}

/// User-scoped entity lookups.
pub struct EntityDirectory {
    gateway: Arc<StoreGateway>,
    embeddings: EmbeddingRouter,
}

impl EntityDirectory {
    /// Create a directory over the shared services.
    pub fn new(gateway: Arc<StoreGateway>, embeddings: EmbeddingRouter) -> Self {
        Self { gateway, embeddings }
    }

    /// Find entities by substring and semantic match, deduplicated by id,
    /// with relationships fetched in a single two-direction UNWIND.
    pub async fn search_entities(
        &self,
        user_id: &str,
        query: &str,
        limit: usize,
    ) -> MemForgeResult<Vec<EntityMatch>> {
        let mut matches: Vec<EntityRecord> = Vec::new();
        let mut seen: HashMap<String, ()> = HashMap::new();

        let substring_rows = self
            .gateway
            .read(
                CypherStatement::new(
                    "MATCH (u:User {userId: $userId})-[:HAS_ENTITY]->(e:Entity) \
                     WHERE toLower(e.name) CONTAINS toLower($query) \
                     RETURN e.id AS id, e.name AS name, e.normalizedName AS normalizedName, \
                            e.type AS type, e.description AS description, \
                            e.metadata AS metadata, e.userId AS userId \
                     LIMIT $limit",
                )
                .param("userId", user_id)
                .param("query", query)
                .param("limit", limit),
            )
            .await?;
        for row in &substring_rows {
            let record = EntityRecord::from_row(row)?;
            if seen.insert(record.id.clone(), ()).is_none() {
                matches.push(record);
            }
        }

        if matches.len() < limit {
            let embedding = self.embeddings.embed(query).await?;
            self.gateway.ensure_vector_indexes().await?;
            let semantic_rows = self
                .gateway
                .read(
                    CypherStatement::new(
                        "CALL vector_search.search('entity_vectors', $k, $embedding) \
                         YIELD node, similarity \
                         WITH node, similarity \
                         WHERE node.userId = $userId \
                         RETURN node.id AS id, node.name AS name, \
                                node.normalizedName AS normalizedName, node.type AS type, \
                                node.description AS description, node.metadata AS metadata, \
                                node.userId AS userId \
                         ORDER BY similarity DESC LIMIT $limit",
                    )
                    .param("k", limit * 2)
                    .param("embedding", &embedding)
                    .param("userId", user_id)
                    .param("limit", limit),
                )
                .await?;
            for row in &semantic_rows {
                let record = EntityRecord::from_row(row)?;
                if seen.insert(record.id.clone(), ()).is_none() {
                    matches.push(record);
                }
            }
        }
        matches.truncate(limit);

        let relationships = self
            .relationships_for(matches.iter().map(|m| m.id.clone()).collect())
            .await?;
        Ok(matches
            .into_iter()
            .map(|entity| {
                let relationships = relationships.get(&entity.id).cloned().unwrap_or_default();
                EntityMatch {
                    entity,
                    relationships,
                }
            })
            .collect())
    }

    /// Resolve a DELETE_ENTITY target. A valid HEX32 id takes precedence;
    /// otherwise the name matches case-insensitively. Returns the entity
    /// and its edge counts, or `None`.
    pub async fn resolve_for_deletion(
        &self,
        user_id: &str,
        target: &str,
    ) -> MemForgeResult<Option<EntityForDeletion>> {
        let statement = if Hex32Id::is_valid(&target.to_ascii_uppercase()) {
            CypherStatement::new(
                "MATCH (u:User {userId: $userId})-[:HAS_ENTITY]->(e:Entity {id: $target}) \
                 OPTIONAL MATCH (:Memory)-[mention:MENTIONS]->(e) \
                 OPTIONAL MATCH (e)-[relation:RELATED_TO]-() \
                 RETURN e.id AS id, e.name AS name, \
                        count(DISTINCT mention) AS mentionCount, \
                        count(DISTINCT relation) AS relationshipCount",
            )
            .param("userId", user_id)
            .param("target", target.to_ascii_uppercase())
        } else {
            CypherStatement::new(
                "MATCH (u:User {userId: $userId})-[:HAS_ENTITY]->(e:Entity) \
                 WHERE toLower(e.name) = toLower($target) \
                 OPTIONAL MATCH (:Memory)-[mention:MENTIONS]->(e) \
                 OPTIONAL MATCH (e)-[relation:RELATED_TO]-() \
                 RETURN e.id AS id, e.name AS name, \
                        count(DISTINCT mention) AS mentionCount, \
                        count(DISTINCT relation) AS relationshipCount \
                 LIMIT 1",
            )
            .param("userId", user_id)
            .param("target", target)
        };

        let rows = self.gateway.read(statement).await?;
        let Some(row) = rows.first() else {
            return Ok(None);
        };
        Ok(Some(EntityForDeletion {
            id: row.get_string("id")?,
            name: row.opt_string("name").unwrap_or_default(),
            mention_count: row.opt_i64("mentionCount").unwrap_or(0),
            relationship_count: row.opt_i64("relationshipCount").unwrap_or(0),
        }))
    }

    /// Detach and remove an entity node. Memories remain.
    pub async fn delete_entity(&self, user_id: &str, entity_id: &str) -> MemForgeResult<()> {
        self.gateway
            .write(
                CypherStatement::new(
                    "MATCH (u:User {userId: $userId})-[:HAS_ENTITY]->(e:Entity {id: $entityId}) \
                     DETACH DELETE e",
                )
                .param("userId", user_id)
                .param("entityId", entity_id),
            )
            .await?;
        Ok(())
    }

    /// Relationships for a set of entities, both directions, one UNWIND.
    async fn relationships_for(
        &self,
        entity_ids: Vec<String>,
    ) -> MemForgeResult<HashMap<String, Vec<EntityRelationship>>> {
        if entity_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let rows = self
            .gateway
            .read(
                CypherStatement::new(
                    "UNWIND $entityIds AS eid \
                     MATCH (e:Entity {id: eid})-[r:RELATED_TO]-(peer:Entity) \
                     RETURN eid AS entityId, peer.id AS peerId, peer.name AS peerName, \
                            r.type AS type, r.description AS description, \
                            startNode(r) = e AS outgoing",
                )
                .param("entityIds", entity_ids),
            )
            .await?;

        let mut map: HashMap<String, Vec<EntityRelationship>> = HashMap::new();
        for row in &rows {
            let entity_id = row.get_string("entityId")?;
            map.entry(entity_id).or_default().push(EntityRelationship {
                peer_id: row.opt_string("peerId").unwrap_or_default(),
                peer_name: row.opt_string("peerName").unwrap_or_default(),
                relation_type: row.opt_string("type").unwrap_or_default(),
                description: row.opt_string("description").unwrap_or_default(),
                outgoing: row.get_bool("outgoing"),
            });
        }
        Ok(map)
    }
}
