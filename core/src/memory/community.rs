//! Hierarchical community detection over the memory graph.
//!
//! Level-0 communities come from the store's `community_detection.get()`
//! procedure, filtered to one user's memories and summarized by the LLM.
//! Level-1 parents are grouped by a first-3-words heuristic over community
//! names; running the detection procedure on each subgraph would be more
//! principled, but the heuristic is deterministic and cheap, and level-1
//! quality is best-effort. Rebuilds are explicit and replace the user's
//! previous communities.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;

use crate::errors::MemForgeResult;
use crate::llm::{LlmClient, LlmMessage, LlmRequest};
use crate::store::{CypherStatement, StoreGateway};
use crate::types::Hex32Id;

/// Clusters below this size are left out of the hierarchy.
const MIN_COMMUNITY_SIZE: usize = 2;

/// Member contents sampled into the naming prompt.
const SUMMARY_SAMPLE: usize = 10;

const NAME_SYSTEM_PROMPT: &str = r#"You name a cluster of related memories.

Respond with a single JSON object: {"name": "<3-6 word topic name>", "summary": "<two sentences describing what these memories have in common>"}."#;

/// Result of a community rebuild.
#[derive(Debug, Clone, Default)]
pub struct CommunityRebuild {
    /// Level-0 communities created.
    pub communities: usize,
    /// Level-1 parent communities created.
    pub parents: usize,
}

/// Builds and persists the community hierarchy for a user.
pub struct CommunityBuilder {
    gateway: Arc<StoreGateway>,
    llm: LlmClient,
}

impl CommunityBuilder {
    /// Create a builder over the shared services.
    pub fn new(gateway: Arc<StoreGateway>, llm: LlmClient) -> Self {
        Self { gateway, llm }
    }

    /// Detect, summarize, and persist communities for a user, replacing any
    /// previous hierarchy.
    pub async fn rebuild(&self, user_id: &str) -> MemForgeResult<CommunityRebuild> {
        let clusters = self.detect(user_id).await?;
        self.clear_existing(user_id).await?;

        let mut result = CommunityRebuild::default();
        let mut created: Vec<(String, String)> = Vec::new(); // (id, name)

        for members in clusters.into_values() {
            if members.len() < MIN_COMMUNITY_SIZE {
                continue;
            }
            let (name, summary) = self.name_cluster(&members).await;
            let id = Hex32Id::generate().to_string();
            self.persist_community(user_id, &id, &name, &summary, &members)
                .await?;
            created.push((id, name));
            result.communities += 1;
        }

        // Level-1 parents from the first-3-words grouping of names.
        let mut groups: HashMap<String, Vec<(String, String)>> = HashMap::new();
        for (id, name) in created {
            groups
                .entry(first_words(&name, 3))
                .or_default()
                .push((id, name));
        }
        for (prefix, children) in groups {
            if children.len() < 2 {
                continue;
            }
            let parent_id = Hex32Id::generate().to_string();
            let member_count = children.len();
            self.persist_parent(user_id, &parent_id, &prefix, member_count)
                .await?;
            for (child_id, _) in &children {
                self.attach_child(&parent_id, child_id).await?;
            }
            result.parents += 1;
        }

        tracing::info!(
            user_id,
            communities = result.communities,
            parents = result.parents,
            "community rebuild complete"
        );
        Ok(result)
    }

    /// Run the detection procedure, filtered to the user's live memories.
    /// Returns cluster id → members as `(memory_id, content)`.
    async fn detect(
        &self,
        user_id: &str,
    ) -> MemForgeResult<HashMap<i64, Vec<(String, String)>>> {
        let rows = self
            .gateway
            .read(
                CypherStatement::new(
                    "CALL community_detection.get() YIELD node, community_id \
                     WITH node, community_id \
                     MATCH (u:User {userId: $userId})-[:HAS_MEMORY]->(node) \
                     WHERE node.state <> 'deleted' \
                     RETURN node.id AS memoryId, node.content AS content, \
                            community_id AS communityId",
                )
                .param("userId", user_id),
            )
            .await?;

        let mut clusters: HashMap<i64, Vec<(String, String)>> = HashMap::new();
        for row in &rows {
            let cluster = row.opt_i64("communityId").unwrap_or(0);
            clusters.entry(cluster).or_default().push((
                row.get_string("memoryId")?,
                row.opt_string("content").unwrap_or_default(),
            ));
        }
        Ok(clusters)
    }

    /// Drop the user's previous hierarchy.
    async fn clear_existing(&self, user_id: &str) -> MemForgeResult<()> {
        self.gateway
            .write(
                CypherStatement::new(
                    "MATCH (u:User {userId: $userId})-[:HAS_COMMUNITY]->(c:Community) \
                     DETACH DELETE c",
                )
                .param("userId", user_id),
            )
            .await?;
        Ok(())
    }

    /// LLM names the cluster; failures degrade to a content-derived name.
    async fn name_cluster(&self, members: &[(String, String)]) -> (String, String) {
        let sample: Vec<&str> = members
            .iter()
            .take(SUMMARY_SAMPLE)
            .map(|(_, content)| content.as_str())
            .collect();
        let request = LlmRequest::from_messages(vec![
            LlmMessage::system(NAME_SYSTEM_PROMPT),
            LlmMessage::user(sample.join("\n")),
        ])
        .with_temperature(0.0)
        .with_max_tokens(150);

        match self.llm.complete_json(request).await {
            Ok(value) => {
                let name = string_field(&value, "name")
                    .unwrap_or_else(|| first_words(&members[0].1, 3));
                let summary = string_field(&value, "summary").unwrap_or_default();
                (name, summary)
            }
            Err(err) => {
                tracing::warn!(%err, "community naming failed, using content prefix");
                (first_words(&members[0].1, 3), String::new())
            }
        }
    }

    async fn persist_community(
        &self,
        user_id: &str,
        id: &str,
        name: &str,
        summary: &str,
        members: &[(String, String)],
    ) -> MemForgeResult<()> {
        let member_ids: Vec<String> = members.iter().map(|(id, _)| id.clone()).collect();
        let now = Utc::now().to_rfc3339();
        self.gateway
            .write(
                CypherStatement::new(
                    "MATCH (u:User {userId: $userId}) \
                     CREATE (c:Community {id: $id, name: $name, summary: $summary, \
                             level: 0, parentId: null, memberCount: $memberCount, \
                             createdAt: $now, updatedAt: $now}) \
                     CREATE (u)-[:HAS_COMMUNITY]->(c) \
                     WITH u, c \
                     UNWIND $memberIds AS mid \
                     MATCH (u)-[:HAS_MEMORY]->(m:Memory {id: mid}) \
                     CREATE (m)-[:IN_COMMUNITY]->(c)",
                )
                .param("userId", user_id)
                .param("id", id)
                .param("name", name)
                .param("summary", summary)
                .param("memberCount", members.len())
                .param("memberIds", member_ids)
                .param("now", now),
            )
            .await?;
        Ok(())
    }

    async fn persist_parent(
        &self,
        user_id: &str,
        id: &str,
        name: &str,
        member_count: usize,
    ) -> MemForgeResult<()> {
        let now = Utc::now().to_rfc3339();
        self.gateway
            .write(
                CypherStatement::new(
                    "MATCH (u:User {userId: $userId}) \
                     CREATE (c:Community {id: $id, name: $name, summary: '', \
                             level: 1, parentId: null, memberCount: $memberCount, \
                             createdAt: $now, updatedAt: $now}) \
                     CREATE (u)-[:HAS_COMMUNITY]->(c)",
                )
                .param("userId", user_id)
                .param("id", id)
                .param("name", name)
                .param("memberCount", member_count)
                .param("now", now),
            )
            .await?;
        Ok(())
    }

    async fn attach_child(&self, parent_id: &str, child_id: &str) -> MemForgeResult<()> {
        self.gateway
            .write(
                CypherStatement::new(
                    "MATCH (parent:Community {id: $parentId}), (child:Community {id: $childId}) \
                     SET child.parentId = $parentId \
                     CREATE (child)-[:SUBCOMMUNITY_OF]->(parent)",
                )
                .param("parentId", parent_id)
                .param("childId", child_id),
            )
            .await?;
        Ok(())
    }
}

fn string_field(value: &Value, key: &str) -> Option<String> {
    value
        .get(key)
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// The first `n` whitespace-separated words, lowercased.
fn first_words(text: &str, n: usize) -> String {
    text.split_whitespace()
        .take(n)
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_words() {
        assert_eq!(first_words("Travel plans for  Japan", 3), "travel plans for");
        assert_eq!(first_words("one", 3), "one");
        assert_eq!(first_words("", 3), "");
    }

    #[test]
    fn test_string_field() {
        let value = serde_json::json!({"name": " Topic ", "empty": "  "});
        assert_eq!(string_field(&value, "name").as_deref(), Some("Topic"));
        assert!(string_field(&value, "empty").is_none());
        assert!(string_field(&value, "missing").is_none());
    }
}
