//! Fixed-vocabulary memory categorization.
//!
//! Runs as a fire-and-forget task after every write; a failed call means an
//! uncategorized memory, nothing more.

use std::sync::Arc;

use crate::errors::MemForgeResult;
use crate::llm::{LlmClient, LlmMessage, LlmRequest};
use crate::store::{CypherStatement, StoreGateway};

/// The category labels the LLM may assign.
pub const CATEGORY_VOCABULARY: &[&str] = &[
    "personal",
    "relationships",
    "preferences",
    "health",
    "finance",
    "work",
    "travel",
    "food",
    "technology",
    "education",
    "entertainment",
    "goals",
];

const CATEGORIZE_SYSTEM_PROMPT: &str = r#"Assign category labels to a memory statement.

Pick between zero and three labels from this fixed list:
personal, relationships, preferences, health, finance, work, travel, food, technology, education, entertainment, goals

Respond with a single JSON object: {"categories": ["label", ...]}. Labels outside the list are discarded."#;

/// LLM-backed categorizer.
pub struct Categorizer {
    gateway: Arc<StoreGateway>,
    llm: LlmClient,
}

impl Categorizer {
    /// Create a categorizer over the shared services.
    pub fn new(gateway: Arc<StoreGateway>, llm: LlmClient) -> Self {
        Self { gateway, llm }
    }

    /// Suggest and attach categories for a memory. Returns the labels that
    /// were attached.
    pub async fn categorize_memory(
        &self,
        user_id: &str,
        memory_id: &str,
        content: &str,
    ) -> MemForgeResult<Vec<String>> {
        let categories = self.suggest(content).await?;
        if !categories.is_empty() {
            self.attach(user_id, memory_id, &categories).await?;
        }
        Ok(categories)
    }

    /// Ask the LLM for labels, filtered to the fixed vocabulary.
    async fn suggest(&self, content: &str) -> MemForgeResult<Vec<String>> {
        let request = LlmRequest::from_messages(vec![
            LlmMessage::system(CATEGORIZE_SYSTEM_PROMPT),
            LlmMessage::user(content),
        ])
        .with_temperature(0.0)
        .with_max_tokens(60);

        let value = self.llm.complete_json(request).await?;
        Ok(filter_to_vocabulary(&value))
    }

    /// Attach category labels to a user's memory in one UNWIND statement.
    pub async fn attach(
        &self,
        user_id: &str,
        memory_id: &str,
        categories: &[String],
    ) -> MemForgeResult<()> {
        self.gateway
            .write(
                CypherStatement::new(
                    "MATCH (u:User {userId: $userId})-[:HAS_MEMORY]->(m:Memory {id: $memoryId}) \
                     UNWIND $categories AS name \
                     MERGE (c:Category {name: name}) \
                     MERGE (m)-[:HAS_CATEGORY]->(c)",
                )
                .param("userId", user_id)
                .param("memoryId", memory_id)
                .param("categories", categories),
            )
            .await?;
        Ok(())
    }
}

/// Keep only labels from the fixed vocabulary, lowercased and deduplicated.
fn filter_to_vocabulary(value: &serde_json::Value) -> Vec<String> {
    let mut seen = Vec::new();
    if let Some(items) = value.get("categories").and_then(|v| v.as_array()) {
        for item in items {
            if let Some(label) = item.as_str() {
                let label = label.trim().to_lowercase();
                if CATEGORY_VOCABULARY.contains(&label.as_str()) && !seen.contains(&label) {
                    seen.push(label);
                }
            }
        }
    }
    seen
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_filter_to_vocabulary() {
        let value = json!({"categories": ["Health", "unknown-label", "health", "travel"]});
        assert_eq!(filter_to_vocabulary(&value), vec!["health", "travel"]);
    }

    #[test]
    fn test_filter_tolerates_malformed_payloads() {
        assert!(filter_to_vocabulary(&json!({})).is_empty());
        assert!(filter_to_vocabulary(&json!({"categories": "health"})).is_empty());
        assert!(filter_to_vocabulary(&json!({"categories": [1, 2]})).is_empty());
    }
}
