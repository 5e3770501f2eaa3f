//! Idempotent DDL applied on boot.
//!
//! Uniqueness constraints, scalar indexes, the full-text index over memory
//! content, and the two vector indexes. Safe to run on every start: the
//! store's "already exists" complaints are swallowed.

use std::sync::Arc;

use crate::errors::MemForgeResult;

use super::{CypherStatement, StoreGateway};

/// Node constraints and scalar indexes, one statement each.
const DDL_STATEMENTS: &[&str] = &[
    "CREATE CONSTRAINT ON (u:User) ASSERT u.userId IS UNIQUE",
    "CREATE CONSTRAINT ON (m:Memory) ASSERT m.id IS UNIQUE",
    "CREATE CONSTRAINT ON (a:App) ASSERT a.id IS UNIQUE",
    "CREATE CONSTRAINT ON (e:Entity) ASSERT e.id IS UNIQUE",
    "CREATE CONSTRAINT ON (c:Community) ASSERT c.id IS UNIQUE",
    "CREATE INDEX ON :Memory(validAt)",
    "CREATE INDEX ON :Memory(invalidAt)",
    "CREATE INDEX ON :Entity(name)",
    "CREATE INDEX ON :Entity(type)",
    "CREATE INDEX ON :Entity(normalizedName)",
    "CREATE INDEX ON :Entity(userId)",
    "CREATE INDEX ON :MemoryHistory(memoryId)",
    "CREATE TEXT INDEX memoryContent ON :Memory",
];

/// Applies the schema DDL through the gateway.
pub struct SchemaInitializer {
    gateway: Arc<StoreGateway>,
}

impl SchemaInitializer {
    /// Create an initializer over the shared gateway.
    pub fn new(gateway: Arc<StoreGateway>) -> Self {
        Self { gateway }
    }

    /// Apply constraints, scalar indexes, the full-text index, and verify
    /// the vector indexes. Must be rerun whenever the embedding backend
    /// (and therefore the vector dimension) changes.
    pub async fn apply(&self) -> MemForgeResult<()> {
        for ddl in DDL_STATEMENTS {
            match self.gateway.write(CypherStatement::new(*ddl)).await {
                Ok(_) => {}
                Err(err) if is_already_exists(&err.to_string()) => {
                    tracing::debug!(statement = *ddl, "schema object already present");
                }
                Err(err) => return Err(err),
            }
        }
        self.gateway.ensure_vector_indexes().await?;
        tracing::info!("schema initialization complete");
        Ok(())
    }
}

fn is_already_exists(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("already exists") || lower.contains("constraint already")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_already_exists_detection() {
        assert!(is_already_exists("Index already exists on :Memory(validAt)"));
        assert!(is_already_exists("Constraint already confirmed"));
        assert!(!is_already_exists("Syntax error"));
    }

    #[test]
    fn test_ddl_covers_required_schema() {
        let joined = DDL_STATEMENTS.join("\n");
        for label in ["User", "Memory", "App", "Entity", "Community"] {
            assert!(joined.contains(label), "missing constraint for {label}");
        }
        for property in ["validAt", "invalidAt", "normalizedName", "memoryId"] {
            assert!(joined.contains(property), "missing index on {property}");
        }
        assert!(joined.contains("TEXT INDEX"));
    }
}
