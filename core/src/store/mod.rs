//! Abstract access to the graph+vector store.
//!
//! The store itself is an external collaborator that speaks a Cypher-like
//! query language with vector, full-text, and scalar indexes. This module
//! defines the driver seam ([`StoreDriver`]), the statement/row value types
//! that cross it, and re-exports the [`StoreGateway`] every component goes
//! through. Rows are JSON objects keyed by return column; everything above
//! the gateway works with typed structs.

pub mod gateway;
pub mod schema;

pub use gateway::StoreGateway;
pub use schema::SchemaInitializer;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::errors::{MemForgeError, MemForgeResult};

/// A parameterized Cypher statement.
#[derive(Debug, Clone, Default)]
pub struct CypherStatement {
    /// Query text with `$name` parameter placeholders.
    pub query: String,
    /// Named parameters.
    pub params: Map<String, Value>,
}

impl CypherStatement {
    /// Create a statement with no parameters.
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            params: Map::new(),
        }
    }

    /// Attach a named parameter (builder style).
    pub fn param<V: Serialize>(mut self, name: &str, value: V) -> Self {
        let value = serde_json::to_value(value).unwrap_or(Value::Null);
        self.params.insert(name.to_string(), value);
        self
    }
}

/// One result row: a JSON object keyed by return column.
#[derive(Debug, Clone, Default)]
pub struct Row(Map<String, Value>);

impl Row {
    /// Wrap a column map.
    pub fn new(columns: Map<String, Value>) -> Self {
        Self(columns)
    }

    /// Raw column access.
    pub fn value(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// A required string column.
    pub fn get_string(&self, key: &str) -> MemForgeResult<String> {
        self.opt_string(key)
            .ok_or_else(|| MemForgeError::store(format!("missing string column '{key}'")))
    }

    /// An optional string column (absent or null yields `None`).
    pub fn opt_string(&self, key: &str) -> Option<String> {
        self.0.get(key).and_then(Value::as_str).map(str::to_string)
    }

    /// A required integer column.
    pub fn get_i64(&self, key: &str) -> MemForgeResult<i64> {
        self.0
            .get(key)
            .and_then(Value::as_i64)
            .ok_or_else(|| MemForgeError::store(format!("missing integer column '{key}'")))
    }

    /// An optional integer column.
    pub fn opt_i64(&self, key: &str) -> Option<i64> {
        self.0.get(key).and_then(Value::as_i64)
    }

    /// A required float column (integers widen).
    pub fn get_f64(&self, key: &str) -> MemForgeResult<f64> {
        self.0
            .get(key)
            .and_then(Value::as_f64)
            .ok_or_else(|| MemForgeError::store(format!("missing float column '{key}'")))
    }

    /// A boolean column, defaulting to `false` when absent.
    pub fn get_bool(&self, key: &str) -> bool {
        self.0.get(key).and_then(Value::as_bool).unwrap_or(false)
    }

    /// A string-array column, defaulting to empty.
    pub fn string_list(&self, key: &str) -> Vec<String> {
        self.0
            .get(key)
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Consume the row, yielding the column map.
    pub fn into_inner(self) -> Map<String, Value> {
        self.0
    }
}

impl From<Map<String, Value>> for Row {
    fn from(columns: Map<String, Value>) -> Self {
        Self(columns)
    }
}

/// Specification of a vector index the store must hold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VectorIndexSpec {
    /// Index name (e.g. `memory_vectors`).
    pub name: String,
    /// Node label the index covers.
    pub label: String,
    /// Embedding property on the node.
    pub property: String,
    /// Embedding dimension.
    pub dimension: usize,
    /// Maximum indexed nodes.
    pub capacity: usize,
    /// Similarity metric (always cosine).
    pub metric: String,
}

impl VectorIndexSpec {
    /// The memory embedding index (capacity 100 000).
    pub fn memory_vectors(dimension: usize) -> Self {
        Self {
            name: "memory_vectors".to_string(),
            label: "Memory".to_string(),
            property: "embedding".to_string(),
            dimension,
            capacity: 100_000,
            metric: "cos".to_string(),
        }
    }

    /// The entity description embedding index (capacity 10 000).
    pub fn entity_vectors(dimension: usize) -> Self {
        Self {
            name: "entity_vectors".to_string(),
            label: "Entity".to_string(),
            property: "descriptionEmbedding".to_string(),
            dimension,
            capacity: 10_000,
            metric: "cos".to_string(),
        }
    }
}

/// Driver seam to the external graph+vector store.
///
/// Implementations own the connection pool. The gateway layers retry,
/// parameter-coercion rewriting, and index verification on top; components
/// never talk to a driver directly.
#[async_trait]
pub trait StoreDriver: Send + Sync {
    /// Execute one statement in auto-commit mode and collect all rows.
    async fn execute(&self, statement: &CypherStatement) -> MemForgeResult<Vec<Row>>;

    /// Execute an ordered list of statements inside one explicit write
    /// transaction: commit on success, roll back on the first error.
    async fn execute_batch(&self, statements: &[CypherStatement]) -> MemForgeResult<Vec<Vec<Row>>>;

    /// Names of the vector indexes currently present.
    async fn vector_index_names(&self) -> MemForgeResult<Vec<String>>;

    /// Create a vector index.
    async fn create_vector_index(&self, spec: &VectorIndexSpec) -> MemForgeResult<()>;

    /// Drop and rebuild the connection pool after a connection-class error.
    async fn reset(&self) -> MemForgeResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_statement_params() {
        let stmt = CypherStatement::new("MATCH (u:User {userId:$userId}) RETURN u")
            .param("userId", "u1")
            .param("limit", 10)
            .param("tags", vec!["a".to_string(), "b".to_string()]);
        assert_eq!(stmt.params["userId"], json!("u1"));
        assert_eq!(stmt.params["limit"], json!(10));
        assert_eq!(stmt.params["tags"], json!(["a", "b"]));
    }

    #[test]
    fn test_row_accessors() {
        let mut map = Map::new();
        map.insert("id".to_string(), json!("ABC"));
        map.insert("count".to_string(), json!(3));
        map.insert("score".to_string(), json!(0.5));
        map.insert("tags".to_string(), json!(["x", "y"]));
        let row = Row::new(map);

        assert_eq!(row.get_string("id").unwrap(), "ABC");
        assert_eq!(row.get_i64("count").unwrap(), 3);
        assert!((row.get_f64("score").unwrap() - 0.5).abs() < f64::EPSILON);
        assert_eq!(row.string_list("tags"), vec!["x", "y"]);
        assert!(row.opt_string("missing").is_none());
        assert!(row.get_string("missing").is_err());
    }
}
