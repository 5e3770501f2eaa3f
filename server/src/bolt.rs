//! Bolt binding of the [`StoreDriver`] seam.
//!
//! Speaks the Bolt protocol to Memgraph (or Neo4j) through neo4rs. The
//! driver owns the connection pool; `reset` rebuilds it after the gateway
//! detects a connection-class failure. JSON parameter values convert to
//! Bolt values on the way in, rows deserialize back to JSON objects keyed
//! by return column.

use async_trait::async_trait;
use neo4rs::{
    query, BoltBoolean, BoltFloat, BoltInteger, BoltList, BoltMap, BoltNull, BoltString, BoltType,
    Config, ConfigBuilder, Graph, Query,
};
use serde_json::Value;
use tokio::sync::RwLock;

use memforge_core::config::StoreSettings;
use memforge_core::errors::{MemForgeError, MemForgeResult};
use memforge_core::store::{CypherStatement, Row, StoreDriver, VectorIndexSpec};

/// neo4rs-backed store driver.
pub struct BoltDriver {
    config: Config,
    graph: RwLock<Graph>,
}

impl BoltDriver {
    /// Connect the pool from the store settings.
    pub async fn connect(settings: &StoreSettings) -> MemForgeResult<Self> {
        let config = ConfigBuilder::default()
            .uri(&settings.url)
            .user(&settings.user)
            .password(&settings.password)
            .max_connections(settings.pool_size)
            .build()
            .map_err(store_error)?;
        let graph = Graph::connect(config.clone()).await.map_err(store_error)?;
        Ok(Self {
            config,
            graph: RwLock::new(graph),
        })
    }

    fn build_query(statement: &CypherStatement) -> Query {
        let mut q = query(&statement.query);
        for (name, value) in &statement.params {
            q = q.param(name, json_to_bolt(value));
        }
        q
    }
}

#[async_trait]
impl StoreDriver for BoltDriver {
    async fn execute(&self, statement: &CypherStatement) -> MemForgeResult<Vec<Row>> {
        let graph = self.graph.read().await.clone();
        let mut stream = graph
            .execute(Self::build_query(statement))
            .await
            .map_err(store_error)?;
        let mut rows = Vec::new();
        while let Some(row) = stream.next().await.map_err(store_error)? {
            rows.push(to_row(&row)?);
        }
        Ok(rows)
    }

    async fn execute_batch(&self, statements: &[CypherStatement]) -> MemForgeResult<Vec<Vec<Row>>> {
        let graph = self.graph.read().await.clone();
        let mut txn = graph.start_txn().await.map_err(store_error)?;
        let mut results = Vec::with_capacity(statements.len());
        for statement in statements {
            let mut stream = match txn.execute(Self::build_query(statement)).await {
                Ok(stream) => stream,
                Err(err) => {
                    let _ = txn.rollback().await;
                    return Err(store_error(err));
                }
            };
            let mut rows = Vec::new();
            loop {
                match stream.next(txn.handle()).await {
                    Ok(Some(row)) => rows.push(to_row(&row)?),
                    Ok(None) => break,
                    Err(err) => {
                        let _ = txn.rollback().await;
                        return Err(store_error(err));
                    }
                }
            }
            results.push(rows);
        }
        txn.commit().await.map_err(store_error)?;
        Ok(results)
    }

    async fn vector_index_names(&self) -> MemForgeResult<Vec<String>> {
        let rows = self
            .execute(&CypherStatement::new(
                "CALL vector_search.show_index_info() YIELD index_name RETURN index_name",
            ))
            .await?;
        rows.iter().map(|row| row.get_string("index_name")).collect()
    }

    async fn create_vector_index(&self, spec: &VectorIndexSpec) -> MemForgeResult<()> {
        // Index DDL does not accept parameters; the spec fields are
        // internal constants, never user input.
        let ddl = format!(
            "CREATE VECTOR INDEX {} ON :{}({}) WITH CONFIG {{\"dimension\": {}, \"capacity\": {}, \"metric\": \"{}\"}}",
            spec.name, spec.label, spec.property, spec.dimension, spec.capacity, spec.metric
        );
        self.execute(&CypherStatement::new(ddl)).await?;
        Ok(())
    }

    async fn reset(&self) -> MemForgeResult<()> {
        let fresh = Graph::connect(self.config.clone())
            .await
            .map_err(store_error)?;
        *self.graph.write().await = fresh;
        Ok(())
    }
}

fn store_error(err: impl std::fmt::Display) -> MemForgeError {
    MemForgeError::store(err.to_string())
}

fn to_row(row: &neo4rs::Row) -> MemForgeResult<Row> {
    let value: Value = row
        .to()
        .map_err(|e| MemForgeError::store(format!("row deserialization failed: {e}")))?;
    match value {
        Value::Object(map) => Ok(Row::new(map)),
        other => {
            let mut map = serde_json::Map::new();
            map.insert("value".to_string(), other);
            Ok(Row::new(map))
        }
    }
}

/// Convert a JSON parameter value to its Bolt representation.
fn json_to_bolt(value: &Value) -> BoltType {
    match value {
        Value::Null => BoltType::Null(BoltNull),
        Value::Bool(b) => BoltType::Boolean(BoltBoolean { value: *b }),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                BoltType::Integer(BoltInteger { value: i })
            } else {
                BoltType::Float(BoltFloat {
                    value: n.as_f64().unwrap_or(0.0),
                })
            }
        }
        Value::String(s) => BoltType::String(BoltString { value: s.clone() }),
        Value::Array(items) => BoltType::List(BoltList {
            value: items.iter().map(json_to_bolt).collect(),
        }),
        Value::Object(map) => BoltType::Map(BoltMap {
            value: map
                .iter()
                .map(|(k, v)| (BoltString { value: k.clone() }, json_to_bolt(v)))
                .collect(),
        }),
    }
}
