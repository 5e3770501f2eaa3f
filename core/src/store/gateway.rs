//! The gateway every component uses to reach the store.
//!
//! Wraps a [`StoreDriver`] with transient-error retry (3 attempts, 300 ms
//! exponential backoff), `SKIP`/`LIMIT` integer coercion, pool invalidation
//! on connection-class failures, and once-per-process verification of the
//! vector indexes.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use lazy_static::lazy_static;
use regex::Regex;

use crate::errors::MemForgeResult;
use crate::types::retry::{is_connection_error, RetryPolicy};

use super::{CypherStatement, Row, StoreDriver, VectorIndexSpec};

lazy_static! {
    /// `SKIP $x` / `LIMIT $x` take integer parameters only; wrapping the
    /// parameter in `toInteger(...)` makes float↔int coercion unambiguous.
    static ref SKIP_LIMIT_RE: Regex =
        Regex::new(r"(?i)\b(?P<kw>SKIP|LIMIT)\s+\$(?P<name>[A-Za-z_][A-Za-z0-9_]*)")
            .expect("static regex");
}

/// Pooled, retrying front door to the graph store.
pub struct StoreGateway {
    driver: Arc<dyn StoreDriver>,
    retry: RetryPolicy,
    embedding_dimension: usize,
    indexes_verified: AtomicBool,
}

impl StoreGateway {
    /// Wrap a driver. `embedding_dimension` sizes the vector indexes that
    /// `ensure_vector_indexes` re-creates when missing.
    pub fn new(driver: Arc<dyn StoreDriver>, embedding_dimension: usize) -> Self {
        Self {
            driver,
            retry: RetryPolicy::default(),
            embedding_dimension,
            indexes_verified: AtomicBool::new(false),
        }
    }

    /// Override the retry policy.
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Run a read statement.
    pub async fn read(&self, statement: CypherStatement) -> MemForgeResult<Vec<Row>> {
        let statement = rewrite_skip_limit(statement);
        self.submit("read", || self.driver.execute(&statement)).await
    }

    /// Run a write statement.
    pub async fn write(&self, statement: CypherStatement) -> MemForgeResult<Vec<Row>> {
        let statement = rewrite_skip_limit(statement);
        self.submit("write", || self.driver.execute(&statement))
            .await
    }

    /// Run an ordered list of statements in one explicit write transaction.
    pub async fn transaction(
        &self,
        statements: Vec<CypherStatement>,
    ) -> MemForgeResult<Vec<Vec<Row>>> {
        let statements: Vec<CypherStatement> =
            statements.into_iter().map(rewrite_skip_limit).collect();
        self.submit("transaction", || self.driver.execute_batch(&statements))
            .await
    }

    /// Verify the vector indexes exist, creating any that are missing.
    ///
    /// Runs the store round-trip at most once per process lifecycle; the
    /// guard is reset when a connection-class error invalidates the pool.
    pub async fn ensure_vector_indexes(&self) -> MemForgeResult<()> {
        if self.indexes_verified.load(Ordering::Acquire) {
            return Ok(());
        }
        let existing = self.driver.vector_index_names().await?;
        let wanted = [
            VectorIndexSpec::memory_vectors(self.embedding_dimension),
            VectorIndexSpec::entity_vectors(self.embedding_dimension),
        ];
        for spec in &wanted {
            if !existing.contains(&spec.name) {
                tracing::info!(index = %spec.name, dimension = spec.dimension, "creating missing vector index");
                self.driver.create_vector_index(spec).await?;
            }
        }
        self.indexes_verified.store(true, Ordering::Release);
        Ok(())
    }

    /// Embedding dimension the vector indexes are sized for.
    pub fn embedding_dimension(&self) -> usize {
        self.embedding_dimension
    }

    /// Retry loop shared by read/write/transaction. Connection-class errors
    /// invalidate the pool and reset the index guard before the next
    /// attempt; non-transient errors surface immediately.
    async fn submit<T, F, Fut>(&self, op: &str, run: F) -> MemForgeResult<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = MemForgeResult<T>>,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match run().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    if is_connection_error(&err) {
                        tracing::warn!(op, %err, "connection-class store error, invalidating pool");
                        if let Err(reset_err) = self.driver.reset().await {
                            tracing::warn!(%reset_err, "pool reset failed");
                        }
                        self.indexes_verified.store(false, Ordering::Release);
                    }
                    if !self.retry.should_retry(&err, attempt) {
                        return Err(err);
                    }
                    let delay = self.retry.delay_ms(attempt);
                    tracing::warn!(op, attempt, delay_ms = delay, %err, "transient store error, retrying");
                    tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
                }
            }
        }
    }
}

/// Rewrite `SKIP $x` / `LIMIT $x` as `SKIP toInteger($x)` / `LIMIT toInteger($x)`.
fn rewrite_skip_limit(mut statement: CypherStatement) -> CypherStatement {
    statement.query = SKIP_LIMIT_RE
        .replace_all(&statement.query, "${kw} toInteger($$${name})")
        .into_owned();
    statement
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    use crate::errors::MemForgeError;

    #[test]
    fn test_rewrite_skip_limit() {
        let stmt = CypherStatement::new("MATCH (m) RETURN m SKIP $offset LIMIT $size");
        let rewritten = rewrite_skip_limit(stmt);
        assert_eq!(
            rewritten.query,
            "MATCH (m) RETURN m SKIP toInteger($offset) LIMIT toInteger($size)"
        );
    }

    #[test]
    fn test_rewrite_is_case_insensitive_and_leaves_literals() {
        let stmt = CypherStatement::new("RETURN 1 skip $a LIMIT 10");
        let rewritten = rewrite_skip_limit(stmt);
        assert_eq!(rewritten.query, "RETURN 1 skip toInteger($a) LIMIT 10");
    }

    /// Driver that fails a configurable number of times before succeeding.
    struct FlakyDriver {
        failures: AtomicUsize,
        error_message: String,
        resets: AtomicUsize,
        seen: Mutex<Vec<String>>,
    }

    impl FlakyDriver {
        fn new(failures: usize, error_message: &str) -> Self {
            Self {
                failures: AtomicUsize::new(failures),
                error_message: error_message.to_string(),
                resets: AtomicUsize::new(0),
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl StoreDriver for FlakyDriver {
        async fn execute(&self, statement: &CypherStatement) -> MemForgeResult<Vec<Row>> {
            self.seen.lock().unwrap().push(statement.query.clone());
            if self.failures.load(Ordering::SeqCst) > 0 {
                self.failures.fetch_sub(1, Ordering::SeqCst);
                return Err(MemForgeError::store(self.error_message.clone()));
            }
            Ok(vec![Row::default()])
        }

        async fn execute_batch(
            &self,
            statements: &[CypherStatement],
        ) -> MemForgeResult<Vec<Vec<Row>>> {
            Ok(statements.iter().map(|_| Vec::new()).collect())
        }

        async fn vector_index_names(&self) -> MemForgeResult<Vec<String>> {
            Ok(vec!["memory_vectors".to_string()])
        }

        async fn create_vector_index(&self, _spec: &VectorIndexSpec) -> MemForgeResult<()> {
            Ok(())
        }

        async fn reset(&self) -> MemForgeResult<()> {
            self.resets.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn fast_gateway(driver: Arc<dyn StoreDriver>) -> StoreGateway {
        StoreGateway::new(driver, 8).with_retry_policy(RetryPolicy {
            max_attempts: 3,
            initial_delay_ms: 1,
            backoff_multiplier: 2.0,
        })
    }

    #[tokio::test]
    async fn test_write_retries_transient_then_succeeds() {
        let driver = Arc::new(FlakyDriver::new(2, "service unavailable"));
        let gateway = fast_gateway(driver.clone());

        let rows = gateway
            .write(CypherStatement::new("CREATE (n)"))
            .await
            .expect("third attempt should succeed");
        assert_eq!(rows.len(), 1);
        assert_eq!(driver.seen.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_write_exhausts_retry_budget() {
        let driver = Arc::new(FlakyDriver::new(5, "service unavailable"));
        let gateway = fast_gateway(driver.clone());

        let err = gateway
            .write(CypherStatement::new("CREATE (n)"))
            .await
            .expect_err("all attempts fail");
        assert!(err.to_string().contains("service unavailable"));
        // Attempt budget is 3, not the failure count.
        assert_eq!(driver.seen.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_non_transient_error_not_retried() {
        let driver = Arc::new(FlakyDriver::new(5, "Syntax error near MATCH"));
        let gateway = fast_gateway(driver.clone());

        gateway
            .read(CypherStatement::new("MTCH (n)"))
            .await
            .expect_err("syntax error surfaces");
        assert_eq!(driver.seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_connection_error_resets_pool_and_guard() {
        let driver = Arc::new(FlakyDriver::new(1, "connection closed by server"));
        let gateway = fast_gateway(driver.clone());

        // Verify indexes once so the guard is set.
        gateway.ensure_vector_indexes().await.unwrap();
        assert!(gateway.indexes_verified.load(Ordering::Acquire));

        gateway
            .write(CypherStatement::new("CREATE (n)"))
            .await
            .expect("retried after pool reset");
        assert_eq!(driver.resets.load(Ordering::SeqCst), 1);
        // Guard was cleared by the connection error, then left unset until
        // the next vector-search path re-verifies.
        assert!(!gateway.indexes_verified.load(Ordering::Acquire));
    }

    #[tokio::test]
    async fn test_ensure_vector_indexes_runs_once() {
        struct CountingDriver {
            listings: AtomicUsize,
            created: Mutex<Vec<String>>,
        }

        #[async_trait]
        impl StoreDriver for CountingDriver {
            async fn execute(&self, _s: &CypherStatement) -> MemForgeResult<Vec<Row>> {
                Ok(Vec::new())
            }
            async fn execute_batch(
                &self,
                _s: &[CypherStatement],
            ) -> MemForgeResult<Vec<Vec<Row>>> {
                Ok(Vec::new())
            }
            async fn vector_index_names(&self) -> MemForgeResult<Vec<String>> {
                self.listings.fetch_add(1, Ordering::SeqCst);
                Ok(Vec::new())
            }
            async fn create_vector_index(&self, spec: &VectorIndexSpec) -> MemForgeResult<()> {
                self.created.lock().unwrap().push(spec.name.clone());
                Ok(())
            }
            async fn reset(&self) -> MemForgeResult<()> {
                Ok(())
            }
        }

        let driver = Arc::new(CountingDriver {
            listings: AtomicUsize::new(0),
            created: Mutex::new(Vec::new()),
        });
        let gateway = StoreGateway::new(driver.clone(), 1024);

        gateway.ensure_vector_indexes().await.unwrap();
        gateway.ensure_vector_indexes().await.unwrap();

        assert_eq!(driver.listings.load(Ordering::SeqCst), 1);
        assert_eq!(
            *driver.created.lock().unwrap(),
            vec!["memory_vectors".to_string(), "entity_vectors".to_string()]
        );
    }
}
