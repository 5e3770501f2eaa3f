//! TTL-cached configuration reads from `:Config` store nodes.
//!
//! Each replica caches values for 30 seconds; writes go through the cache
//! and invalidate the key immediately. Stale reads inside the window are
//! acceptable by contract.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::RwLock;

use crate::errors::MemForgeResult;
use crate::store::{CypherStatement, StoreGateway};

use super::DedupConfig;

/// Default cache TTL.
pub const CONFIG_CACHE_TTL: Duration = Duration::from_secs(30);

struct CachedEntry {
    value: Option<Value>,
    fetched_at: Instant,
}

/// Process-local cache over `:Config` nodes.
pub struct ConfigCache {
    gateway: Arc<StoreGateway>,
    ttl: Duration,
    entries: RwLock<HashMap<String, CachedEntry>>,
}

impl ConfigCache {
    /// Create a cache with the default 30 s TTL.
    pub fn new(gateway: Arc<StoreGateway>) -> Self {
        Self {
            gateway,
            ttl: CONFIG_CACHE_TTL,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Override the TTL (tests).
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Read a configuration value, hitting the store only on cache miss or
    /// expiry. `None` means the key does not exist.
    pub async fn get(&self, key: &str) -> MemForgeResult<Option<Value>> {
        {
            let entries = self.entries.read().await;
            if let Some(entry) = entries.get(key) {
                if entry.fetched_at.elapsed() < self.ttl {
                    return Ok(entry.value.clone());
                }
            }
        }

        let rows = self
            .gateway
            .read(
                CypherStatement::new("MATCH (c:Config {key: $key}) RETURN c.value AS value")
                    .param("key", key),
            )
            .await?;

        let value = rows
            .first()
            .and_then(|row| row.opt_string("value"))
            .and_then(|raw| serde_json::from_str(&raw).ok());

        let mut entries = self.entries.write().await;
        entries.insert(
            key.to_string(),
            CachedEntry {
                value: value.clone(),
                fetched_at: Instant::now(),
            },
        );
        Ok(value)
    }

    /// Write a configuration value and invalidate the cached entry.
    pub async fn set(&self, key: &str, value: &Value) -> MemForgeResult<()> {
        self.gateway
            .write(
                CypherStatement::new("MERGE (c:Config {key: $key}) SET c.value = $value")
                    .param("key", key)
                    .param("value", value.to_string()),
            )
            .await?;
        self.invalidate(key).await;
        Ok(())
    }

    /// Drop a cached entry so the next read refetches.
    pub async fn invalidate(&self, key: &str) {
        self.entries.write().await.remove(key);
    }

    /// The dedup configuration, falling back to defaults when the key is
    /// missing, malformed, or the store read fails (fail-open).
    pub async fn dedup_config(&self) -> DedupConfig {
        match self.get("dedup").await {
            Ok(Some(value)) => serde_json::from_value(value).unwrap_or_default(),
            Ok(None) => DedupConfig::default(),
            Err(err) => {
                tracing::warn!(%err, "dedup config read failed, using defaults");
                DedupConfig::default()
            }
        }
    }
}
