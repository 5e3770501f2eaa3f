//! Two-stage pre-write deduplication.
//!
//! Stage 1 embeds the candidate and runs a vector ANN search over the
//! user's current memories; anything below the provider threshold is a
//! clean insert. Stage 2 walks the surviving hits in similarity order and
//! asks a deterministic LLM pair classifier whether each is a paraphrase
//! (skip), an update (supersede), or unrelated. Pair verdicts are cached so
//! a re-seen pair never pays for the LLM again. Any failure anywhere falls
//! open to insert.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::config::ConfigCache;
use crate::embeddings::EmbeddingRouter;
use crate::errors::MemForgeResult;
use crate::llm::{LlmClient, LlmMessage, LlmRequest};
use crate::store::{CypherStatement, StoreGateway};

use super::types::normalize_for_dedup;

/// How many ANN candidates stage 1 fetches.
const CANDIDATE_K: usize = 10;

/// Verdict of the pre-write dedup check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DedupOutcome {
    /// No duplicate found; write a new memory.
    Insert,
    /// The fact already exists verbatim or as a paraphrase.
    Skip {
        /// Id of the existing memory.
        existing_id: String,
    },
    /// The new fact updates or contradicts an existing memory.
    Supersede {
        /// Id of the memory to supersede.
        existing_id: String,
    },
}

/// Pairwise relationship between a new and an existing statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PairVerdict {
    Duplicate,
    Supersedes,
    Different,
}

const PAIR_SYSTEM_PROMPT: &str = r#"You compare a NEW statement against an EXISTING memory and answer with exactly one word.

DUPLICATE - both state the same fact, possibly paraphrased.
SUPERSEDES - the NEW statement updates or contradicts the EXISTING memory.
DIFFERENT - they describe unrelated facts.

Examples:
NEW: I live in London. EXISTING: I live in NYC. -> SUPERSEDES
NEW: My blood type is O positive. EXISTING: Blood type: O+. -> DUPLICATE
NEW: I adopted a cat. EXISTING: I live in NYC. -> DIFFERENT

Answer with one word only."#;

/// Two-stage (vector ANN + LLM pair classifier) deduplication engine.
pub struct DeduplicationEngine {
    gateway: Arc<StoreGateway>,
    embeddings: EmbeddingRouter,
    llm: LlmClient,
    config: Arc<ConfigCache>,
    pair_cache: RwLock<HashMap<u64, PairVerdict>>,
}

impl DeduplicationEngine {
    /// Create an engine over the shared services.
    pub fn new(
        gateway: Arc<StoreGateway>,
        embeddings: EmbeddingRouter,
        llm: LlmClient,
        config: Arc<ConfigCache>,
    ) -> Self {
        Self {
            gateway,
            embeddings,
            llm,
            config,
            pair_cache: RwLock::new(HashMap::new()),
        }
    }

    /// Check a candidate fact against the user's current memories.
    ///
    /// Fail-open: any error in either stage returns [`DedupOutcome::Insert`]
    /// so a dedup hiccup can never drop user data.
    pub async fn check(&self, user_id: &str, text: &str) -> DedupOutcome {
        match self.check_inner(user_id, text).await {
            Ok(outcome) => outcome,
            Err(err) => {
                tracing::warn!(%err, "dedup check failed, inserting");
                DedupOutcome::Insert
            }
        }
    }

    async fn check_inner(&self, user_id: &str, text: &str) -> MemForgeResult<DedupOutcome> {
        let config = self.config.dedup_config().await;
        if !config.enabled {
            return Ok(DedupOutcome::Insert);
        }
        let threshold = f64::from(config.effective_threshold(self.embeddings.backend()));

        // Stage 1: vector ANN pre-filter over current memories.
        let embedding = self.embeddings.embed(text).await?;
        self.gateway.ensure_vector_indexes().await?;
        let rows = self
            .gateway
            .read(
                CypherStatement::new(
                    "CALL vector_search.search('memory_vectors', $k, $embedding) \
                     YIELD node, similarity \
                     WITH node, similarity \
                     MATCH (u:User {userId: $userId})-[:HAS_MEMORY]->(node) \
                     WHERE node.invalidAt IS NULL AND node.state <> 'deleted' \
                     RETURN node.id AS id, node.content AS content, similarity \
                     ORDER BY similarity DESC",
                )
                .param("k", CANDIDATE_K)
                .param("embedding", &embedding)
                .param("userId", user_id),
            )
            .await?;

        let mut candidates = Vec::new();
        for row in &rows {
            let similarity = row.get_f64("similarity")?;
            if similarity >= threshold {
                candidates.push((row.get_string("id")?, row.get_string("content")?));
            }
        }
        if candidates.is_empty() {
            return Ok(DedupOutcome::Insert);
        }

        // Stage 2: LLM pair verification, strongest candidate first.
        for (existing_id, existing_content) in candidates {
            match self.classify_pair(text, &existing_content).await? {
                PairVerdict::Duplicate => return Ok(DedupOutcome::Skip { existing_id }),
                PairVerdict::Supersedes => return Ok(DedupOutcome::Supersede { existing_id }),
                PairVerdict::Different => {}
            }
        }
        Ok(DedupOutcome::Insert)
    }

    /// Classify a (new, existing) content pair, consulting the cache first.
    async fn classify_pair(
        &self,
        new_content: &str,
        existing_content: &str,
    ) -> MemForgeResult<PairVerdict> {
        let key = pair_key(new_content, existing_content);
        if let Some(verdict) = self.pair_cache.read().await.get(&key) {
            return Ok(*verdict);
        }

        let request = LlmRequest::from_messages(vec![
            LlmMessage::system(PAIR_SYSTEM_PROMPT),
            LlmMessage::user(format!(
                "NEW: {new_content}\nEXISTING: {existing_content}"
            )),
        ])
        .with_temperature(0.0)
        .with_max_tokens(10);

        let response = self.llm.complete(request).await?;
        let verdict = parse_verdict(&response.content);
        self.pair_cache.write().await.insert(key, verdict);
        Ok(verdict)
    }
}

/// Canonical hash of an ordered content pair.
fn pair_key(new_content: &str, existing_content: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    normalize_for_dedup(new_content).hash(&mut hasher);
    normalize_for_dedup(existing_content).hash(&mut hasher);
    hasher.finish()
}

/// Parse the one-word classifier answer; anything unexpected is DIFFERENT.
fn parse_verdict(answer: &str) -> PairVerdict {
    let upper = answer.trim().to_uppercase();
    if upper.starts_with("DUPLICATE") {
        PairVerdict::Duplicate
    } else if upper.starts_with("SUPERSEDES") {
        PairVerdict::Supersedes
    } else {
        PairVerdict::Different
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::embeddings::{EmbeddingBackend, EmbeddingProviderTrait};
    use crate::errors::MemForgeError;
    use crate::llm::{LlmProviderTrait, LlmResponse, LlmUsage};
    use crate::store::{Row, StoreDriver, VectorIndexSpec};

    #[test]
    fn test_parse_verdict() {
        assert_eq!(parse_verdict("DUPLICATE"), PairVerdict::Duplicate);
        assert_eq!(parse_verdict(" supersedes "), PairVerdict::Supersedes);
        assert_eq!(parse_verdict("DIFFERENT"), PairVerdict::Different);
        assert_eq!(parse_verdict("no idea"), PairVerdict::Different);
    }

    #[test]
    fn test_pair_key_is_order_sensitive_and_normalized() {
        assert_eq!(pair_key("  A  ", "b"), pair_key("a", "B"));
        assert_ne!(pair_key("a", "b"), pair_key("b", "a"));
    }

    /// Driver returning fixed vector-search candidates.
    struct CandidateDriver {
        hits: Vec<(String, String, f64)>,
    }

    #[async_trait]
    impl StoreDriver for CandidateDriver {
        async fn execute(&self, statement: &CypherStatement) -> MemForgeResult<Vec<Row>> {
            if statement.query.contains(":Config") {
                // Dedup config read falls back to defaults.
                return Ok(Vec::new());
            }
            assert!(statement.query.contains("vector_search.search"));
            Ok(self
                .hits
                .iter()
                .map(|(id, content, similarity)| {
                    let mut map = serde_json::Map::new();
                    map.insert("id".to_string(), json!(id));
                    map.insert("content".to_string(), json!(content));
                    map.insert("similarity".to_string(), json!(similarity));
                    Row::new(map)
                })
                .collect())
        }
        async fn execute_batch(
            &self,
            _statements: &[CypherStatement],
        ) -> MemForgeResult<Vec<Vec<Row>>> {
            Ok(Vec::new())
        }
        async fn vector_index_names(&self) -> MemForgeResult<Vec<String>> {
            Ok(vec!["memory_vectors".to_string(), "entity_vectors".to_string()])
        }
        async fn create_vector_index(&self, _spec: &VectorIndexSpec) -> MemForgeResult<()> {
            Ok(())
        }
        async fn reset(&self) -> MemForgeResult<()> {
            Ok(())
        }
    }

    struct FixedEmbedder;

    #[async_trait]
    impl EmbeddingProviderTrait for FixedEmbedder {
        fn provider_name(&self) -> &str {
            "stub"
        }
        fn model_name(&self) -> &str {
            "stub"
        }
        fn dimension(&self) -> usize {
            4
        }
        async fn embed_batch(&self, texts: &[String]) -> MemForgeResult<Vec<Vec<f32>>> {
            Ok(texts.iter().map(|_| vec![1.0, 0.0, 0.0, 0.0]).collect())
        }
    }

    /// LLM that replies with a fixed word and counts invocations.
    struct OneWordLlm {
        word: &'static str,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl LlmProviderTrait for OneWordLlm {
        fn provider_name(&self) -> &str {
            "scripted"
        }
        fn model_name(&self) -> &str {
            "scripted"
        }
        async fn complete(&self, _request: LlmRequest) -> MemForgeResult<LlmResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(LlmResponse {
                content: self.word.to_string(),
                model: "scripted".to_string(),
                usage: LlmUsage::default(),
            })
        }
    }

    fn engine_with(
        hits: Vec<(String, String, f64)>,
        llm: Arc<OneWordLlm>,
    ) -> DeduplicationEngine {
        let gateway = Arc::new(StoreGateway::new(Arc::new(CandidateDriver { hits }), 4));
        let config = Arc::new(ConfigCache::new(gateway.clone()));
        DeduplicationEngine::new(
            gateway,
            EmbeddingRouter::from_provider(Arc::new(FixedEmbedder), EmbeddingBackend::Intelli),
            LlmClient::new(llm),
            config,
        )
    }

    #[tokio::test]
    async fn test_below_threshold_inserts_without_llm() {
        let llm = Arc::new(OneWordLlm {
            word: "DUPLICATE",
            calls: AtomicUsize::new(0),
        });
        // Intelli threshold is 0.55; a 0.40 top hit short-circuits.
        let engine = engine_with(vec![("M1".to_string(), "something".to_string(), 0.40)], llm.clone());
        assert_eq!(engine.check("u1", "new fact").await, DedupOutcome::Insert);
        assert_eq!(llm.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_duplicate_hit_skips() {
        let llm = Arc::new(OneWordLlm {
            word: "DUPLICATE",
            calls: AtomicUsize::new(0),
        });
        let engine = engine_with(
            vec![("M1".to_string(), "My blood type is O positive.".to_string(), 0.93)],
            llm.clone(),
        );
        assert_eq!(
            engine.check("u1", "Blood type: O+").await,
            DedupOutcome::Skip {
                existing_id: "M1".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_supersedes_hit() {
        let llm = Arc::new(OneWordLlm {
            word: "SUPERSEDES",
            calls: AtomicUsize::new(0),
        });
        let engine = engine_with(
            vec![("M7".to_string(), "I live in NYC".to_string(), 0.88)],
            llm,
        );
        assert_eq!(
            engine.check("u1", "I moved to London").await,
            DedupOutcome::Supersede {
                existing_id: "M7".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_all_different_inserts() {
        let llm = Arc::new(OneWordLlm {
            word: "DIFFERENT",
            calls: AtomicUsize::new(0),
        });
        let engine = engine_with(
            vec![
                ("M1".to_string(), "fact one".to_string(), 0.80),
                ("M2".to_string(), "fact two".to_string(), 0.70),
            ],
            llm.clone(),
        );
        assert_eq!(engine.check("u1", "a third fact").await, DedupOutcome::Insert);
        assert_eq!(llm.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_pair_cache_skips_repeat_llm_calls() {
        let llm = Arc::new(OneWordLlm {
            word: "DUPLICATE",
            calls: AtomicUsize::new(0),
        });
        let engine = engine_with(
            vec![("M1".to_string(), "existing".to_string(), 0.90)],
            llm.clone(),
        );
        engine.check("u1", "candidate").await;
        engine.check("u1", "candidate").await;
        assert_eq!(llm.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_embedding_failure_fails_open() {
        struct BrokenEmbedder;

        #[async_trait]
        impl EmbeddingProviderTrait for BrokenEmbedder {
            fn provider_name(&self) -> &str {
                "broken"
            }
            fn model_name(&self) -> &str {
                "broken"
            }
            fn dimension(&self) -> usize {
                4
            }
            async fn embed_batch(&self, _texts: &[String]) -> MemForgeResult<Vec<Vec<f32>>> {
                Err(MemForgeError::embedding("backend down"))
            }
        }

        let gateway = Arc::new(StoreGateway::new(
            Arc::new(CandidateDriver { hits: Vec::new() }),
            4,
        ));
        let config = Arc::new(ConfigCache::new(gateway.clone()));
        let engine = DeduplicationEngine::new(
            gateway,
            EmbeddingRouter::from_provider(Arc::new(BrokenEmbedder), EmbeddingBackend::Intelli),
            LlmClient::new(Arc::new(OneWordLlm {
                word: "DUPLICATE",
                calls: AtomicUsize::new(0),
            })),
            config,
        );
        assert_eq!(engine.check("u1", "anything").await, DedupOutcome::Insert);
    }
}
