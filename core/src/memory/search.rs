//! Hybrid search: full-text and vector arms fused by reciprocal rank.
//!
//! Both arms run user-anchored with the bi-temporal predicates
//! (`invalidAt IS NULL AND state <> 'deleted'`). Fusion assigns each
//! memory `Σ 1/(K + rank)` over the arms it appears in, K = 60. Category,
//! date, and tag post-filters run against an oversampled fetch at the
//! surface boundary so filtering does not starve the result set, and
//! surviving hits get an ACCESSED edge logged off the request path.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::embeddings::EmbeddingRouter;
use crate::errors::MemForgeResult;
use crate::store::{CypherStatement, Row, StoreGateway};
use crate::types::Hex32Id;

use super::tasks::TaskSupervisor;
use super::types::{parse_timestamp, SearchHit};

/// Reciprocal-rank-fusion constant.
pub const RRF_K: f64 = 60.0;

/// RRF floor above which a vector-only result set still counts as
/// confident (derived from K = 60).
pub const CONFIDENCE_RRF_FLOOR: f64 = 0.012;

/// Normalization denominator for display scores: the best possible
/// both-arm score, 2/(60+1).
pub const DISPLAY_SCORE_DENOMINATOR: f64 = 0.032786;

/// Which arms to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchMode {
    /// Both arms, fused.
    Hybrid,
    /// Full-text only.
    Text,
    /// Vector only.
    Vector,
}

impl SearchMode {
    /// Parse a mode, defaulting to hybrid.
    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "text" => Self::Text,
            "vector" => Self::Vector,
            _ => Self::Hybrid,
        }
    }
}

/// Post-filters applied at the surface boundary.
#[derive(Debug, Clone, Default)]
pub struct SearchFilters {
    /// Case-insensitive category name.
    pub category: Option<String>,
    /// Only memories created after this instant.
    pub created_after: Option<DateTime<Utc>>,
    /// Case-insensitive exact tag match.
    pub tag: Option<String>,
}

impl SearchFilters {
    /// Whether any filter is set.
    pub fn is_empty(&self) -> bool {
        self.category.is_none() && self.created_after.is_none() && self.tag.is_none()
    }
}

/// Result of a filtered search.
pub struct FilteredSearch {
    /// Surviving hits, capped to the requested limit.
    pub hits: Vec<SearchHit>,
    /// Set when a tag filter dropped more than 70% of raw hits.
    pub tag_filter_warning: bool,
}

/// One hydrated arm result, before fusion.
struct ArmHit {
    id: String,
    content: String,
    created_at: Option<DateTime<Utc>>,
    updated_at: Option<DateTime<Utc>>,
    app_name: Option<String>,
    categories: Vec<String>,
    tags: Vec<String>,
}

impl ArmHit {
    fn from_row(row: &Row) -> MemForgeResult<Self> {
        Ok(Self {
            id: row.get_string("id")?,
            content: row.opt_string("content").unwrap_or_default(),
            created_at: parse_timestamp(row.opt_string("createdAt")),
            updated_at: parse_timestamp(row.opt_string("updatedAt")),
            app_name: row.opt_string("appName"),
            categories: row.string_list("categories"),
            tags: row.string_list("tags"),
        })
    }
}

/// Full-text + vector search engine with RRF fusion.
pub struct HybridSearchEngine {
    gateway: Arc<StoreGateway>,
    embeddings: EmbeddingRouter,
    tasks: Arc<TaskSupervisor>,
}

impl HybridSearchEngine {
    /// Create an engine over the shared services.
    pub fn new(
        gateway: Arc<StoreGateway>,
        embeddings: EmbeddingRouter,
        tasks: Arc<TaskSupervisor>,
    ) -> Self {
        Self {
            gateway,
            embeddings,
            tasks,
        }
    }

    /// Run a search and return the fused, ranked hits.
    pub async fn search(
        &self,
        user_id: &str,
        query: &str,
        top_k: usize,
        mode: SearchMode,
    ) -> MemForgeResult<Vec<SearchHit>> {
        let text_hits = match mode {
            SearchMode::Vector => Vec::new(),
            _ => self.text_arm(user_id, query, top_k).await?,
        };
        let vector_hits = match mode {
            SearchMode::Text => Vec::new(),
            _ => self.vector_arm(user_id, query, top_k).await?,
        };
        Ok(fuse(text_hits, vector_hits))
    }

    /// Search with post-filters against an oversampled fetch, then cap to
    /// `limit` and log ACCESSED edges for the survivors.
    pub async fn search_filtered(
        &self,
        user_id: &str,
        query: &str,
        limit: usize,
        mode: SearchMode,
        filters: &SearchFilters,
        accessing_app: Option<&str>,
    ) -> MemForgeResult<FilteredSearch> {
        let fetch = oversample(limit, filters);
        let raw = self.search(user_id, query, fetch, mode).await?;
        let raw_count = raw.len();

        let surviving: Vec<SearchHit> = raw
            .into_iter()
            .filter(|hit| passes_filters(hit, filters))
            .collect();
        let tag_filter_warning = filters.tag.is_some()
            && raw_count > 0
            && (surviving.len() as f64) < (raw_count as f64) * 0.3;

        let hits: Vec<SearchHit> = surviving.into_iter().take(limit).collect();

        if let Some(app_name) = accessing_app {
            self.log_access(
                user_id,
                app_name,
                query,
                hits.iter().map(|h| h.id.clone()).collect(),
            );
        }

        Ok(FilteredSearch {
            hits,
            tag_filter_warning,
        })
    }

    /// Whether a result set is confident: any text-ranked hit, or a max
    /// RRF score above the floor.
    pub fn is_confident(hits: &[SearchHit]) -> bool {
        hits.iter().any(|hit| hit.text_rank.is_some())
            || hits
                .iter()
                .any(|hit| hit.rrf_score > CONFIDENCE_RRF_FLOOR)
    }

    /// Normalized display score in `[0, 1]`.
    pub fn display_score(rrf_score: f64) -> f64 {
        (rrf_score / DISPLAY_SCORE_DENOMINATOR).min(1.0)
    }

    /// Full-text arm: BM25-style ranked lookup, user-anchored and current.
    async fn text_arm(
        &self,
        user_id: &str,
        query: &str,
        limit: usize,
    ) -> MemForgeResult<Vec<ArmHit>> {
        let rows = self
            .gateway
            .read(
                CypherStatement::new(
                    "CALL text_search.search('memoryContent', $query) YIELD node, score \
                     WITH node, score \
                     MATCH (u:User {userId: $userId})-[:HAS_MEMORY]->(node) \
                     WHERE node.invalidAt IS NULL AND node.state <> 'deleted' \
                     OPTIONAL MATCH (node)-[:CREATED_BY]->(a:App) \
                     OPTIONAL MATCH (node)-[:HAS_CATEGORY]->(c:Category) \
                     RETURN node.id AS id, node.content AS content, \
                            node.createdAt AS createdAt, node.updatedAt AS updatedAt, \
                            node.tags AS tags, a.appName AS appName, \
                            collect(DISTINCT c.name) AS categories, score \
                     ORDER BY score DESC LIMIT $limit",
                )
                .param("query", query)
                .param("userId", user_id)
                .param("limit", limit),
            )
            .await?;
        rows.iter().map(ArmHit::from_row).collect()
    }

    /// Vector arm: ANN with a 2x fetch limit, capped to `top_k` after the
    /// user-anchor and bi-temporal filters.
    async fn vector_arm(
        &self,
        user_id: &str,
        query: &str,
        top_k: usize,
    ) -> MemForgeResult<Vec<ArmHit>> {
        let embedding = self.embeddings.embed(query).await?;
        self.gateway.ensure_vector_indexes().await?;
        let rows = self
            .gateway
            .read(
                CypherStatement::new(
                    "CALL vector_search.search('memory_vectors', $fetchLimit, $embedding) \
                     YIELD node, similarity \
                     WITH node, similarity \
                     MATCH (u:User {userId: $userId})-[:HAS_MEMORY]->(node) \
                     WHERE node.invalidAt IS NULL AND node.state <> 'deleted' \
                     OPTIONAL MATCH (node)-[:CREATED_BY]->(a:App) \
                     OPTIONAL MATCH (node)-[:HAS_CATEGORY]->(c:Category) \
                     RETURN node.id AS id, node.content AS content, \
                            node.createdAt AS createdAt, node.updatedAt AS updatedAt, \
                            node.tags AS tags, a.appName AS appName, \
                            collect(DISTINCT c.name) AS categories, similarity \
                     ORDER BY similarity DESC LIMIT $topK",
                )
                .param("fetchLimit", top_k * 2)
                .param("embedding", &embedding)
                .param("userId", user_id)
                .param("topK", top_k),
            )
            .await?;
        rows.iter().map(ArmHit::from_row).collect()
    }

    /// MERGE ACCESSED edges for the surviving results, off the request
    /// path.
    fn log_access(&self, user_id: &str, app_name: &str, query: &str, memory_ids: Vec<String>) {
        if memory_ids.is_empty() {
            return;
        }
        let gateway = self.gateway.clone();
        let user_id = user_id.to_string();
        let app_name = app_name.to_string();
        let query = query.to_string();
        self.tasks.spawn("access_logging", async move {
            gateway
                .write(
                    CypherStatement::new(
                        "MATCH (u:User {userId: $userId}) \
                         MERGE (a:App {appName: $appName, userId: $userId}) \
                         ON CREATE SET a.id = $appId, a.isActive = true, a.createdAt = $now \
                         WITH u, a \
                         UNWIND $memoryIds AS mid \
                         MATCH (u)-[:HAS_MEMORY]->(m:Memory {id: mid}) \
                         MERGE (a)-[r:ACCESSED]->(m) \
                         ON CREATE SET r.accessCount = 1, r.accessedAt = $now, r.queryUsed = $query \
                         ON MATCH SET r.accessCount = coalesce(r.accessCount, 0) + 1, \
                                      r.accessedAt = $now, r.queryUsed = $query",
                    )
                    .param("userId", user_id)
                    .param("appName", app_name)
                    .param("appId", Hex32Id::generate().to_string())
                    .param("memoryIds", memory_ids)
                    .param("query", query)
                    .param("now", Utc::now().to_rfc3339()),
                )
                .await?;
            Ok(())
        });
    }
}

/// Oversampling factor for post-filtered fetches: at least 5x the limit,
/// 10x when a tag filter is in play, never below 200.
fn oversample(limit: usize, filters: &SearchFilters) -> usize {
    if filters.is_empty() {
        return limit;
    }
    let factor = if filters.tag.is_some() { 10 } else { 5 };
    (limit * factor).max(200)
}

fn passes_filters(hit: &SearchHit, filters: &SearchFilters) -> bool {
    if let Some(category) = &filters.category {
        if !hit
            .categories
            .iter()
            .any(|c| c.eq_ignore_ascii_case(category))
        {
            return false;
        }
    }
    if let Some(created_after) = filters.created_after {
        match hit.created_at {
            Some(created_at) if created_at > created_after => {}
            _ => return false,
        }
    }
    if let Some(tag) = &filters.tag {
        if !hit.tags.iter().any(|t| t.eq_ignore_ascii_case(tag)) {
            return false;
        }
    }
    true
}

/// Reciprocal rank fusion of the two arms. Arm ranks are 1-based in the
/// order the arms returned them; the sort is stable so equal scores keep
/// text-arm-first order.
fn fuse(text_hits: Vec<ArmHit>, vector_hits: Vec<ArmHit>) -> Vec<SearchHit> {
    let mut fused: Vec<SearchHit> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    for (rank0, hit) in text_hits.into_iter().enumerate() {
        let rank = rank0 + 1;
        index.insert(hit.id.clone(), fused.len());
        fused.push(SearchHit {
            id: hit.id,
            content: hit.content,
            created_at: hit.created_at,
            updated_at: hit.updated_at,
            app_name: hit.app_name,
            categories: hit.categories,
            tags: hit.tags,
            text_rank: Some(rank),
            vector_rank: None,
            rrf_score: 1.0 / (RRF_K + rank as f64),
        });
    }

    for (rank0, hit) in vector_hits.into_iter().enumerate() {
        let rank = rank0 + 1;
        if let Some(&position) = index.get(&hit.id) {
            fused[position].vector_rank = Some(rank);
            fused[position].rrf_score += 1.0 / (RRF_K + rank as f64);
        } else {
            index.insert(hit.id.clone(), fused.len());
            fused.push(SearchHit {
                id: hit.id,
                content: hit.content,
                created_at: hit.created_at,
                updated_at: hit.updated_at,
                app_name: hit.app_name,
                categories: hit.categories,
                tags: hit.tags,
                text_rank: None,
                vector_rank: Some(rank),
                rrf_score: 1.0 / (RRF_K + rank as f64),
            });
        }
    }

    fused.sort_by(|a, b| {
        b.rrf_score
            .partial_cmp(&a.rrf_score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    fused
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arm_hit(id: &str) -> ArmHit {
        ArmHit {
            id: id.to_string(),
            content: format!("content {id}"),
            created_at: None,
            updated_at: None,
            app_name: None,
            categories: Vec::new(),
            tags: Vec::new(),
        }
    }

    fn hit_with(id: &str, categories: &[&str], tags: &[&str]) -> SearchHit {
        SearchHit {
            id: id.to_string(),
            content: String::new(),
            created_at: Some(Utc::now()),
            updated_at: None,
            app_name: None,
            categories: categories.iter().map(|s| s.to_string()).collect(),
            tags: tags.iter().map(|s| s.to_string()).collect(),
            text_rank: Some(1),
            vector_rank: None,
            rrf_score: 1.0 / 61.0,
        }
    }

    #[test]
    fn test_rrf_single_arm_scores() {
        let fused = fuse(vec![arm_hit("T1"), arm_hit("T2")], vec![arm_hit("V1")]);
        let by_id: HashMap<&str, &SearchHit> =
            fused.iter().map(|h| (h.id.as_str(), h)).collect();

        // Text rank 1 and vector rank 1 both score 1/61.
        assert!((by_id["T1"].rrf_score - 1.0 / 61.0).abs() < 1e-12);
        assert!((by_id["V1"].rrf_score - 1.0 / 61.0).abs() < 1e-12);
        assert!((by_id["T2"].rrf_score - 1.0 / 62.0).abs() < 1e-12);
        assert_eq!(by_id["T1"].text_rank, Some(1));
        assert_eq!(by_id["V1"].vector_rank, Some(1));
        assert!(by_id["V1"].text_rank.is_none());
    }

    #[test]
    fn test_rrf_both_arms_sum() {
        let fused = fuse(
            vec![arm_hit("A"), arm_hit("B")],
            vec![arm_hit("C"), arm_hit("B")],
        );
        let b = fused.iter().find(|h| h.id == "B").unwrap();
        assert_eq!(b.text_rank, Some(2));
        assert_eq!(b.vector_rank, Some(2));
        assert!((b.rrf_score - (1.0 / 62.0 + 1.0 / 62.0)).abs() < 1e-12);
    }

    #[test]
    fn test_fused_ordering_matches_spec_scenario() {
        // Keyword-only at text rank 1, vector-only at vector rank 1, and a
        // both-arm match at rank 2 in each: the both-arm match wins, the
        // single-arm matches tie and keep stable (text-first) order.
        let fused = fuse(
            vec![arm_hit("KW"), arm_hit("BOTH")],
            vec![arm_hit("VEC"), arm_hit("BOTH")],
        );
        assert_eq!(fused[0].id, "BOTH");
        assert!((fused[0].rrf_score - 2.0 / 62.0).abs() < 1e-12);
        assert_eq!(fused[1].id, "KW");
        assert_eq!(fused[2].id, "VEC");
        assert!((fused[1].rrf_score - 1.0 / 61.0).abs() < 1e-12);
        assert!((fused[2].rrf_score - 1.0 / 61.0).abs() < 1e-12);
    }

    #[test]
    fn test_confidence_heuristic() {
        let text_ranked = vec![hit_with("A", &[], &[])];
        assert!(HybridSearchEngine::is_confident(&text_ranked));

        let mut vector_only = vec![hit_with("B", &[], &[])];
        vector_only[0].text_rank = None;
        vector_only[0].rrf_score = 0.016;
        assert!(HybridSearchEngine::is_confident(&vector_only));

        vector_only[0].rrf_score = 0.010;
        assert!(!HybridSearchEngine::is_confident(&vector_only));
    }

    #[test]
    fn test_display_score_caps_at_one() {
        assert!((HybridSearchEngine::display_score(0.032786) - 1.0).abs() < 1e-9);
        assert!(HybridSearchEngine::display_score(0.5) <= 1.0);
        assert!(HybridSearchEngine::display_score(0.0164) < 1.0);
    }

    #[test]
    fn test_oversample_floors() {
        let no_filters = SearchFilters::default();
        assert_eq!(oversample(10, &no_filters), 10);

        let category = SearchFilters {
            category: Some("health".to_string()),
            ..Default::default()
        };
        assert_eq!(oversample(10, &category), 200);
        assert_eq!(oversample(50, &category), 250);

        let tag = SearchFilters {
            tag: Some("urgent".to_string()),
            ..Default::default()
        };
        assert_eq!(oversample(30, &tag), 300);
    }

    #[test]
    fn test_post_filters() {
        let hit = hit_with("A", &["Health"], &["Urgent", "home"]);

        let category = SearchFilters {
            category: Some("health".to_string()),
            ..Default::default()
        };
        assert!(passes_filters(&hit, &category));

        let wrong_category = SearchFilters {
            category: Some("travel".to_string()),
            ..Default::default()
        };
        assert!(!passes_filters(&hit, &wrong_category));

        let tag = SearchFilters {
            tag: Some("urgent".to_string()),
            ..Default::default()
        };
        assert!(passes_filters(&hit, &tag));

        let future = SearchFilters {
            created_after: Some(Utc::now() + chrono::Duration::days(1)),
            ..Default::default()
        };
        assert!(!passes_filters(&hit, &future));
    }

    #[test]
    fn test_search_mode_parse() {
        assert_eq!(SearchMode::from_str_lossy("text"), SearchMode::Text);
        assert_eq!(SearchMode::from_str_lossy("VECTOR"), SearchMode::Vector);
        assert_eq!(SearchMode::from_str_lossy("anything"), SearchMode::Hybrid);
    }
}
