//! Memory endpoints.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use memforge_core::errors::MemForgeError;
use memforge_core::memory::search::{SearchFilters, SearchMode};
use memforge_core::memory::types::parse_timestamp;
use memforge_core::memory::{AddOptions, DedupOutcome, MemoryRecord};
use memforge_core::store::CypherStatement;

use crate::state::AppState;

use super::{app_paused, resolve_user, ApiError};

const MAX_PAGE_SIZE: usize = 100;
const MAX_TOP_K: usize = 50;

#[derive(Debug, Deserialize)]
pub(crate) struct ListParams {
    user_id: Option<String>,
    app_id: Option<String>,
    /// Comma-separated category names.
    categories: Option<String>,
    search_query: Option<String>,
    page: Option<usize>,
    size: Option<usize>,
    include_superseded: Option<bool>,
    as_of: Option<String>,
}

/// `GET /api/v1/memories` - paginated bi-temporal list, or hybrid search
/// when `search_query` is present.
pub(crate) async fn list(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(params): Query<ListParams>,
) -> Result<Json<Value>, ApiError> {
    let user_id = resolve_user(params.user_id.as_deref(), &headers)?;
    let page = params.page.unwrap_or(1).max(1);
    let size = params.size.unwrap_or(10).clamp(1, MAX_PAGE_SIZE);

    if let Some(query) = params
        .search_query
        .as_deref()
        .map(str::trim)
        .filter(|q| !q.is_empty())
    {
        let filters = SearchFilters {
            category: first_category(params.categories.as_deref()),
            created_after: None,
            tag: None,
        };
        let filtered = state
            .search
            .search_filtered(&user_id, query, page * size, SearchMode::Hybrid, &filters, None)
            .await?;
        let total = filtered.hits.len();
        let items: Vec<Value> = filtered
            .hits
            .into_iter()
            .skip((page - 1) * size)
            .take(size)
            .map(|hit| {
                json!({
                    "id": hit.id,
                    "content": hit.content,
                    "created_at": hit.created_at.map(|t| t.timestamp()),
                    "app_name": hit.app_name,
                    "categories": hit.categories,
                    "tags": hit.tags,
                    "rrf_score": hit.rrf_score,
                })
            })
            .collect();
        return Ok(Json(page_envelope(items, total, page, size)));
    }

    let category_list: Option<Vec<String>> = params.categories.as_deref().map(|csv| {
        csv.split(',')
            .map(|c| c.trim().to_lowercase())
            .filter(|c| !c.is_empty())
            .collect()
    });

    let rows = state
        .gateway
        .read(
            CypherStatement::new(
                "MATCH (u:User {userId: $userId})-[:HAS_MEMORY]->(m:Memory) \
                 WHERE m.state <> 'deleted' \
                   AND (CASE WHEN $asOf IS NULL \
                        THEN ($includeSuperseded OR m.invalidAt IS NULL) \
                        ELSE (m.validAt <= $asOf AND (m.invalidAt IS NULL OR m.invalidAt > $asOf)) END) \
                 OPTIONAL MATCH (m)-[:CREATED_BY]->(a:App) \
                 OPTIONAL MATCH (m)-[:HAS_CATEGORY]->(c:Category) \
                 WITH m, a, collect(c.name) AS categories \
                 WHERE ($appId IS NULL OR a.id = $appId) \
                   AND ($categoryList IS NULL \
                        OR any(name IN categories WHERE toLower(name) IN $categoryList)) \
                 WITH m, a, categories ORDER BY m.createdAt DESC \
                 WITH collect({id: m.id, content: m.content, state: m.state, \
                               metadata: m.metadata, tags: m.tags, \
                               validAt: m.validAt, invalidAt: m.invalidAt, \
                               createdAt: m.createdAt, updatedAt: m.updatedAt, \
                               appName: a.appName, categories: categories}) AS items \
                 RETURN size(items) AS total, \
                        items[toInteger($offset)..toInteger($offset) + toInteger($size)] AS page",
            )
            .param("userId", &user_id)
            .param("asOf", &params.as_of)
            .param("includeSuperseded", params.include_superseded.unwrap_or(false))
            .param("appId", &params.app_id)
            .param("categoryList", &category_list)
            .param("offset", (page - 1) * size)
            .param("size", size),
        )
        .await?;

    let (total, raw_items) = match rows.first() {
        Some(row) => (
            row.opt_i64("total").unwrap_or(0) as usize,
            row.value("page").and_then(Value::as_array).cloned().unwrap_or_default(),
        ),
        None => (0, Vec::new()),
    };
    let items: Vec<Value> = raw_items.iter().map(render_memory_item).collect();
    Ok(Json(page_envelope(items, total, page, size)))
}

#[derive(Debug, Deserialize)]
pub(crate) struct CreateBody {
    user_id: Option<String>,
    text: String,
    metadata: Option<serde_json::Map<String, Value>>,
    /// Run pre-write dedup (default true).
    infer: Option<bool>,
    app: Option<String>,
}

/// `POST /api/v1/memories` - dedup-gated create.
pub(crate) async fn create(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<CreateBody>,
) -> Result<axum::response::Response, ApiError> {
    let user_id = resolve_user(body.user_id.as_deref(), &headers)?;
    if body.text.trim().is_empty() {
        return Err(ApiError(MemForgeError::validation(
            "text",
            "must not be empty",
        )));
    }
    if let Some(app) = &body.app {
        if is_app_paused(&state, &user_id, app).await? {
            return Ok(app_paused());
        }
    }

    let outcome = if body.infer.unwrap_or(true) {
        state.dedup.check(&user_id, &body.text).await
    } else {
        DedupOutcome::Insert
    };

    let response = match outcome {
        DedupOutcome::Skip { existing_id } => {
            json!({"id": existing_id, "content": body.text, "event": "SKIP_DUPLICATE"})
        }
        DedupOutcome::Supersede { existing_id } => {
            let receipt = state
                .writer
                .supersede(&user_id, &existing_id, &body.text, body.app.as_deref(), None)
                .await?;
            json!({"id": receipt.id, "content": body.text, "event": "SUPERSEDE"})
        }
        DedupOutcome::Insert => {
            let receipt = state
                .writer
                .add(
                    &user_id,
                    &body.text,
                    AddOptions {
                        app_name: body.app.clone(),
                        metadata: body.metadata.clone(),
                        ..AddOptions::default()
                    },
                )
                .await?;
            json!({"id": receipt.id, "content": body.text, "event": "ADD"})
        }
    };
    Ok(Json(response).into_response())
}

#[derive(Debug, Deserialize)]
pub(crate) struct BulkDeleteBody {
    user_id: Option<String>,
    memory_ids: Vec<String>,
}

/// `DELETE /api/v1/memories` - bulk soft-delete in one UNWIND.
pub(crate) async fn bulk_delete(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<BulkDeleteBody>,
) -> Result<Json<Value>, ApiError> {
    let user_id = resolve_user(body.user_id.as_deref(), &headers)?;
    if body.memory_ids.is_empty() {
        return Err(ApiError(MemForgeError::validation(
            "memory_ids",
            "must not be empty",
        )));
    }
    let now = chrono::Utc::now().to_rfc3339();
    let rows = state
        .gateway
        .write(
            CypherStatement::new(
                "MATCH (u:User {userId: $userId}) \
                 UNWIND $memoryIds AS mid \
                 MATCH (u)-[:HAS_MEMORY]->(m:Memory {id: mid}) \
                 WHERE m.state <> 'deleted' \
                 SET m.state = 'deleted', m.invalidAt = $now, m.deletedAt = $now, \
                     m.updatedAt = $now \
                 RETURN count(m) AS deleted",
            )
            .param("userId", &user_id)
            .param("memoryIds", &body.memory_ids)
            .param("now", now),
        )
        .await?;
    let deleted = rows.first().and_then(|row| row.opt_i64("deleted")).unwrap_or(0);
    Ok(Json(json!({"deleted": deleted})))
}

#[derive(Debug, Deserialize)]
pub(crate) struct UserParam {
    user_id: Option<String>,
}

/// `GET /api/v1/memories/{id}` - user-anchored fetch or 404.
pub(crate) async fn fetch(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(memory_id): Path<String>,
    Query(params): Query<UserParam>,
) -> Result<Json<Value>, ApiError> {
    let user_id = resolve_user(params.user_id.as_deref(), &headers)?;
    let rows = state
        .gateway
        .read(
            CypherStatement::new(
                "MATCH (u:User {userId: $userId})-[:HAS_MEMORY]->(m:Memory {id: $memoryId}) \
                 OPTIONAL MATCH (newer:Memory)-[:SUPERSEDES]->(m) \
                 OPTIONAL MATCH (m)-[:CREATED_BY]->(a:App) \
                 OPTIONAL MATCH (m)-[:HAS_CATEGORY]->(c:Category) \
                 RETURN m.id AS id, m.content AS content, m.state AS state, \
                        m.metadata AS metadata, m.tags AS tags, \
                        m.validAt AS validAt, m.invalidAt AS invalidAt, \
                        m.createdAt AS createdAt, m.updatedAt AS updatedAt, \
                        a.appName AS appName, collect(DISTINCT c.name) AS categories, \
                        newer.id AS supersededBy",
            )
            .param("userId", &user_id)
            .param("memoryId", &memory_id),
        )
        .await?;
    let row = rows
        .first()
        .ok_or_else(|| ApiError(MemForgeError::not_found(format!("memory {memory_id}"))))?;

    let record = MemoryRecord::from_row(row)?;
    Ok(Json(json!({
        "id": record.id,
        "content": record.content,
        "state": record.state,
        "metadata": record.metadata,
        "tags": record.tags,
        "valid_at": record.valid_at.map(|t| t.to_rfc3339()),
        "invalid_at": record.invalid_at.map(|t| t.to_rfc3339()),
        "created_at": record.created_at.map(|t| t.timestamp()),
        "updated_at": record.updated_at.map(|t| t.timestamp()),
        "app_name": record.app_name,
        "categories": record.categories,
        "superseded_by": row.opt_string("supersededBy"),
        "is_current": record.is_current(),
    })))
}

#[derive(Debug, Deserialize)]
pub(crate) struct SupersedeBody {
    user_id: Option<String>,
    text: Option<String>,
    /// Legacy alias for `text`.
    memory_content: Option<String>,
    app_name: Option<String>,
}

/// `PUT /api/v1/memories/{id}` - ownership-verified supersede.
pub(crate) async fn supersede(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(memory_id): Path<String>,
    Json(body): Json<SupersedeBody>,
) -> Result<Json<Value>, ApiError> {
    let user_id = resolve_user(body.user_id.as_deref(), &headers)?;
    let text = body
        .text
        .or(body.memory_content)
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .ok_or_else(|| ApiError(MemForgeError::validation("text", "must not be empty")))?;

    let receipt = state
        .writer
        .supersede(&user_id, &memory_id, &text, body.app_name.as_deref(), None)
        .await?;
    Ok(Json(json!({
        "id": receipt.id,
        "supersedes": memory_id,
        "content": text,
    })))
}

#[derive(Debug, Deserialize)]
pub(crate) struct SearchBody {
    user_id: Option<String>,
    query: String,
    app_name: Option<String>,
    top_k: Option<usize>,
    mode: Option<String>,
}

/// `POST /api/v1/memories/search` - direct hybrid search.
pub(crate) async fn search(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<SearchBody>,
) -> Result<Json<Value>, ApiError> {
    let user_id = resolve_user(body.user_id.as_deref(), &headers)?;
    if body.query.trim().is_empty() {
        return Err(ApiError(MemForgeError::validation(
            "query",
            "must not be empty",
        )));
    }
    let top_k = body.top_k.unwrap_or(10).clamp(1, MAX_TOP_K);
    let mode = SearchMode::from_str_lossy(body.mode.as_deref().unwrap_or("hybrid"));
    let filtered = state
        .search
        .search_filtered(
            &user_id,
            &body.query,
            top_k,
            mode,
            &SearchFilters::default(),
            body.app_name.as_deref(),
        )
        .await?;
    let results: Vec<Value> = filtered
        .hits
        .iter()
        .map(|hit| {
            json!({
                "id": hit.id,
                "content": hit.content,
                "created_at": hit.created_at.map(|t| t.timestamp()),
                "app_name": hit.app_name,
                "categories": hit.categories,
                "tags": hit.tags,
                "text_rank": hit.text_rank,
                "vector_rank": hit.vector_rank,
                "rrf_score": hit.rrf_score,
            })
        })
        .collect();
    Ok(Json(json!({"results": results})))
}

/// `POST /api/v1/memories/reextract` - enqueue extraction for every memory
/// of the user.
pub(crate) async fn reextract(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(params): Query<UserParam>,
) -> Result<Json<Value>, ApiError> {
    let user_id = resolve_user(params.user_id.as_deref(), &headers)?;
    let queued = state.extractor.reextract(&user_id).await?;
    Ok(Json(json!({"queued": queued, "user_id": user_id})))
}

/// `POST /api/v1/communities/rebuild` - re-detect and re-summarize the
/// user's community hierarchy.
pub(crate) async fn rebuild_communities(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(params): Query<UserParam>,
) -> Result<Json<Value>, ApiError> {
    let user_id = resolve_user(params.user_id.as_deref(), &headers)?;
    let rebuild = state.community.rebuild(&user_id).await?;
    Ok(Json(json!({
        "communities": rebuild.communities,
        "parents": rebuild.parents,
        "user_id": user_id,
    })))
}

/// `GET /api/v1/categories` - per-user category counts.
pub(crate) async fn categories(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(params): Query<UserParam>,
) -> Result<Json<Value>, ApiError> {
    let user_id = resolve_user(params.user_id.as_deref(), &headers)?;
    let rows = state
        .gateway
        .read(
            CypherStatement::new(
                "MATCH (u:User {userId: $userId})-[:HAS_MEMORY]->(m:Memory)-[:HAS_CATEGORY]->(c:Category) \
                 WHERE m.invalidAt IS NULL AND m.state <> 'deleted' \
                 RETURN c.name AS name, count(m) AS count ORDER BY count DESC",
            )
            .param("userId", &user_id),
        )
        .await?;
    let categories: Vec<Value> = rows
        .iter()
        .map(|row| {
            json!({
                "name": row.opt_string("name"),
                "count": row.opt_i64("count").unwrap_or(0),
            })
        })
        .collect();
    Ok(Json(json!({"categories": categories})))
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

use axum::response::IntoResponse;

fn page_envelope(items: Vec<Value>, total: usize, page: usize, size: usize) -> Value {
    let pages = total.div_ceil(size);
    json!({
        "items": items,
        "total": total,
        "page": page,
        "size": size,
        "pages": pages,
    })
}

/// Translate a stored item (collect() map) into the wire shape: Unix
/// seconds for UI timestamps, raw ISO for the bi-temporal pair.
fn render_memory_item(raw: &Value) -> Value {
    let invalid_at = raw.get("invalidAt").cloned().unwrap_or(Value::Null);
    json!({
        "id": raw.get("id"),
        "content": raw.get("content"),
        "state": raw.get("state"),
        "metadata": raw.get("metadata"),
        "tags": raw.get("tags"),
        "valid_at": raw.get("validAt"),
        "invalid_at": invalid_at,
        "created_at": raw
            .get("createdAt")
            .and_then(Value::as_str)
            .and_then(|s| parse_timestamp(Some(s.to_string())))
            .map(|t| t.timestamp()),
        "app_name": raw.get("appName"),
        "categories": raw.get("categories"),
        "is_current": invalid_at.is_null(),
    })
}

fn first_category(csv: Option<&str>) -> Option<String> {
    csv.and_then(|csv| {
        csv.split(',')
            .map(str::trim)
            .find(|c| !c.is_empty())
            .map(str::to_string)
    })
}

/// Whether an App exists for this user and is paused.
pub(crate) async fn is_app_paused(
    state: &AppState,
    user_id: &str,
    app_name: &str,
) -> Result<bool, ApiError> {
    let rows = state
        .gateway
        .read(
            CypherStatement::new(
                "MATCH (a:App {appName: $appName, userId: $userId}) \
                 RETURN a.isActive AS isActive",
            )
            .param("appName", app_name)
            .param("userId", user_id),
        )
        .await?;
    Ok(rows
        .first()
        .map(|row| !row.get_bool("isActive"))
        .unwrap_or(false))
}
