//! App endpoints: listing with memory counts, pause/unpause.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use memforge_core::errors::MemForgeError;
use memforge_core::store::CypherStatement;

use crate::state::AppState;

use super::{resolve_user, ApiError};

#[derive(Debug, Deserialize)]
pub(crate) struct ListParams {
    user_id: Option<String>,
    name: Option<String>,
    is_active: Option<bool>,
}

/// `GET /api/v1/apps` - apps for the user, with per-app memory counts.
pub(crate) async fn list(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(params): Query<ListParams>,
) -> Result<Json<Value>, ApiError> {
    let user_id = resolve_user(params.user_id.as_deref(), &headers)?;
    let rows = state
        .gateway
        .read(
            CypherStatement::new(
                "MATCH (a:App {userId: $userId}) \
                 WHERE ($name IS NULL OR toLower(a.appName) CONTAINS toLower($name)) \
                   AND ($isActive IS NULL OR a.isActive = $isActive) \
                 OPTIONAL MATCH (m:Memory)-[:CREATED_BY]->(a) \
                 WHERE m.state <> 'deleted' \
                 RETURN a.id AS id, a.appName AS appName, a.isActive AS isActive, \
                        a.createdAt AS createdAt, count(m) AS memoryCount \
                 ORDER BY a.appName",
            )
            .param("userId", &user_id)
            .param("name", &params.name)
            .param("isActive", params.is_active),
        )
        .await?;

    let apps: Vec<Value> = rows
        .iter()
        .map(|row| {
            json!({
                "id": row.opt_string("id"),
                "name": row.opt_string("appName"),
                "is_active": row.get_bool("isActive"),
                "created_at": row.opt_string("createdAt"),
                "memory_count": row.opt_i64("memoryCount").unwrap_or(0),
            })
        })
        .collect();
    Ok(Json(json!({"apps": apps, "total": apps.len()})))
}

#[derive(Debug, Deserialize)]
pub(crate) struct UserParam {
    user_id: Option<String>,
}

/// `GET /api/v1/apps/{appId}` - single app or 404.
pub(crate) async fn fetch(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(app_id): Path<String>,
    Query(params): Query<UserParam>,
) -> Result<Json<Value>, ApiError> {
    let user_id = resolve_user(params.user_id.as_deref(), &headers)?;
    let rows = state
        .gateway
        .read(
            CypherStatement::new(
                "MATCH (a:App {id: $appId, userId: $userId}) \
                 OPTIONAL MATCH (m:Memory)-[:CREATED_BY]->(a) \
                 WHERE m.state <> 'deleted' \
                 RETURN a.id AS id, a.appName AS appName, a.isActive AS isActive, \
                        a.createdAt AS createdAt, count(m) AS memoryCount",
            )
            .param("appId", &app_id)
            .param("userId", &user_id),
        )
        .await?;
    let row = rows
        .first()
        .ok_or_else(|| ApiError(MemForgeError::not_found(format!("app {app_id}"))))?;
    Ok(Json(json!({
        "id": row.opt_string("id"),
        "name": row.opt_string("appName"),
        "is_active": row.get_bool("isActive"),
        "created_at": row.opt_string("createdAt"),
        "memory_count": row.opt_i64("memoryCount").unwrap_or(0),
    })))
}

#[derive(Debug, Deserialize)]
pub(crate) struct UpdateBody {
    user_id: Option<String>,
    is_active: bool,
}

/// `PUT /api/v1/apps/{appId}` - toggle `is_active`.
pub(crate) async fn update(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(app_id): Path<String>,
    Json(body): Json<UpdateBody>,
) -> Result<Json<Value>, ApiError> {
    let user_id = resolve_user(body.user_id.as_deref(), &headers)?;
    let rows = state
        .gateway
        .write(
            CypherStatement::new(
                "MATCH (a:App {id: $appId, userId: $userId}) \
                 SET a.isActive = $isActive \
                 RETURN a.id AS id, a.appName AS appName, a.isActive AS isActive",
            )
            .param("appId", &app_id)
            .param("userId", &user_id)
            .param("isActive", body.is_active),
        )
        .await?;
    let row = rows
        .first()
        .ok_or_else(|| ApiError(MemForgeError::not_found(format!("app {app_id}"))))?;
    Ok(Json(json!({
        "id": row.opt_string("id"),
        "name": row.opt_string("appName"),
        "is_active": row.get_bool("isActive"),
    })))
}
