//! REST surface over the memory core.
//!
//! All endpoints require a `user_id` (query string or `x-user-id` header).
//! Validation failures return 400 with `{detail}`; server failures return
//! `{error}`. Ownership violations surface as 404, indistinguishable from
//! absence.

mod apps;
mod backup;
mod memories;

use std::sync::Arc;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use memforge_core::errors::MemForgeError;
use memforge_core::types::retry::is_connection_error;

use crate::state::AppState;

/// Build the HTTP router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route(
            "/api/v1/memories",
            get(memories::list)
                .post(memories::create)
                .delete(memories::bulk_delete),
        )
        .route(
            "/api/v1/memories/:memory_id",
            get(memories::fetch).put(memories::supersede),
        )
        .route("/api/v1/memories/search", post(memories::search))
        .route("/api/v1/memories/reextract", post(memories::reextract))
        .route("/api/v1/categories", get(memories::categories))
        .route("/api/v1/apps", get(apps::list))
        .route("/api/v1/apps/:app_id", get(apps::fetch).put(apps::update))
        .route("/api/v1/communities/rebuild", post(memories::rebuild_communities))
        .route("/api/v1/backup/export", post(backup::export))
        .route("/api/v1/backup/import", post(backup::import))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Liveness plus an embedding-backend probe.
async fn health(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let embedding = state.embeddings.health_check().await;
    Json(json!({
        "status": if embedding.ok { "ok" } else { "degraded" },
        "version": memforge_core::VERSION,
        "embedding": embedding,
        "background_tasks": state.tasks.pending(),
    }))
}

/// HTTP error wrapper around core errors.
pub(crate) struct ApiError(pub MemForgeError);

impl From<MemForgeError> for ApiError {
    fn from(err: MemForgeError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match &self.0 {
            MemForgeError::Validation { .. } => (
                StatusCode::BAD_REQUEST,
                json!({"detail": self.0.to_string()}),
            ),
            MemForgeError::NotFound(_) => (
                StatusCode::NOT_FOUND,
                json!({"detail": "not found"}),
            ),
            MemForgeError::Store(_) if is_connection_error(&self.0) => (
                StatusCode::SERVICE_UNAVAILABLE,
                json!({"error": "backing service unavailable"}),
            ),
            _ => {
                tracing::error!(error = %self.0, "request failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    json!({"error": self.0.to_string()}),
                )
            }
        };
        (status, Json(body)).into_response()
    }
}

/// App-paused rejection (403).
pub(crate) fn app_paused() -> Response {
    (
        StatusCode::FORBIDDEN,
        Json(json!({"detail": "app is paused"})),
    )
        .into_response()
}

/// Resolve the calling user from the query string or `x-user-id` header.
pub(crate) fn resolve_user(
    query_user: Option<&str>,
    headers: &HeaderMap,
) -> Result<String, ApiError> {
    if let Some(user_id) = query_user.map(str::trim).filter(|u| !u.is_empty()) {
        return Ok(user_id.to_string());
    }
    if let Some(user_id) = headers
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|u| !u.is_empty())
    {
        return Ok(user_id.to_string());
    }
    Err(ApiError(MemForgeError::validation(
        "user_id",
        "user_id is required (query string or x-user-id header)",
    )))
}
