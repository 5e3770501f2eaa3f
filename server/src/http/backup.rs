//! Backup export/import.
//!
//! Export produces a ZIP holding `memories.json` (pretty array) and a
//! gzipped `memories.jsonl`. Import accepts that ZIP back, re-embeds the
//! contents with the currently configured backend, and MERGEs by memory id
//! with skip or overwrite semantics.

use std::io::{Cursor, Read, Write};
use std::sync::Arc;

use axum::extract::{Multipart, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::Deserialize;
use serde_json::{json, Value};
use zip::write::SimpleFileOptions;

use memforge_core::errors::MemForgeError;
use memforge_core::store::CypherStatement;
use memforge_core::types::Hex32Id;

use crate::state::AppState;

use super::{resolve_user, ApiError};

#[derive(Debug, Deserialize)]
pub(crate) struct ExportParams {
    user_id: Option<String>,
}

/// `POST /api/v1/backup/export` - ZIP of the user's memories.
pub(crate) async fn export(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(params): Query<ExportParams>,
) -> Result<Response, ApiError> {
    let user_id = resolve_user(params.user_id.as_deref(), &headers)?;
    let rows = state
        .gateway
        .read(
            CypherStatement::new(
                "MATCH (u:User {userId: $userId})-[:HAS_MEMORY]->(m:Memory) \
                 OPTIONAL MATCH (m)-[:HAS_CATEGORY]->(c:Category) \
                 RETURN m.id AS id, m.content AS content, m.state AS state, \
                        m.metadata AS metadata, m.tags AS tags, \
                        m.validAt AS validAt, m.invalidAt AS invalidAt, \
                        m.createdAt AS createdAt, m.updatedAt AS updatedAt, \
                        collect(DISTINCT c.name) AS categories \
                 ORDER BY m.createdAt",
            )
            .param("userId", &user_id),
        )
        .await?;

    let records: Vec<Value> = rows
        .iter()
        .map(|row| {
            json!({
                "id": row.opt_string("id"),
                "content": row.opt_string("content"),
                "state": row.opt_string("state"),
                "metadata": row.opt_string("metadata"),
                "tags": row.string_list("tags"),
                "validAt": row.opt_string("validAt"),
                "invalidAt": row.opt_string("invalidAt"),
                "createdAt": row.opt_string("createdAt"),
                "updatedAt": row.opt_string("updatedAt"),
                "categories": row.string_list("categories"),
            })
        })
        .collect();

    let archive = build_archive(&records)
        .map_err(|e| ApiError(MemForgeError::memory(format!("archive build failed: {e}"))))?;

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "application/zip".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"memforge-{user_id}.zip\""),
            ),
        ],
        archive,
    )
        .into_response())
}

#[derive(Debug, Deserialize)]
pub(crate) struct ImportParams {
    user_id: Option<String>,
    /// `skip` (default) leaves existing ids untouched; `overwrite`
    /// replaces their content and metadata.
    mode: Option<String>,
}

/// `POST /api/v1/backup/import` - upload a backup ZIP and reindex.
pub(crate) async fn import(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(params): Query<ImportParams>,
    mut multipart: Multipart,
) -> Result<Json<Value>, ApiError> {
    let user_id = resolve_user(params.user_id.as_deref(), &headers)?;
    let overwrite = params.mode.as_deref() == Some("overwrite");

    let mut upload: Option<Vec<u8>> = None;
    while let Ok(Some(field)) = multipart.next_field().await {
        if let Ok(bytes) = field.bytes().await {
            upload = Some(bytes.to_vec());
            break;
        }
    }
    let upload = upload.ok_or_else(|| {
        ApiError(MemForgeError::validation("file", "a backup file is required"))
    })?;

    let records = read_archive(&upload)
        .map_err(|e| ApiError(MemForgeError::validation("file", format!("invalid backup: {e}"))))?;
    if records.is_empty() {
        return Ok(Json(json!({"imported": 0, "user_id": user_id})));
    }

    // Reindex: embeddings are never trusted from the archive.
    let contents: Vec<String> = records
        .iter()
        .map(|r| {
            r.get("content")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        })
        .collect();
    let embeddings = state.embeddings.embed_batch(&contents).await?;

    let now = chrono::Utc::now().to_rfc3339();
    let memories: Vec<Value> = records
        .iter()
        .zip(embeddings.iter())
        .map(|(record, embedding)| {
            json!({
                "id": record
                    .get("id")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| Hex32Id::generate().to_string()),
                "content": record.get("content").and_then(Value::as_str).unwrap_or_default(),
                "state": record.get("state").and_then(Value::as_str).unwrap_or("active"),
                "metadata": record.get("metadata").and_then(Value::as_str).unwrap_or("{}"),
                "tags": record.get("tags").cloned().unwrap_or_else(|| json!([])),
                "validAt": record.get("validAt").and_then(Value::as_str).unwrap_or(&now),
                "invalidAt": record.get("invalidAt").cloned().unwrap_or(Value::Null),
                "createdAt": record.get("createdAt").and_then(Value::as_str).unwrap_or(&now),
                "embedding": embedding,
            })
        })
        .collect();

    let set_clause = "m.content = mem.content, m.state = mem.state, \
                      m.metadata = mem.metadata, m.tags = mem.tags, \
                      m.validAt = mem.validAt, m.invalidAt = mem.invalidAt, \
                      m.createdAt = mem.createdAt, m.updatedAt = $now, \
                      m.embedding = mem.embedding, \
                      m.extractionStatus = 'pending', m.extractionAttempts = 0";
    let query = if overwrite {
        format!(
            "MERGE (u:User {{userId: $userId}}) \
             ON CREATE SET u.id = $userGraphId, u.createdAt = $now \
             WITH u UNWIND $memories AS mem \
             MERGE (m:Memory {{id: mem.id}}) \
             ON CREATE SET {set_clause} \
             ON MATCH SET {set_clause} \
             MERGE (u)-[:HAS_MEMORY]->(m)"
        )
    } else {
        format!(
            "MERGE (u:User {{userId: $userId}}) \
             ON CREATE SET u.id = $userGraphId, u.createdAt = $now \
             WITH u UNWIND $memories AS mem \
             MERGE (m:Memory {{id: mem.id}}) \
             ON CREATE SET {set_clause} \
             MERGE (u)-[:HAS_MEMORY]->(m)"
        )
    };

    let imported = memories.len();
    state
        .gateway
        .write(
            CypherStatement::new(query)
                .param("userId", &user_id)
                .param("userGraphId", Hex32Id::from_content(&user_id).to_string())
                .param("memories", memories)
                .param("now", &now),
        )
        .await?;

    Ok(Json(json!({
        "imported": imported,
        "mode": if overwrite { "overwrite" } else { "skip" },
        "user_id": user_id,
    })))
}

/// ZIP with `memories.json` and gzipped `memories.jsonl`.
fn build_archive(records: &[Value]) -> Result<Vec<u8>, String> {
    let json_bytes = serde_json::to_vec_pretty(records).map_err(|e| e.to_string())?;

    let mut gz = GzEncoder::new(Vec::new(), Compression::default());
    for record in records {
        serde_json::to_writer(&mut gz, record).map_err(|e| e.to_string())?;
        gz.write_all(b"\n").map_err(|e| e.to_string())?;
    }
    let gz_bytes = gz.finish().map_err(|e| e.to_string())?;

    let mut cursor = Cursor::new(Vec::new());
    {
        let mut archive = zip::ZipWriter::new(&mut cursor);
        let deflated =
            SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);
        archive
            .start_file("memories.json", deflated)
            .map_err(|e| e.to_string())?;
        archive.write_all(&json_bytes).map_err(|e| e.to_string())?;
        // Already gzip-compressed; store as-is.
        let stored =
            SimpleFileOptions::default().compression_method(zip::CompressionMethod::Stored);
        archive
            .start_file("memories.jsonl.gz", stored)
            .map_err(|e| e.to_string())?;
        archive.write_all(&gz_bytes).map_err(|e| e.to_string())?;
        archive.finish().map_err(|e| e.to_string())?;
    }
    Ok(cursor.into_inner())
}

/// Extract the record array from an uploaded backup ZIP (falling back to a
/// bare JSON array upload).
fn read_archive(bytes: &[u8]) -> Result<Vec<Value>, String> {
    if let Ok(mut archive) = zip::ZipArchive::new(Cursor::new(bytes)) {
        let mut file = archive
            .by_name("memories.json")
            .map_err(|e| format!("memories.json missing: {e}"))?;
        let mut contents = String::new();
        file.read_to_string(&mut contents)
            .map_err(|e| e.to_string())?;
        return serde_json::from_str(&contents).map_err(|e| e.to_string());
    }
    serde_json::from_slice(bytes).map_err(|e| e.to_string())
}
