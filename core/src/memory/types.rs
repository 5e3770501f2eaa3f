//! Core data types for the memory graph.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::errors::MemForgeResult;
use crate::store::Row;

/// Open metadata attached to memories, entities, and relationship edges.
///
/// Stored on nodes as a JSON string (default `"{}"`); typed as a JSON object
/// in memory so shallow merges are well-defined.
pub type MetadataMap = serde_json::Map<String, Value>;

/// Lifecycle state of a memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryState {
    /// Currently valid and searchable.
    Active,
    /// Explicitly closed out; excluded from current-time queries.
    Archived,
    /// Temporarily muted but still valid.
    Paused,
    /// Soft-deleted.
    Deleted,
}

impl MemoryState {
    /// Store-side string form.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Archived => "archived",
            Self::Paused => "paused",
            Self::Deleted => "deleted",
        }
    }

    /// Parse a state, defaulting unknown values to `Active`.
    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "archived" => Self::Archived,
            "paused" => Self::Paused,
            "deleted" => Self::Deleted,
            _ => Self::Active,
        }
    }
}

impl fmt::Display for MemoryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Progress of asynchronous entity extraction for a memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtractionStatus {
    /// Scheduled, not yet processed.
    Pending,
    /// Completed successfully.
    Done,
    /// Failed; eligible for manual re-extraction.
    Failed,
}

impl ExtractionStatus {
    /// Store-side string form.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }
}

/// Kind of mutation recorded in the audit history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HistoryAction {
    /// A memory was created.
    Add,
    /// A memory was superseded by a newer one.
    Supersede,
    /// A memory was soft-deleted.
    Delete,
    /// A memory was archived.
    Archive,
    /// A memory was paused.
    Pause,
}

impl fmt::Display for HistoryAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Add => write!(f, "ADD"),
            Self::Supersede => write!(f, "SUPERSEDE"),
            Self::Delete => write!(f, "DELETE"),
            Self::Archive => write!(f, "ARCHIVE"),
            Self::Pause => write!(f, "PAUSE"),
        }
    }
}

/// Classified intent of an incoming statement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "intent", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Intent {
    /// Persist the statement as a new fact.
    Store,
    /// Mark an existing memory as no longer true.
    Invalidate {
        /// Description of the memory to invalidate.
        target: String,
    },
    /// Remove a tracked entity, keeping its memories.
    DeleteEntity {
        /// Entity name or id.
        #[serde(rename = "entityName")]
        entity_name: String,
    },
    /// Reconfirm a memory, refreshing its recency.
    Touch {
        /// Description of the memory to touch.
        target: String,
    },
    /// Mark a tracked issue as resolved (archive it).
    Resolve {
        /// Description of the memory to resolve.
        target: String,
    },
}

impl Intent {
    /// Short name of the variant.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Store => "STORE",
            Self::Invalidate { .. } => "INVALIDATE",
            Self::DeleteEntity { .. } => "DELETE_ENTITY",
            Self::Touch { .. } => "TOUCH",
            Self::Resolve { .. } => "RESOLVE",
        }
    }
}

/// A fully hydrated memory row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryRecord {
    /// HEX32 id.
    pub id: String,
    /// Stored content (never mutated by context-window embedding).
    pub content: String,
    /// Lifecycle state.
    pub state: MemoryState,
    /// Open metadata as a JSON string.
    pub metadata: String,
    /// Free-form tags.
    pub tags: Vec<String>,
    /// Truth-time onset.
    pub valid_at: Option<DateTime<Utc>>,
    /// Truth-time end; `None` while the memory is current.
    pub invalid_at: Option<DateTime<Utc>>,
    /// Creation timestamp.
    pub created_at: Option<DateTime<Utc>>,
    /// Last update timestamp.
    pub updated_at: Option<DateTime<Utc>>,
    /// App that created the memory.
    pub app_name: Option<String>,
    /// Category labels.
    pub categories: Vec<String>,
}

impl MemoryRecord {
    /// Hydrate from a row using the standard column aliases
    /// (`id`, `content`, `state`, `metadata`, `tags`, `validAt`,
    /// `invalidAt`, `createdAt`, `updatedAt`, `appName`, `categories`).
    pub fn from_row(row: &Row) -> MemForgeResult<Self> {
        Ok(Self {
            id: row.get_string("id")?,
            content: row.get_string("content")?,
            state: MemoryState::from_str_lossy(&row.opt_string("state").unwrap_or_default()),
            metadata: row.opt_string("metadata").unwrap_or_else(|| "{}".to_string()),
            tags: row.string_list("tags"),
            valid_at: parse_timestamp(row.opt_string("validAt")),
            invalid_at: parse_timestamp(row.opt_string("invalidAt")),
            created_at: parse_timestamp(row.opt_string("createdAt")),
            updated_at: parse_timestamp(row.opt_string("updatedAt")),
            app_name: row.opt_string("appName"),
            categories: row.string_list("categories"),
        })
    }

    /// Whether the memory is currently valid.
    pub fn is_current(&self) -> bool {
        self.invalid_at.is_none()
    }
}

/// A tracked entity row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityRecord {
    /// HEX32 id.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Lowercased, trimmed name (unique per user).
    pub normalized_name: String,
    /// Canonical type label.
    pub entity_type: String,
    /// Consolidated description.
    pub description: String,
    /// Open metadata as a JSON string.
    pub metadata: String,
    /// Owning user.
    pub user_id: String,
}

impl EntityRecord {
    /// Hydrate from a row using the standard column aliases.
    pub fn from_row(row: &Row) -> MemForgeResult<Self> {
        Ok(Self {
            id: row.get_string("id")?,
            name: row.opt_string("name").unwrap_or_default(),
            normalized_name: row.opt_string("normalizedName").unwrap_or_default(),
            entity_type: row.opt_string("type").unwrap_or_default(),
            description: row.opt_string("description").unwrap_or_default(),
            metadata: row.opt_string("metadata").unwrap_or_else(|| "{}".to_string()),
            user_id: row.opt_string("userId").unwrap_or_default(),
        })
    }
}

/// A hit returned by the hybrid search engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    /// Memory id.
    pub id: String,
    /// Memory content.
    pub content: String,
    /// Creation timestamp.
    pub created_at: Option<DateTime<Utc>>,
    /// Last update timestamp.
    pub updated_at: Option<DateTime<Utc>>,
    /// Creating app, if any.
    pub app_name: Option<String>,
    /// Category labels.
    pub categories: Vec<String>,
    /// Tags.
    pub tags: Vec<String>,
    /// 1-based rank in the full-text arm, if present there.
    pub text_rank: Option<usize>,
    /// 1-based rank in the vector arm, if present there.
    pub vector_rank: Option<usize>,
    /// Reciprocal-rank-fusion score.
    pub rrf_score: f64,
}

/// Parse an ISO-8601 timestamp column leniently.
pub fn parse_timestamp(raw: Option<String>) -> Option<DateTime<Utc>> {
    raw.and_then(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|dt| dt.with_timezone(&Utc))
            .ok()
    })
}

/// Normalize text for exact-duplicate comparison.
pub(crate) fn normalize_for_dedup(text: &str) -> String {
    text.trim().to_lowercase()
}
