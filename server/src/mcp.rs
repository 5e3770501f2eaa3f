//! MCP surface: `add_memories` and `search_memory` over stdio.
//!
//! The per-connection `user_id` and `client_name` are bound when the server
//! process starts (one stdio server per connected client); every tool call
//! runs inside that namespace. Tool results carry the JSON response as a
//! single text content item.

use std::borrow::Cow;
use std::sync::Arc;

use rmcp::{
    handler::server::{router::tool::ToolRouter, wrapper::Parameters},
    model::{
        CallToolResult, Content, ErrorCode, Implementation, ProtocolVersion, ServerCapabilities,
        ServerInfo,
    },
    schemars, tool, tool_handler, tool_router, ErrorData as McpError, ServerHandler, ServiceExt,
};
use serde::Deserialize;

use memforge_core::memory::{AddMemoriesRequest, SearchMemoryRequest, SessionContext};

use crate::state::AppState;

/// One statement or a list of statements.
#[derive(Debug, Clone, Deserialize, schemars::JsonSchema)]
#[serde(untagged)]
pub enum ContentArg {
    /// A single statement.
    One(String),
    /// A batch of statements, processed in order.
    Many(Vec<String>),
}

impl ContentArg {
    fn into_vec(self) -> Vec<String> {
        match self {
            Self::One(text) => vec![text],
            Self::Many(items) => items,
        }
    }
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
struct AddMemoriesParams {
    /// Statement(s) to remember, or commands like "forget about X".
    content: ContentArg,
    /// Explicit category labels for stored memories.
    categories: Option<Vec<String>>,
    /// Tags stored on created memories.
    tags: Option<Vec<String>>,
    /// Suppress automatic categorization (defaults to true when explicit
    /// categories are given).
    suppress_auto_categories: Option<bool>,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
struct SearchMemoryParams {
    /// Natural-language query; omit to browse chronologically.
    query: Option<String>,
    /// Result cap (browse default 50, search default 10).
    limit: Option<usize>,
    /// Browse-mode pagination offset.
    offset: Option<usize>,
    /// Case-insensitive category filter.
    category: Option<String>,
    /// ISO timestamp; only memories created after it.
    created_after: Option<String>,
    /// Include matching entities and their relationships.
    include_entities: Option<bool>,
    /// Case-insensitive tag filter.
    tag: Option<String>,
}

/// MCP tool host bound to one user and client.
#[derive(Clone)]
pub struct MemForgeMcpServer {
    state: Arc<AppState>,
    context: SessionContext,
    tool_router: ToolRouter<Self>,
}

#[tool_router]
impl MemForgeMcpServer {
    /// Bind the tool host to a connection identity.
    pub fn new(state: Arc<AppState>, user_id: String, client_name: String) -> Self {
        Self {
            state,
            context: SessionContext {
                user_id,
                client_name,
            },
            tool_router: Self::tool_router(),
        }
    }

    #[tool(
        description = "Store one or more statements in long-term memory. Also understands commands: 'forget about X' invalidates matching memories, 'stop tracking X' removes a tracked entity, 'X is still true' reconfirms, 'X has been fixed' resolves."
    )]
    async fn add_memories(
        &self,
        Parameters(params): Parameters<AddMemoriesParams>,
    ) -> Result<CallToolResult, McpError> {
        let request = AddMemoriesRequest {
            content: params.content.into_vec(),
            categories: params.categories,
            tags: params.tags,
            suppress_auto_categories: params.suppress_auto_categories,
        };
        let response = self
            .state
            .orchestrator
            .add_memories(&self.context, request)
            .await;
        let text = serde_json::to_string(&response).map_err(internal_error)?;
        Ok(CallToolResult::success(vec![Content::text(text)]))
    }

    #[tool(
        description = "Recall memories. With a query: relevance-ranked hybrid search with optional category/tag/date filters and entity enrichment. Without a query: chronological browse with pagination."
    )]
    async fn search_memory(
        &self,
        Parameters(params): Parameters<SearchMemoryParams>,
    ) -> Result<CallToolResult, McpError> {
        let request = SearchMemoryRequest {
            query: params.query,
            limit: params.limit,
            offset: params.offset,
            category: params.category,
            created_after: params.created_after,
            include_entities: params.include_entities,
            tag: params.tag,
        };
        let response = self
            .state
            .orchestrator
            .search_memory(&self.context, request)
            .await
            .map_err(internal_error)?;
        let text = serde_json::to_string(&response).map_err(internal_error)?;
        Ok(CallToolResult::success(vec![Content::text(text)]))
    }
}

#[tool_handler]
impl ServerHandler for MemForgeMcpServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::V_2024_11_05,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation::from_build_env(),
            instructions: Some(
                "MemForge - agentic long-term memory. \
                 Use add_memories to persist facts, preferences, decisions, and \
                 corrections; commands like 'forget about X' or 'stop tracking X' \
                 are understood. Use search_memory to recall by query, or without \
                 a query to browse recent memories."
                    .to_string(),
            ),
        }
    }
}

fn internal_error(err: impl std::fmt::Display) -> McpError {
    McpError {
        code: ErrorCode::INTERNAL_ERROR,
        message: Cow::from(err.to_string()),
        data: None,
    }
}

/// Run the MCP server over stdio until the client disconnects.
pub async fn serve(
    state: Arc<AppState>,
    user_id: String,
    client_name: String,
) -> anyhow::Result<()> {
    let server = MemForgeMcpServer::new(state, user_id, client_name);
    let service = server.serve(rmcp::transport::stdio()).await?;
    service.waiting().await?;
    Ok(())
}
